use std::collections::HashMap;
use std::sync::Mutex;

use rand::prelude::IndexedRandom;

static ADJECTIVES: &[&str] = &[
    "dainty", "brave", "calm", "eager", "fancy", "gentle", "happy", "jolly", "kind", "lively",
    "merry", "nice", "proud", "quick", "silly", "tidy", "witty", "zealous", "bright", "shy",
    "bold", "clever", "daring", "elegant", "faithful", "graceful", "honest", "inventive",
    "jovial", "keen", "lucky", "modest", "noble", "patient", "quirky", "sincere", "thoughtful",
    "upbeat", "valiant", "warm", "youthful", "zesty", "breezy", "cheerful", "energetic",
    "fearless", "hopeful", "joyful", "luminous", "mysterious", "neat", "playful", "radiant",
    "spirited", "tranquil", "vivid", "wise", "zany", "bubbly", "charming", "dazzling",
    "earnest", "festive", "hearty", "intrepid", "jubilant", "nimble", "orderly", "peaceful",
    "robust", "sturdy", "trusty", "vibrant", "whimsical",
];

static NOUNS: &[&str] = &[
    "sunset", "forest", "river", "mountain", "breeze", "meadow", "ocean", "valley", "sky",
    "field", "cloud", "star", "rain", "leaf", "stone", "flower", "bird", "tree", "wave",
    "trail", "island", "desert", "hill", "lake", "pond", "grove", "canyon", "reef", "bay",
    "peak", "glade", "marsh", "cliff", "dune", "spring", "brook", "cave", "plain", "ridge",
    "wood", "blossom", "petal", "root", "branch", "seed", "acorn", "pine", "willow", "cedar",
    "elm", "falcon", "eagle", "sparrow", "robin", "owl", "finch", "heron", "crane", "swan",
    "fox", "wolf", "bear", "deer", "otter", "beaver", "lynx", "hare", "badger", "butterfly",
    "firefly", "coral", "shell", "pebble", "boulder", "tide", "current",
];

// Per-process counter so repeated draws of the same pair stay unique.
static NAME_COUNTER: Mutex<Option<HashMap<String, u64>>> = Mutex::new(None);

/// Generate a readable run name like `dainty-sunset-0`.
///
/// The numeric suffix counts per adjective-noun pair within this process.
pub fn generate_readable_name() -> String {
    let mut rng = rand::rng();
    let base = format!(
        "{}-{}",
        ADJECTIVES.choose(&mut rng).unwrap_or(&"brave"),
        NOUNS.choose(&mut rng).unwrap_or(&"river"),
    );
    let mut counter = NAME_COUNTER.lock().expect("name counter poisoned");
    let map = counter.get_or_insert_with(HashMap::new);
    let n = map.entry(base.clone()).or_insert(0);
    let name = format!("{base}-{n}");
    *n += 1;
    name
}

/// Generate a run name for hosted mode, where the sink supplies an identity.
pub fn generate_hosted_name(user: &str) -> String {
    format!("{user}-{}", chrono::Utc::now().timestamp())
}

/// Strip a project name down to `[A-Za-z0-9_-]`; empty results fall back to
/// `"default"`.
pub fn sanitize_project_name(project: &str) -> String {
    let safe: String = project
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if safe.is_empty() {
        "default".to_string()
    } else {
        safe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_are_unique_per_pair() {
        let names: Vec<String> = (0..50).map(|_| generate_readable_name()).collect();
        let unique: std::collections::HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn sanitize_strips_illegal_characters() {
        assert_eq!(sanitize_project_name("my proj/2024!"), "myproj2024");
        assert_eq!(sanitize_project_name("ok_name-1"), "ok_name-1");
        assert_eq!(sanitize_project_name("///"), "default");
        assert_eq!(sanitize_project_name(""), "default");
    }

    #[test]
    fn hosted_names_carry_the_user() {
        let name = generate_hosted_name("alice");
        assert!(name.starts_with("alice-"));
    }
}
