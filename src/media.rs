use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::codec::MetricValue;
use crate::config;
use crate::error::{Result, TrackioError};

/// Artifact kinds the dashboard knows how to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Image,
    Video,
    Audio,
    Markdown,
    Histogram,
    Table,
}

impl ArtifactKind {
    pub fn type_tag(self) -> &'static str {
        match self {
            Self::Image => "trackio.image",
            Self::Video => "trackio.video",
            Self::Audio => "trackio.audio",
            Self::Markdown => "trackio.markdown",
            Self::Histogram => "trackio.histogram",
            Self::Table => "trackio.table",
        }
    }

    pub fn default_extension(self) -> &'static str {
        match self {
            Self::Image => "png",
            Self::Video => "mp4",
            Self::Audio => "wav",
            Self::Markdown => "md",
            Self::Histogram => "json",
            Self::Table => "json",
        }
    }
}

/// The media `_type` tags whose `file_path` is rewritten when a run moves.
const MEDIA_TYPES: [&str; 3] = ["trackio.image", "trackio.video", "trackio.audio"];

/// JSON-embeddable reference to a stored media file.
///
/// `file_path` is relative to the media root so databases stay relocatable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactDescriptor {
    #[serde(rename = "_type")]
    pub type_tag: String,
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
}

impl ArtifactDescriptor {
    /// Embed the descriptor into a metrics mapping value.
    pub fn into_metric_value(self) -> MetricValue {
        let mut map = BTreeMap::new();
        map.insert("_type".into(), MetricValue::Str(self.type_tag));
        map.insert("file_path".into(), MetricValue::Str(self.file_path));
        if let Some(fmt) = self.file_format {
            map.insert("file_format".into(), MetricValue::Str(fmt));
        }
        if let Some(caption) = self.caption {
            map.insert("caption".into(), MetricValue::Str(caption));
        }
        if let Some(rate) = self.sample_rate {
            map.insert("sample_rate".into(), MetricValue::Int(i64::from(rate)));
        }
        if let Some(fps) = self.fps {
            map.insert("fps".into(), MetricValue::Int(i64::from(fps)));
        }
        MetricValue::Map(map)
    }
}

/// Media payload handed to `save`: raw bytes, or a file to copy in.
pub enum ArtifactPayload {
    Bytes { data: Vec<u8>, extension: String },
    File(PathBuf),
}

/// A markdown report logged as a metric value. Unlike file-backed artifacts
/// the content travels inline under `_value`; nothing touches the media root.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkdownReport {
    pub text: String,
}

impl MarkdownReport {
    pub const TYPE: &'static str = "trackio.markdown";

    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Embed the report into a metrics mapping value as
    /// `{_type: "trackio.markdown", _value: <text>}`.
    pub fn into_metric_value(self) -> MetricValue {
        let mut map = BTreeMap::new();
        map.insert("_type".into(), MetricValue::Str(Self::TYPE.into()));
        map.insert("_value".into(), MetricValue::Str(self.text));
        MetricValue::Map(map)
    }
}

// ---------------------------------------------------------------------------
// Artifact store
// ---------------------------------------------------------------------------

/// Content store for media artifacts.
///
/// Layout: `<media_root>/<project>/<run>/<step>/<uuid>.<ext>`. Filenames are
/// fresh UUIDs, so concurrent writers never need inter-file locking.
pub struct ArtifactStore {
    root: PathBuf,
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new(config::media_dir())
    }
}

impl ArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a payload and return the descriptor to embed in a metric.
    pub fn save(
        &self,
        kind: ArtifactKind,
        payload: ArtifactPayload,
        project: &str,
        run: &str,
        step: u64,
        caption: Option<String>,
    ) -> Result<ArtifactDescriptor> {
        let (bytes, extension) = match payload {
            ArtifactPayload::Bytes { data, extension } => (data, extension),
            ArtifactPayload::File(path) => {
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or(kind.default_extension())
                    .to_string();
                (fs::read(&path)?, ext)
            }
        };

        let relative = PathBuf::from(project)
            .join(run)
            .join(step.to_string())
            .join(format!("{}.{extension}", Uuid::new_v4()));
        let absolute = self.root.join(&relative);
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&absolute, bytes)?;

        Ok(ArtifactDescriptor {
            type_tag: kind.type_tag().to_string(),
            file_path: relative.to_string_lossy().replace('\\', "/"),
            file_format: Some(extension),
            caption,
            sample_rate: None,
            fps: None,
        })
    }

    /// Resolve a descriptor to an absolute path, failing if the file is gone.
    pub fn resolve(&self, descriptor: &ArtifactDescriptor) -> Result<PathBuf> {
        let absolute = self.root.join(&descriptor.file_path);
        if !absolute.is_file() {
            return Err(TrackioError::ArtifactMissing(absolute));
        }
        Ok(absolute)
    }

    /// Move a run's media directory to a new project/run location.
    ///
    /// Descriptor rewriting inside stored metrics is the store's job; this
    /// only relocates the files.
    pub fn move_run(
        &self,
        project: &str,
        run: &str,
        new_project: &str,
        new_run: &str,
    ) -> Result<()> {
        let source = self.root.join(project).join(run);
        if !source.exists() {
            return Ok(());
        }
        let target = self.root.join(new_project).join(new_run);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&source, &target)?;
        // Leave no empty project directory behind
        if let Some(parent) = source.parent()
            && parent.read_dir().map(|mut d| d.next().is_none()).unwrap_or(false)
        {
            let _ = fs::remove_dir(parent);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Descriptor rewriting
// ---------------------------------------------------------------------------

/// Rewrite `file_path` prefixes of media descriptors inside a stored metrics
/// JSON tree. Returns the rewritten tree.
pub fn rewrite_media_prefixes(value: JsonValue, old_prefix: &str, new_prefix: &str) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let is_media = map
                .get("_type")
                .and_then(JsonValue::as_str)
                .is_some_and(|t| MEDIA_TYPES.contains(&t));
            if is_media {
                let mut map = map;
                if let Some(JsonValue::String(path)) = map.get("file_path") {
                    let normalized = path.replace('\\', "/");
                    if let Some(rest) = normalized.strip_prefix(old_prefix) {
                        map.insert(
                            "file_path".into(),
                            JsonValue::String(format!("{new_prefix}{rest}")),
                        );
                    }
                }
                JsonValue::Object(map)
            } else {
                JsonValue::Object(
                    map.into_iter()
                        .map(|(k, v)| (k, rewrite_media_prefixes(v, old_prefix, new_prefix)))
                        .collect(),
                )
            }
        }
        JsonValue::Array(items) => JsonValue::Array(
            items
                .into_iter()
                .map(|v| rewrite_media_prefixes(v, old_prefix, new_prefix))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> ArtifactStore {
        let root = std::env::temp_dir().join(format!("trackio-media-{}", Uuid::new_v4()));
        ArtifactStore::new(root)
    }

    #[test]
    fn save_and_resolve_bytes() {
        let store = temp_store();
        let descriptor = store
            .save(
                ArtifactKind::Image,
                ArtifactPayload::Bytes {
                    data: vec![1, 2, 3],
                    extension: "png".into(),
                },
                "proj",
                "run",
                0,
                Some("a caption".into()),
            )
            .unwrap();
        assert_eq!(descriptor.type_tag, "trackio.image");
        assert!(descriptor.file_path.starts_with("proj/run/0/"));
        assert!(descriptor.file_path.ends_with(".png"));
        let resolved = store.resolve(&descriptor).unwrap();
        assert_eq!(fs::read(resolved).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn resolve_missing_file_fails() {
        let store = temp_store();
        let descriptor = ArtifactDescriptor {
            type_tag: "trackio.image".into(),
            file_path: "p/r/0/gone.png".into(),
            file_format: None,
            caption: None,
            sample_rate: None,
            fps: None,
        };
        assert!(matches!(
            store.resolve(&descriptor),
            Err(TrackioError::ArtifactMissing(_))
        ));
    }

    #[test]
    fn move_run_relocates_files() {
        let store = temp_store();
        let descriptor = store
            .save(
                ArtifactKind::Image,
                ArtifactPayload::Bytes {
                    data: vec![9],
                    extension: "png".into(),
                },
                "src",
                "r",
                0,
                None,
            )
            .unwrap();
        store.move_run("src", "r", "dst", "r").unwrap();
        assert!(!store.root().join("src").join("r").exists());
        let filename = Path::new(&descriptor.file_path).file_name().unwrap();
        assert!(store.root().join("dst/r/0").join(filename).exists());
    }

    #[test]
    fn markdown_reports_carry_content_inline() {
        let value = MarkdownReport::new("## results\nall good").into_metric_value();
        let MetricValue::Map(map) = &value else {
            panic!("report is not a map");
        };
        assert_eq!(map.get("_type"), Some(&MetricValue::Str("trackio.markdown".into())));
        assert_eq!(
            map.get("_value"),
            Some(&MetricValue::Str("## results\nall good".into()))
        );
        assert!(!map.contains_key("file_path"));
    }

    #[test]
    fn rewrite_touches_only_media_descriptors() {
        let stored = serde_json::json!({
            "img": {"_type": "trackio.image", "file_path": "src/r/0/a.png"},
            "tbl": {"_type": "trackio.table", "file_path": "src/r/0/t.json"},
            "loss": 0.5,
        });
        let rewritten = rewrite_media_prefixes(stored, "src/r/", "dst/r/");
        assert_eq!(rewritten["img"]["file_path"], "dst/r/0/a.png");
        assert_eq!(rewritten["tbl"]["file_path"], "src/r/0/t.json");
        assert_eq!(rewritten["loss"], 0.5);
    }
}
