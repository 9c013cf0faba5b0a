use std::env;
use std::path::PathBuf;

/// Root directory for all persistent state.
///
/// `PERSISTANT_STORAGE_ENABLED` (spelling preserved for wire compatibility)
/// switches to the hosted persistent volume.
pub fn trackio_dir() -> PathBuf {
    if let Ok(dir) = env::var("TRACKIO_DIR") {
        return PathBuf::from(dir);
    }
    if env::var("PERSISTANT_STORAGE_ENABLED").is_ok_and(|v| v == "true" || v == "1") {
        return PathBuf::from("/data/trackio");
    }
    let home = env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".cache").join("trackio")
}

/// Root directory for media artifacts, `<trackio_dir>/media`.
pub fn media_dir() -> PathBuf {
    trackio_dir().join("media")
}

#[derive(Debug, Clone)]
pub struct Config {
    pub trackio_dir: PathBuf,
    pub dataset_id: Option<String>,
    pub space_repo_name: Option<String>,
    pub space_author_name: Option<String>,
    pub hf_token: Option<String>,
    pub server_url: Option<String>,
    pub plot_order: Option<String>,
    pub color_palette: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub s3_region: String,
}

impl Config {
    pub fn load() -> Self {
        Self {
            trackio_dir: trackio_dir(),
            dataset_id: env::var("TRACKIO_DATASET_ID").ok(),
            space_repo_name: env::var("SPACE_REPO_NAME").ok(),
            space_author_name: env::var("SPACE_AUTHOR_NAME").ok(),
            hf_token: env::var("HF_TOKEN").ok(),
            server_url: env::var("TRACKIO_SERVER_URL").ok(),
            plot_order: env::var("TRACKIO_PLOT_ORDER").ok(),
            color_palette: env::var("TRACKIO_COLOR_PALETTE").ok(),
            s3_endpoint: env::var("TRACKIO_S3_ENDPOINT").ok(),
            s3_bucket: env::var("TRACKIO_S3_BUCKET").ok(),
            s3_access_key: env::var("TRACKIO_S3_ACCESS_KEY").ok(),
            s3_secret_key: env::var("TRACKIO_S3_SECRET_KEY").ok(),
            s3_region: env::var("TRACKIO_S3_REGION").unwrap_or_else(|_| "us-east-1".into()),
        }
    }

    /// True when running inside a hosted dashboard deployment.
    pub fn is_hosted(&self) -> bool {
        self.space_repo_name.is_some()
    }

    /// Identity used for generated run names in hosted mode.
    pub fn hosted_user(&self) -> Option<&str> {
        self.space_author_name.as_deref()
    }

    /// Resolve the base URL for a remote sink identified by `space_id`.
    ///
    /// `TRACKIO_SERVER_URL` overrides; otherwise `owner/name` maps onto the
    /// hosted subdomain scheme.
    pub fn resolve_space_url(&self, space_id: &str) -> String {
        if let Some(url) = &self.server_url {
            return url.clone();
        }
        if space_id.starts_with("http://") || space_id.starts_with("https://") {
            return space_id.trim_end_matches('/').to_string();
        }
        match space_id.split_once('/') {
            Some((owner, name)) => format!("https://{owner}-{name}.hf.space"),
            None => format!("https://{space_id}.hf.space"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn space_url_from_repo_id() {
        let cfg = Config {
            server_url: None,
            ..Config::load()
        };
        assert_eq!(
            cfg.resolve_space_url("alice/my-runs"),
            "https://alice-my-runs.hf.space"
        );
    }

    #[test]
    fn space_url_passthrough() {
        let cfg = Config {
            server_url: None,
            ..Config::load()
        };
        assert_eq!(
            cfg.resolve_space_url("http://127.0.0.1:7860/"),
            "http://127.0.0.1:7860"
        );
    }
}
