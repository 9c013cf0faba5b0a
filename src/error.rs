use std::path::PathBuf;

/// Error taxonomy for the tracking engine.
///
/// `log()` and `alert()` only ever surface the hard input errors
/// (`InvalidKey`, `EncodingCycle`) before enqueueing; everything transient is
/// absorbed by the sender / reconciler.
#[derive(Debug, thiserror::Error)]
pub enum TrackioError {
    #[error("reserved metric key: {0}")]
    InvalidKey(String),

    #[error("value nesting exceeds {0} levels (cycle?)")]
    EncodingCycle(usize),

    #[error("could not acquire project lock for '{project}' within {waited_ms} ms")]
    LockTimeout { project: String, waited_ms: u64 },

    #[error("run '{run}' does not exist in project '{project}'")]
    RunNotFound { project: String, run: String },

    #[error("run '{0}' already exists")]
    RunConflict(String),

    #[error("remote sink unavailable: {0}")]
    SinkTransient(String),

    #[error("remote sink rejected batch: {0}")]
    SinkPermanent(String),

    #[error("artifact file missing: {0}")]
    ArtifactMissing(PathBuf),

    #[error("no remote configured for project '{0}'")]
    NoRemote(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error(transparent)]
    ObjectStore(#[from] opendal::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrackioError {
    /// Transient failures leave durable-buffer markers set and are retried by
    /// the reconciler; everything else surfaces to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SinkTransient(_) | Self::LockTimeout { .. })
    }
}

pub type Result<T, E = TrackioError> = std::result::Result<T, E>;
