pub mod alerts;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod lock;
pub mod media;
pub mod names;
pub mod reconcile;
pub mod run;
pub mod sender;
pub mod server;
pub mod sink;
pub mod snapshot;
pub mod store;
pub mod sysmon;

pub use alerts::AlertLevel;
pub use codec::{MetricValue, Metrics};
pub use error::{Result, TrackioError};
pub use media::{ArtifactDescriptor, ArtifactKind, ArtifactPayload, MarkdownReport};
pub use run::{InitOptions, ResumeMode, Run, alert, finish, init, log, log_system};
