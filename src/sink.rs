use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{Result, TrackioError};
use crate::store::ProjectStore;
use crate::store::logs::{MetricRecord, SystemMetricRecord};

/// Wire form of one log entry; `metrics` is the codec-encoded JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub project: String,
    pub run: String,
    pub metrics: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<JsonValue>,
}

/// Request body of the bulk-log RPC.
#[derive(Debug, Serialize, Deserialize)]
pub struct BulkLogRequest {
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub system: bool,
}

/// Wire form of one media upload. `data` carries the file bytes
/// base64-encoded so the payload stays inside the JSON wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadMediaRequest {
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,
    pub relative_path: String,
    pub data: String,
}

impl UploadMediaRequest {
    pub fn new(
        project: &str,
        run: Option<&str>,
        step: Option<i64>,
        relative_path: &str,
        bytes: &[u8],
    ) -> Self {
        use base64::Engine as _;
        Self {
            project: project.to_string(),
            run: run.map(ToString::to_string),
            step,
            relative_path: relative_path.to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    pub fn decode_data(&self) -> Result<Vec<u8>> {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| TrackioError::Other(anyhow::anyhow!("invalid media payload: {e}")))
    }
}

/// Per-entry status in the bulk-log reply.
#[derive(Debug, Serialize, Deserialize)]
pub struct BulkLogResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_id: Option<String>,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkLogResponse {
    pub results: Vec<BulkLogResult>,
}

/// Recipient of bulk log batches: the local project store, or a hosted
/// dashboard wrapping one.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn bulk_log(&self, entries: Vec<LogEntry>) -> Result<()>;
    async fn bulk_log_system(&self, entries: Vec<LogEntry>) -> Result<()>;

    /// Identifier of the remote space, when this sink crosses the network.
    fn space_id(&self) -> Option<&str> {
        None
    }
}

// ---------------------------------------------------------------------------
// Local sink
// ---------------------------------------------------------------------------

/// Commits batches straight into the embedded store.
pub struct LocalSink {
    store: Arc<ProjectStore>,
}

impl LocalSink {
    pub fn new(store: Arc<ProjectStore>) -> Self {
        Self { store }
    }
}

/// Group wire entries by `(project, run)` preserving arrival order inside
/// each group.
pub(crate) fn group_entries(entries: Vec<LogEntry>) -> BTreeMap<(String, String), Vec<LogEntry>> {
    let mut groups: BTreeMap<(String, String), Vec<LogEntry>> = BTreeMap::new();
    for entry in entries {
        groups
            .entry((entry.project.clone(), entry.run.clone()))
            .or_default()
            .push(entry);
    }
    groups
}

#[async_trait]
impl LogSink for LocalSink {
    async fn bulk_log(&self, entries: Vec<LogEntry>) -> Result<()> {
        for ((project, run), group) in group_entries(entries) {
            let config = group.iter().find_map(|e| e.config.clone());
            let records: Vec<MetricRecord> = group
                .into_iter()
                .map(|e| MetricRecord {
                    metrics: e.metrics,
                    step: e.step,
                    timestamp: e.timestamp,
                    log_id: e.log_id,
                })
                .collect();
            self.store
                .bulk_log(&project, &run, &records, config.as_ref(), None)
                .await?;
        }
        Ok(())
    }

    async fn bulk_log_system(&self, entries: Vec<LogEntry>) -> Result<()> {
        for ((project, run), group) in group_entries(entries) {
            let records: Vec<SystemMetricRecord> = group
                .into_iter()
                .map(|e| SystemMetricRecord {
                    metrics: e.metrics,
                    timestamp: e.timestamp,
                    log_id: e.log_id,
                })
                .collect();
            self.store
                .bulk_log_system(&project, &run, &records, None)
                .await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Remote sink
// ---------------------------------------------------------------------------

/// Forwards batches to a hosted dashboard over the bulk-log RPC.
///
/// No internal retries: failed batches stay in the durable buffer and the
/// reconciler replays them.
pub struct RemoteSink {
    base_url: String,
    space_id: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl RemoteSink {
    pub fn new(base_url: &str, space_id: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TrackioError::Other(e.into()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            space_id: space_id.to_string(),
            token,
            client,
        })
    }

    #[tracing::instrument(skip(self, request), fields(count = request.logs.len()), err)]
    async fn post_bulk(&self, request: &BulkLogRequest) -> Result<()> {
        self.post_json("/api/bulk_log", request).await
    }

    /// Deliver one media file to the hosted server.
    #[tracing::instrument(skip(self, request), fields(path = %request.relative_path), err)]
    pub async fn upload_media(&self, request: &UploadMediaRequest) -> Result<()> {
        self.post_json("/api/upload_media", request).await
    }

    async fn post_json<T: serde::Serialize>(&self, path: &str, body: &T) -> Result<()> {
        let url = format!("{}{path}", self.base_url);
        let mut builder = self.client.post(&url).json(body);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| TrackioError::SinkTransient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status.as_u16() == 429 {
            Err(TrackioError::SinkTransient(format!("{status}: {body}")))
        } else {
            Err(TrackioError::SinkPermanent(format!("{status}: {body}")))
        }
    }
}

#[async_trait]
impl LogSink for RemoteSink {
    async fn bulk_log(&self, entries: Vec<LogEntry>) -> Result<()> {
        self.post_bulk(&BulkLogRequest {
            logs: entries,
            system: false,
        })
        .await
    }

    async fn bulk_log_system(&self, entries: Vec<LogEntry>) -> Result<()> {
        self.post_bulk(&BulkLogRequest {
            logs: entries,
            system: true,
        })
        .await
    }

    fn space_id(&self) -> Option<&str> {
        Some(&self.space_id)
    }
}
