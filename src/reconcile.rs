use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::watch;

use crate::config::Config;
use crate::error::{Result, TrackioError};
use crate::sink::{LogEntry, LogSink, RemoteSink, UploadMediaRequest};
use crate::store::ProjectStore;
use crate::store::sync::{PendingLog, PendingTable};

/// Default cadence of the opportunistic background drain.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// What one reconcile pass delivered.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncOutcome {
    pub logs_sent: usize,
    pub system_sent: usize,
    pub uploads_sent: usize,
}

impl SyncOutcome {
    pub fn is_empty(&self) -> bool {
        self.logs_sent == 0 && self.system_sent == 0 && self.uploads_sent == 0
    }
}

/// Replays the durable buffer to the remote sink once it is reachable.
///
/// Within a run, rows replay in ascending step order; across runs no order
/// is promised. `log_id` uniqueness on the remote side absorbs retries.
pub struct Reconciler {
    store: Arc<ProjectStore>,
}

impl Reconciler {
    pub fn new(store: Arc<ProjectStore>) -> Self {
        Self { store }
    }

    /// Drain one project to its configured (or overridden) remote.
    #[tracing::instrument(skip(self), err)]
    pub async fn sync_project(
        &self,
        project: &str,
        space_override: Option<&str>,
        force: bool,
    ) -> Result<SyncOutcome> {
        let space_id = match space_override {
            Some(space) => space.to_string(),
            None => self
                .store
                .get_space_id(project)
                .await?
                .ok_or_else(|| TrackioError::NoRemote(project.to_string()))?,
        };
        if space_override.is_some() {
            self.store
                .set_project_metadata(project, "space_id", &space_id)
                .await?;
        }
        let cfg = Config::load();
        let sink = RemoteSink::new(
            &cfg.resolve_space_url(&space_id),
            &space_id,
            cfg.hf_token.clone(),
        )?;
        if force {
            self.force_resend(project, &sink).await?;
        }
        self.drain_to(project, &sink).await
    }

    /// Drain every project that has a configured remote and pending data.
    pub async fn sync_all(&self) -> Result<Vec<(String, SyncOutcome)>> {
        let mut outcomes = Vec::new();
        for project in self.store.get_projects() {
            let Some(_space) = self.store.get_space_id(&project).await? else {
                continue;
            };
            if !self.store.has_pending_data(&project).await? {
                continue;
            }
            match self.sync_project(&project, None, false).await {
                Ok(outcome) => outcomes.push((project, outcome)),
                Err(e) if e.is_transient() => {
                    tracing::warn!(project, error = %e, "remote unreachable, will retry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    /// Drain one project's durable buffer into the given sink.
    pub async fn drain_to(&self, project: &str, sink: &RemoteSink) -> Result<SyncOutcome> {
        let mut outcome = SyncOutcome::default();

        if let Some((pending, _space)) = self.store.get_pending_logs(project).await? {
            outcome.logs_sent += self
                .replay(project, sink, pending, PendingTable::Metrics)
                .await?;
        }
        if let Some((pending, _space)) = self.store.get_pending_system_logs(project).await? {
            outcome.system_sent += self
                .replay(project, sink, pending, PendingTable::SystemMetrics)
                .await?;
        }
        outcome.uploads_sent += self.drain_uploads(project, sink).await?;
        Ok(outcome)
    }

    /// Resubmit marked rows per run; clear markers only after the ack.
    async fn replay(
        &self,
        project: &str,
        sink: &RemoteSink,
        pending: Vec<PendingLog>,
        table: PendingTable,
    ) -> Result<usize> {
        let mut per_run: BTreeMap<String, Vec<PendingLog>> = BTreeMap::new();
        for row in pending {
            per_run.entry(row.run.clone()).or_default().push(row);
        }

        let mut sent = 0;
        for (run, rows) in per_run {
            let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
            let entries: Vec<LogEntry> = rows
                .into_iter()
                .map(|row| LogEntry {
                    project: project.to_string(),
                    run: run.clone(),
                    metrics: row.metrics,
                    step: row.step,
                    timestamp: Some(row.timestamp),
                    log_id: row.log_id,
                    config: None,
                })
                .collect();
            let count = entries.len();
            let result = match table {
                PendingTable::Metrics => sink.bulk_log(entries).await,
                PendingTable::SystemMetrics => sink.bulk_log_system(entries).await,
            };
            match result {
                Ok(()) => {
                    self.store
                        .clear_pending_markers(project, table, &ids)
                        .await?;
                    sent += count;
                }
                Err(e) if matches!(e, TrackioError::SinkPermanent(_)) => {
                    // Rows stay marked and keep surfacing in `status`;
                    // dropping them requires explicit user action.
                    tracing::warn!(project, run = %run, error = %e, "remote rejected batch");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }

    /// POST pending media files to the hosted server's upload endpoint.
    ///
    /// Records are cleared only after the server acks; a transient failure
    /// stops the pass and leaves the rest for the next tick.
    async fn drain_uploads(&self, project: &str, sink: &RemoteSink) -> Result<usize> {
        let Some((uploads, _space)) = self.store.get_pending_uploads(project).await? else {
            return Ok(0);
        };
        let mut delivered: Vec<i64> = Vec::new();
        for upload in &uploads {
            let local = self.store.media().root().join(&upload.file_path);
            if !local.exists() {
                tracing::warn!(
                    project,
                    file = %upload.file_path,
                    "pending upload file missing, dropping record"
                );
                delivered.push(upload.id);
                continue;
            }
            let relative = upload
                .relative_path
                .as_deref()
                .unwrap_or(&upload.file_path);
            let bytes = std::fs::read(&local)?;
            let request =
                UploadMediaRequest::new(project, upload.run.as_deref(), upload.step, relative, &bytes);
            match sink.upload_media(&request).await {
                Ok(()) => delivered.push(upload.id),
                Err(e) if matches!(e, TrackioError::SinkPermanent(_)) => {
                    // Record stays and keeps surfacing in `status`
                    tracing::warn!(project, file = %upload.file_path, error = %e, "remote rejected media upload");
                }
                Err(e) => {
                    tracing::warn!(project, error = %e, "media upload failed, will retry");
                    break;
                }
            }
        }
        let count = delivered.len();
        self.store.clear_pending_uploads(project, &delivered).await?;
        Ok(count)
    }

    /// Force mode: resend every row, not just the marked ones. Stable
    /// `log_id`s keep the remote side deduplicated.
    async fn force_resend(&self, project: &str, sink: &RemoteSink) -> Result<()> {
        for table in [PendingTable::Metrics, PendingTable::SystemMetrics] {
            self.store.assign_log_ids(project, table).await?;
        }

        let rows = self.store.dump_metrics(project).await?;
        let mut per_run: BTreeMap<String, Vec<LogEntry>> = BTreeMap::new();
        for row in rows {
            let entry = LogEntry {
                project: project.to_string(),
                run: row.run_name.clone(),
                metrics: serde_json::from_str(&row.metrics)?,
                step: row.step,
                timestamp: Some(row.timestamp),
                log_id: row.log_id,
                config: None,
            };
            per_run.entry(row.run_name).or_default().push(entry);
        }
        for (_, mut entries) in per_run {
            entries.sort_by_key(|e| e.step);
            sink.bulk_log(entries).await?;
        }
        Ok(())
    }

    /// Opportunistic background drain, timer-driven. Started once per
    /// process when a run first targets a remote sink.
    pub async fn run_loop(self, interval: Duration, mut stop_rx: watch::Receiver<bool>) {
        tracing::info!("reconciler started");
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                () = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sync_all().await {
                        tracing::error!(error = %e, "reconcile pass failed");
                    }
                }
            }
        }
        tracing::info!("reconciler stopped");
    }
}

/// Start the process-wide reconciler once.
pub fn ensure_started(store: Arc<ProjectStore>) {
    static STARTED: OnceLock<watch::Sender<bool>> = OnceLock::new();
    STARTED.get_or_init(|| {
        let (stop_tx, stop_rx) = watch::channel(false);
        let reconciler = Reconciler::new(store);
        tokio::spawn(reconciler.run_loop(RECONCILE_INTERVAL, stop_rx));
        stop_tx
    });
}
