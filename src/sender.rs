use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::TrackioError;
use crate::sink::{LogEntry, LogSink};
use crate::store::ProjectStore;
use crate::store::logs::{MetricRecord, SystemMetricRecord};
use crate::store::sync::PendingTable;

/// Flush cadence of the background worker.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// How long `finish()` waits for the worker before abandoning it.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// When the sink is remote, batches are first committed to the local store
/// with delivery markers set; the markers are cleared on ack.
pub struct DurableBuffer {
    pub store: Arc<ProjectStore>,
    pub space_id: String,
}

struct Shared {
    project: String,
    run: String,
    pending: Mutex<Vec<LogEntry>>,
    pending_system: Mutex<Vec<LogEntry>>,
    initial_config: Mutex<Option<JsonValue>>,
    sink: Arc<dyn LogSink>,
    buffer: Option<DurableBuffer>,
    // Serializes the worker's timer flush against the final flush in
    // `finish()`; without it two in-flight batches could commit out of order.
    flush_gate: tokio::sync::Mutex<()>,
}

/// Per-run background worker that coalesces `log()` calls into batches.
///
/// The foreground path only appends to an in-memory list under a short lock;
/// all I/O happens on the worker's 500 ms cadence or in the final flush that
/// `finish()` performs before joining.
pub struct BatchSender {
    shared: Arc<Shared>,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BatchSender {
    pub fn start(
        project: &str,
        run: &str,
        sink: Arc<dyn LogSink>,
        buffer: Option<DurableBuffer>,
        initial_config: Option<JsonValue>,
    ) -> Self {
        let shared = Arc::new(Shared {
            project: project.to_string(),
            run: run.to_string(),
            pending: Mutex::new(Vec::new()),
            pending_system: Mutex::new(Vec::new()),
            initial_config: Mutex::new(initial_config),
            sink,
            buffer,
            flush_gate: tokio::sync::Mutex::new(()),
        });
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let worker_shared = shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    () = tokio::time::sleep(FLUSH_INTERVAL) => {
                        flush(&worker_shared).await;
                    }
                }
            }
        });
        Self {
            shared,
            stop_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Append one metric entry. Never blocks on I/O.
    pub fn enqueue(&self, mut entry: LogEntry) {
        if self.shared.buffer.is_some() && entry.log_id.is_none() {
            entry.log_id = Some(Uuid::new_v4().to_string());
        }
        self.shared
            .pending
            .lock()
            .expect("sender queue poisoned")
            .push(entry);
    }

    /// Append one system metric entry.
    pub fn enqueue_system(&self, mut entry: LogEntry) {
        if self.shared.buffer.is_some() && entry.log_id.is_none() {
            entry.log_id = Some(Uuid::new_v4().to_string());
        }
        self.shared
            .pending_system
            .lock()
            .expect("sender queue poisoned")
            .push(entry);
    }

    /// Entries still queued (empty after a completed `finish`).
    pub fn queued(&self) -> usize {
        self.shared.pending.lock().expect("sender queue poisoned").len()
            + self
                .shared
                .pending_system
                .lock()
                .expect("sender queue poisoned")
                .len()
    }

    /// Stop the worker, flush what remains, and join with a bounded wait.
    pub async fn finish(&self) {
        let _ = self.stop_tx.send(true);
        flush(&self.shared).await;
        let handle = self.handle.lock().expect("sender handle poisoned").take();
        if let Some(handle) = handle
            && tokio::time::timeout(JOIN_TIMEOUT, handle).await.is_err()
        {
            tracing::warn!(
                project = %self.shared.project,
                run = %self.shared.run,
                "batch worker did not stop within the join deadline"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Flush paths
// ---------------------------------------------------------------------------

async fn flush(shared: &Shared) {
    let _gate = shared.flush_gate.lock().await;
    flush_metrics(shared).await;
    flush_system(shared).await;
}

fn drain(queue: &Mutex<Vec<LogEntry>>) -> Vec<LogEntry> {
    std::mem::take(&mut *queue.lock().expect("sender queue poisoned"))
}

fn requeue(queue: &Mutex<Vec<LogEntry>>, batch: Vec<LogEntry>) {
    let mut pending = queue.lock().expect("sender queue poisoned");
    let tail = std::mem::take(&mut *pending);
    *pending = batch.into_iter().chain(tail).collect();
}

async fn flush_metrics(shared: &Shared) {
    let mut batch = drain(&shared.pending);
    let config = shared
        .initial_config
        .lock()
        .expect("sender config poisoned")
        .take();
    if batch.is_empty() && config.is_none() {
        return;
    }

    match &shared.buffer {
        Some(buffer) => {
            // Durable buffer first: commit locally with markers, mirror the
            // assigned steps onto the wire entries, then attempt the remote.
            let records: Vec<MetricRecord> = batch
                .iter()
                .map(|e| MetricRecord {
                    metrics: e.metrics.clone(),
                    step: e.step,
                    timestamp: e.timestamp.clone(),
                    log_id: e.log_id.clone(),
                })
                .collect();
            let steps = match buffer
                .store
                .bulk_log(
                    &shared.project,
                    &shared.run,
                    &records,
                    config.as_ref(),
                    Some(&buffer.space_id),
                )
                .await
            {
                Ok(steps) => steps,
                Err(e) => {
                    tracing::warn!(error = %e, "durable buffer write failed, retrying next tick");
                    *shared
                        .initial_config
                        .lock()
                        .expect("sender config poisoned") = config;
                    requeue(&shared.pending, batch);
                    return;
                }
            };
            for (entry, step) in batch.iter_mut().zip(steps) {
                entry.step = Some(step);
            }
            if let Some(config) = config
                && let Some(first) = batch.first_mut()
            {
                first.config = Some(config);
            }

            let log_ids: Vec<String> =
                batch.iter().filter_map(|e| e.log_id.clone()).collect();
            match shared.sink.bulk_log(batch).await {
                Ok(()) => {
                    if let Err(e) = buffer
                        .store
                        .clear_markers_by_log_id(&shared.project, PendingTable::Metrics, &log_ids)
                        .await
                    {
                        tracing::warn!(error = %e, "failed to clear delivery markers");
                    }
                }
                Err(e) => log_sink_failure(&e, "metrics batch left in durable buffer"),
            }
        }
        None => {
            if let Some(config) = config
                && let Some(first) = batch.first_mut()
            {
                first.config = Some(config);
            }
            if let Err(e) = shared.sink.bulk_log(batch.clone()).await {
                if e.is_transient() {
                    tracing::warn!(error = %e, "local commit contended, retrying next tick");
                    requeue(&shared.pending, batch);
                } else {
                    tracing::error!(error = %e, "dropping metrics batch after fatal store error");
                }
            }
        }
    }
}

async fn flush_system(shared: &Shared) {
    let batch = drain(&shared.pending_system);
    if batch.is_empty() {
        return;
    }

    match &shared.buffer {
        Some(buffer) => {
            let records: Vec<SystemMetricRecord> = batch
                .iter()
                .map(|e| SystemMetricRecord {
                    metrics: e.metrics.clone(),
                    timestamp: e.timestamp.clone(),
                    log_id: e.log_id.clone(),
                })
                .collect();
            if let Err(e) = buffer
                .store
                .bulk_log_system(
                    &shared.project,
                    &shared.run,
                    &records,
                    Some(&buffer.space_id),
                )
                .await
            {
                tracing::warn!(error = %e, "durable buffer write failed, retrying next tick");
                requeue(&shared.pending_system, batch);
                return;
            }
            let log_ids: Vec<String> =
                batch.iter().filter_map(|e| e.log_id.clone()).collect();
            match shared.sink.bulk_log_system(batch).await {
                Ok(()) => {
                    if let Err(e) = buffer
                        .store
                        .clear_markers_by_log_id(
                            &shared.project,
                            PendingTable::SystemMetrics,
                            &log_ids,
                        )
                        .await
                    {
                        tracing::warn!(error = %e, "failed to clear delivery markers");
                    }
                }
                Err(e) => log_sink_failure(&e, "system batch left in durable buffer"),
            }
        }
        None => {
            if let Err(e) = shared.sink.bulk_log_system(batch.clone()).await {
                if e.is_transient() {
                    requeue(&shared.pending_system, batch);
                } else {
                    tracing::error!(error = %e, "dropping system batch after fatal store error");
                }
            }
        }
    }
}

fn log_sink_failure(error: &TrackioError, context: &str) {
    if error.is_transient() {
        tracing::warn!(error = %error, "{context}");
    } else {
        tracing::error!(error = %error, "{context}");
    }
}
