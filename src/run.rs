use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::alerts::{self, AlertContext, AlertLevel};
use crate::codec::{self, Metrics};
use crate::config::Config;
use crate::error::{Result, TrackioError};
use crate::media::{ArtifactDescriptor, ArtifactKind, ArtifactPayload, MarkdownReport};
use crate::sender::{BatchSender, DurableBuffer};
use crate::sink::{LocalSink, LogEntry, LogSink, RemoteSink};
use crate::store::ProjectStore;
use crate::store::logs::AlertRecord;
use crate::{snapshot, sysmon};

/// Resume policy for `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeMode {
    #[default]
    Never,
    Allow,
    Must,
}

impl FromStr for ResumeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(Self::Never),
            "allow" => Ok(Self::Allow),
            "must" => Ok(Self::Must),
            other => Err(format!(
                "resume must be one of: never, allow, must (got '{other}')"
            )),
        }
    }
}

/// Options for `init`. `config` must already be a JSON object; use
/// `codec::config_object` to build one from any serializable value.
#[derive(Debug, Default)]
pub struct InitOptions {
    pub project: String,
    pub name: Option<String>,
    pub space_id: Option<String>,
    pub dataset_id: Option<String>,
    pub config: Option<JsonValue>,
    pub resume: ResumeMode,
    pub webhook_url: Option<String>,
    pub webhook_min_level: Option<AlertLevel>,
}

// Run lifecycle states. Logs are accepted only while ACTIVE.
const STATE_INITIALIZING: u8 = 0;
const STATE_ACTIVE: u8 = 1;
const STATE_FINISHING: u8 = 2;
const STATE_FINISHED: u8 = 3;

/// Wall-clock anchored to a monotonic baseline so per-run timestamps never
/// regress inside one process, even if the system clock steps.
struct RunClock {
    base_wall: DateTime<Utc>,
    base_instant: Instant,
}

impl RunClock {
    fn new() -> Self {
        Self {
            base_wall: Utc::now(),
            base_instant: Instant::now(),
        }
    }

    fn now(&self) -> String {
        let elapsed = chrono::Duration::from_std(self.base_instant.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        (self.base_wall + elapsed).to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

/// One tracked execution. The authoritative handle; the ambient slot set by
/// `init` is a convenience over it.
pub struct Run {
    project: String,
    name: String,
    store: Arc<ProjectStore>,
    sender: BatchSender,
    space_id: Option<String>,
    state: AtomicU8,
    clock: RunClock,
    webhook_url: Option<String>,
    webhook_min_level: Option<AlertLevel>,
    monitor: Mutex<Option<sysmon::MonitorHandle>>,
}

impl Run {
    /// Create (or resume) a run against the default store.
    pub async fn init(options: InitOptions) -> Result<Arc<Self>> {
        let store = shared_store();
        Self::init_with_store(options, store).await
    }

    /// Create (or resume) a run against an explicit store.
    #[tracing::instrument(skip(options, store), fields(project = %options.project), err)]
    pub async fn init_with_store(
        options: InitOptions,
        store: Arc<ProjectStore>,
    ) -> Result<Arc<Self>> {
        let cfg = Config::load();
        let project = options.project.clone();
        let existing = store.get_runs(&project).await?;

        let name = resolve_run_name(&options, &cfg, &existing)?;

        let space_id = options.space_id.clone();
        let (sink, buffer): (Arc<dyn LogSink>, Option<DurableBuffer>) = match &space_id {
            Some(space) => {
                store
                    .set_project_metadata(&project, "space_id", space)
                    .await?;
                let url = cfg.resolve_space_url(space);
                let sink = RemoteSink::new(&url, space, cfg.hf_token.clone())?;
                tracing::info!(space = %space, url = %url, "mirroring run to remote space");
                crate::reconcile::ensure_started(store.clone());
                (
                    Arc::new(sink),
                    Some(DurableBuffer {
                        store: store.clone(),
                        space_id: space.clone(),
                    }),
                )
            }
            None => (Arc::new(LocalSink::new(store.clone())), None),
        };

        if let Some(dataset_id) = &options.dataset_id {
            store
                .set_project_metadata(&project, "dataset_id", dataset_id)
                .await?;
        }
        snapshot::ensure_started(store.clone());

        let sender = BatchSender::start(&project, &name, sink, buffer, options.config);

        let run = Arc::new(Self {
            project,
            name,
            store,
            sender,
            space_id,
            state: AtomicU8::new(STATE_INITIALIZING),
            clock: RunClock::new(),
            webhook_url: options.webhook_url,
            webhook_min_level: options.webhook_min_level,
            monitor: Mutex::new(None),
        });

        if let Some(interval) = sysmon::configured_interval() {
            let handle = sysmon::start(run.clone(), interval);
            *run.monitor.lock().expect("monitor slot poisoned") = Some(handle);
        }

        run.state.store(STATE_ACTIVE, Ordering::SeqCst);
        set_current_run(run.clone());
        tracing::info!(project = %run.project, run = %run.name, "run initialized");
        Ok(run)
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<ProjectStore> {
        &self.store
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state.load(Ordering::SeqCst) == STATE_ACTIVE {
            Ok(())
        } else {
            Err(TrackioError::Other(anyhow::anyhow!(
                "run '{}' is not active; log() is only valid between init() and finish()",
                self.name
            )))
        }
    }

    /// Log a batch of metrics. Returns immediately; the batch worker ships
    /// the entry on its next tick.
    pub fn log(&self, metrics: Metrics, step: Option<i64>) -> Result<()> {
        self.ensure_active()?;
        let metrics = codec::prepare_keys(metrics)?;
        let encoded = codec::encode_metrics(&metrics)?;
        self.sender.enqueue(LogEntry {
            project: self.project.clone(),
            run: self.name.clone(),
            metrics: encoded,
            step,
            timestamp: Some(self.clock.now()),
            log_id: None,
            config: None,
        });
        Ok(())
    }

    /// Log system telemetry (timestamp x-axis, no step).
    pub fn log_system(&self, metrics: Metrics) -> Result<()> {
        self.ensure_active()?;
        let metrics = codec::prepare_keys(metrics)?;
        let encoded = codec::encode_metrics(&metrics)?;
        self.sender.enqueue_system(LogEntry {
            project: self.project.clone(),
            run: self.name.clone(),
            metrics: encoded,
            step: None,
            timestamp: Some(self.clock.now()),
            log_id: None,
            config: None,
        });
        Ok(())
    }

    /// Log a markdown report under `key`; the content is stored inline with
    /// the metric row, no file involved.
    pub fn log_report(&self, key: &str, text: &str, step: Option<i64>) -> Result<()> {
        let mut metrics = Metrics::new();
        metrics.insert(key.to_string(), MarkdownReport::new(text).into_metric_value());
        self.log(metrics, step)
    }

    /// Save a media payload and return the descriptor to embed in a metric.
    ///
    /// In remote mode the file is also queued for upload to the hosted
    /// server.
    pub async fn save_artifact(
        &self,
        kind: ArtifactKind,
        payload: ArtifactPayload,
        step: Option<i64>,
        caption: Option<String>,
    ) -> Result<ArtifactDescriptor> {
        let step = step.unwrap_or(0);
        let descriptor = self.store.media().save(
            kind,
            payload,
            &self.project,
            &self.name,
            step.max(0) as u64,
            caption,
        )?;
        if let Some(space) = &self.space_id {
            self.store
                .add_pending_upload(
                    &self.project,
                    space,
                    Some(&self.name),
                    Some(step),
                    &descriptor.file_path,
                    Some(&descriptor.file_path),
                )
                .await?;
        }
        Ok(descriptor)
    }

    /// Record an alert and, when configured, forward it to the webhook.
    ///
    /// Never fails: storage and delivery problems are logged and swallowed.
    pub async fn alert(
        &self,
        level: AlertLevel,
        title: &str,
        text: Option<&str>,
        step: Option<i64>,
    ) {
        self.alert_with(level, title, text, step, None, None).await;
    }

    /// `alert` with a per-call webhook override.
    pub async fn alert_with(
        &self,
        level: AlertLevel,
        title: &str,
        text: Option<&str>,
        step: Option<i64>,
        webhook_url: Option<&str>,
        webhook_min_level: Option<AlertLevel>,
    ) {
        let timestamp = self.clock.now();
        let record = AlertRecord {
            run_name: self.name.clone(),
            level: level.as_str().to_string(),
            title: title.to_string(),
            text: text.map(ToString::to_string),
            step,
            timestamp: timestamp.clone(),
            alert_id: Uuid::new_v4().to_string(),
        };
        if let Err(e) = self.store.add_alert(&self.project, &record).await {
            tracing::warn!(error = %e, "failed to persist alert");
        }
        let url = webhook_url.or(self.webhook_url.as_deref());
        let min_level = webhook_min_level.or(self.webhook_min_level);
        if let Some(url) = url
            && alerts::should_send_webhook(level, min_level)
        {
            alerts::send_webhook(
                url,
                &AlertContext {
                    level,
                    title,
                    text,
                    project: &self.project,
                    run: &self.name,
                    step,
                    timestamp: &timestamp,
                },
            )
            .await;
        }
    }

    /// Flush outstanding batches, stop workers, and seal the run.
    #[tracing::instrument(skip(self), fields(project = %self.project, run = %self.name))]
    pub async fn finish(&self) {
        let previous = self.state.swap(STATE_FINISHING, Ordering::SeqCst);
        if previous == STATE_FINISHING || previous == STATE_FINISHED {
            return;
        }
        let monitor = self.monitor.lock().expect("monitor slot poisoned").take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        self.sender.finish().await;
        self.state.store(STATE_FINISHED, Ordering::SeqCst);
        clear_current_run(self);
        tracing::info!("run finished");
    }
}

fn resolve_run_name(options: &InitOptions, cfg: &Config, existing: &[String]) -> Result<String> {
    let generate = || match (options.space_id.as_deref(), cfg.hosted_user()) {
        (Some(_), Some(user)) => crate::names::generate_hosted_name(user),
        _ => crate::names::generate_readable_name(),
    };

    match options.resume {
        ResumeMode::Must => {
            let Some(name) = options.name.clone() else {
                return Err(TrackioError::Other(anyhow::anyhow!(
                    "must provide a run name when resume is 'must'"
                )));
            };
            if !existing.iter().any(|r| r == &name) {
                return Err(TrackioError::RunNotFound {
                    project: options.project.clone(),
                    run: name,
                });
            }
            Ok(name)
        }
        ResumeMode::Allow => match options.name.clone() {
            Some(name) => {
                if existing.iter().any(|r| r == &name) {
                    tracing::info!(run = %name, "resuming existing run");
                }
                Ok(name)
            }
            None => Ok(generate()),
        },
        ResumeMode::Never => match options.name.clone() {
            Some(name) if !existing.iter().any(|r| r == &name) => Ok(name),
            _ => Ok(generate()),
        },
    }
}

// ---------------------------------------------------------------------------
// Process-wide ambient state
// ---------------------------------------------------------------------------

fn shared_store() -> Arc<ProjectStore> {
    static STORE: OnceLock<Arc<ProjectStore>> = OnceLock::new();
    STORE.get_or_init(|| Arc::new(ProjectStore::open_default())).clone()
}

fn current_run_slot() -> &'static Mutex<Option<Arc<Run>>> {
    static CURRENT: OnceLock<Mutex<Option<Arc<Run>>>> = OnceLock::new();
    CURRENT.get_or_init(|| Mutex::new(None))
}

fn set_current_run(run: Arc<Run>) {
    *current_run_slot().lock().expect("current run poisoned") = Some(run);
}

fn clear_current_run(run: &Run) {
    let mut slot = current_run_slot().lock().expect("current run poisoned");
    if slot
        .as_ref()
        .is_some_and(|current| std::ptr::eq(current.as_ref(), run))
    {
        *slot = None;
    }
}

/// The run set by the last `init`, if it has not finished.
pub fn current_run() -> Result<Arc<Run>> {
    current_run_slot()
        .lock()
        .expect("current run poisoned")
        .clone()
        .ok_or_else(|| TrackioError::Other(anyhow::anyhow!("call init() before logging")))
}

/// Module-level `init`: creates a run and installs it as current.
pub async fn init(options: InitOptions) -> Result<Arc<Run>> {
    Run::init(options).await
}

/// Log metrics to the current run.
pub fn log(metrics: Metrics, step: Option<i64>) -> Result<()> {
    current_run()?.log(metrics, step)
}

/// Log system telemetry to the current run.
pub fn log_system(metrics: Metrics) -> Result<()> {
    current_run()?.log_system(metrics)
}

/// Raise an alert on the current run.
pub async fn alert(
    title: &str,
    text: Option<&str>,
    level: AlertLevel,
    step: Option<i64>,
    webhook_url: Option<&str>,
    webhook_min_level: Option<AlertLevel>,
) -> Result<()> {
    let run = current_run()?;
    run.alert_with(level, title, text, step, webhook_url, webhook_min_level)
        .await;
    Ok(())
}

/// Finish the current run.
pub async fn finish() -> Result<()> {
    let run = current_run()?;
    run.finish().await;
    Ok(())
}
