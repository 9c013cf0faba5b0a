use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::codec::{MetricValue, Metrics};
use crate::run::Run;

/// Sampling interval from `TRACKIO_SYSTEM_MONITOR` (seconds). Unset or 0
/// disables the monitor.
pub fn configured_interval() -> Option<Duration> {
    let raw = std::env::var("TRACKIO_SYSTEM_MONITOR").ok()?;
    let secs: u64 = raw.parse().ok()?;
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Handle to a running monitor; stops within one poll period.
pub struct MonitorHandle {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}

/// Start sampling host/process telemetry into the run's system channel.
pub fn start(run: Arc<Run>, interval: Duration) -> MonitorHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut sampler = Sampler::new();
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                () = tokio::time::sleep(interval) => {
                    let metrics = sampler.sample();
                    if !metrics.is_empty()
                        && let Err(e) = run.log_system(metrics)
                    {
                        tracing::debug!(error = %e, "system monitor sample dropped");
                        break;
                    }
                }
            }
        }
    });
    MonitorHandle { stop_tx, handle }
}

// ---------------------------------------------------------------------------
// Sampling (procfs; other platforms produce no samples)
// ---------------------------------------------------------------------------

struct Sampler {
    #[cfg(target_os = "linux")]
    last_cpu: Option<(std::time::Instant, u64)>,
}

impl Sampler {
    fn new() -> Self {
        Self {
            #[cfg(target_os = "linux")]
            last_cpu: None,
        }
    }

    #[cfg(target_os = "linux")]
    fn sample(&mut self) -> Metrics {
        let mut metrics = Metrics::new();
        if let Some(rss_mb) = read_rss_mb() {
            metrics.insert("memory_rss_mb".into(), MetricValue::Float(rss_mb));
        }
        if let Some(percent) = self.cpu_percent() {
            metrics.insert("cpu_percent".into(), MetricValue::Float(percent));
        }
        metrics
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&mut self) -> Metrics {
        Metrics::new()
    }

    #[cfg(target_os = "linux")]
    fn cpu_percent(&mut self) -> Option<f64> {
        let ticks = read_cpu_ticks()?;
        let now = std::time::Instant::now();
        let percent = self.last_cpu.map(|(last_at, last_ticks)| {
            let elapsed = now.duration_since(last_at).as_secs_f64();
            if elapsed <= 0.0 {
                return 0.0;
            }
            // USER_HZ is 100 on mainstream kernel configs
            let used = ticks.saturating_sub(last_ticks) as f64 / 100.0;
            (used / elapsed) * 100.0
        });
        self.last_cpu = Some((now, ticks));
        percent
    }
}

#[cfg(target_os = "linux")]
fn read_rss_mb() -> Option<f64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = 4096.0;
    Some(rss_pages * page_size / (1024.0 * 1024.0))
}

#[cfg(target_os = "linux")]
fn read_cpu_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Fields after the parenthesized comm; utime and stime are fields 14, 15
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}
