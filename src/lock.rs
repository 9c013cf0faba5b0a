use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use fs2::FileExt;

use crate::error::{Result, TrackioError};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const MAX_RETRIES: u32 = 100;

/// Cross-process mutual exclusion for one project's database.
///
/// Advisory file lock on `<trackio_dir>/<project>.lock`. The embedded store
/// serializes writers internally, but its busy-retry window is short; holding
/// this lock around every mutating transaction removes "database is locked"
/// errors when many processes write the same project.
///
/// Where the platform does not support exclusive flock (reported as
/// `Unsupported`), the lock degrades to a no-op and single-writer use is
/// assumed.
pub struct ProcessLock {
    project: String,
    path: PathBuf,
}

/// Held lock; releases on drop.
pub struct ProcessLockGuard {
    file: Option<File>,
}

impl ProcessLock {
    /// Lock keyed by project inside the tracking directory.
    pub fn in_dir(dir: &std::path::Path, project: &str) -> Self {
        Self {
            project: project.to_string(),
            path: dir.join(format!("{project}.lock")),
        }
    }

    /// Acquire the lock, retrying every 100 ms for up to 10 s.
    pub async fn acquire(&self) -> Result<ProcessLockGuard> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        let contended = fs2::lock_contended_error();
        for attempt in 0..MAX_RETRIES {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(ProcessLockGuard { file: Some(file) }),
                Err(e) if e.kind() == ErrorKind::Unsupported => {
                    tracing::debug!(
                        project = %self.project,
                        "advisory locks unsupported on this platform, proceeding unlocked"
                    );
                    return Ok(ProcessLockGuard { file: None });
                }
                Err(e) if e.raw_os_error() == contended.raw_os_error() => {
                    if attempt == MAX_RETRIES - 1 {
                        return Err(TrackioError::LockTimeout {
                            project: self.project.clone(),
                            waited_ms: u64::from(MAX_RETRIES) * RETRY_INTERVAL.as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("retry loop returns before exhausting attempts")
    }
}

impl Drop for ProcessLockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = fs2::FileExt::unlock(&file) {
                tracing::warn!(error = %e, "failed to release project lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("trackio-lock-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let dir = temp_dir();
        let lock = ProcessLock::in_dir(&dir, "p");
        let guard = lock.acquire().await.unwrap();
        drop(guard);
        // Re-acquirable after release
        let _guard = lock.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn second_handle_acquires_after_drop() {
        let dir = temp_dir();
        let first = ProcessLock::in_dir(&dir, "p");
        let second = ProcessLock::in_dir(&dir, "p");
        {
            let _g = first.acquire().await.unwrap();
        }
        let _g2 = second.acquire().await.unwrap();
    }
}
