use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ArchiveConfig;
use crate::domain::{Product, Satellite, Timestamp};
use crate::error::ArchiveError;
use crate::progress::{CancelToken, ProgressEvent, ProgressSink};
use crate::remote::{RemoteError, RemoteStore};
use crate::store::LocalStore;
use crate::timegrid;

/// Exponential backoff for retry attempt `attempt` (1-based): the first
/// retry waits `base`, the next `2 * base`, then `4 * base`, and so on.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    Cancelled,
}

impl FetchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FetchStatus::Succeeded | FetchStatus::Failed | FetchStatus::Cancelled
        )
    }
}

/// One frame download. Owned and mutated by a single worker; status only
/// ever moves forward (pending, in-flight, then one terminal state).
#[derive(Debug, Clone, Serialize)]
pub struct FetchTask {
    pub timestamp: Timestamp,
    pub destination: Utf8PathBuf,
    pub status: FetchStatus,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub tasks: Vec<FetchTask>,
}

/// Bounded-concurrency download pool over one remote backend. Every worker
/// clones its own backend handle; completed files land via temp-file plus
/// rename so a partial transfer is never visible as a frame.
pub struct FetchCoordinator<R: RemoteStore> {
    config: ArchiveConfig,
    store: LocalStore,
    remote: R,
}

impl<R: RemoteStore> FetchCoordinator<R> {
    pub fn new(config: ArchiveConfig, remote: R) -> Self {
        let store = LocalStore::new(config.archive_root.clone());
        Self {
            config,
            store,
            remote,
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Fetches every missing frame, interleaving by completion but always
    /// reporting the final task list in timestamp order.
    pub fn run(
        &self,
        satellite: Satellite,
        product: Product,
        missing: &[Timestamp],
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<FetchReport, ArchiveError> {
        let mut ordered: Vec<Timestamp> = missing.to_vec();
        ordered.sort();
        ordered.dedup();
        let total = ordered.len();
        if total == 0 {
            return Ok(FetchReport {
                succeeded: 0,
                failed: 0,
                cancelled: 0,
                tasks: Vec::new(),
            });
        }

        self.store.ensure_product_dir(satellite, product)?;
        let workers = self.config.concurrency.clamp(1, total);
        info!(total, workers, "starting fetch run");

        let queue: Mutex<VecDeque<usize>> = Mutex::new((0..total).collect());
        let (tx, rx) = mpsc::channel::<(usize, FetchTask)>();

        let mut tasks: Vec<FetchTask> = ordered
            .iter()
            .map(|timestamp| FetchTask {
                timestamp: *timestamp,
                destination: self.store.frame_path(satellite, product, *timestamp),
                status: FetchStatus::Pending,
                attempts: 0,
                error: None,
            })
            .collect();

        thread::scope(|scope| {
            for _ in 0..workers {
                let remote = self.remote.clone();
                let tx = tx.clone();
                let queue = &queue;
                let ordered = &ordered;
                scope.spawn(move || {
                    loop {
                        let index = queue
                            .lock()
                            .unwrap_or_else(|err| err.into_inner())
                            .pop_front();
                        let Some(index) = index else { break };
                        let task =
                            self.fetch_one(satellite, product, ordered[index], &remote, cancel, sink);
                        let _ = tx.send((index, task));
                    }
                });
            }
            drop(tx);

            let mut completed = 0usize;
            for (index, task) in rx {
                completed += 1;
                sink.event(ProgressEvent::FetchProgress { completed, total });
                tasks[index] = task;
            }
        });

        // A worker that died without reporting leaves its task pending;
        // the final report must contain terminal states only.
        for task in &mut tasks {
            if !task.status.is_terminal() {
                task.status = FetchStatus::Cancelled;
            }
        }

        let report = FetchReport {
            succeeded: tasks
                .iter()
                .filter(|task| task.status == FetchStatus::Succeeded)
                .count(),
            failed: tasks
                .iter()
                .filter(|task| task.status == FetchStatus::Failed)
                .count(),
            cancelled: tasks
                .iter()
                .filter(|task| task.status == FetchStatus::Cancelled)
                .count(),
            tasks,
        };
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled = report.cancelled,
            "fetch run finished"
        );
        Ok(report)
    }

    fn fetch_one(
        &self,
        satellite: Satellite,
        product: Product,
        timestamp: Timestamp,
        remote: &R,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> FetchTask {
        let destination = self.store.frame_path(satellite, product, timestamp);
        let remote_key = timegrid::remote_key(satellite, product, timestamp);
        let mut task = FetchTask {
            timestamp,
            destination,
            status: FetchStatus::Pending,
            attempts: 0,
            error: None,
        };

        if cancel.is_cancelled() {
            task.status = FetchStatus::Cancelled;
            sink.event(ProgressEvent::FetchStatus {
                timestamp,
                status: task.status,
                attempts: task.attempts,
            });
            return task;
        }

        task.status = FetchStatus::InFlight;
        sink.event(ProgressEvent::FetchStatus {
            timestamp,
            status: task.status,
            attempts: task.attempts,
        });

        loop {
            task.attempts += 1;
            match self.try_fetch(remote, &remote_key, &task.destination, cancel) {
                Ok(bytes) => {
                    debug!(key = %remote_key, bytes, "frame stored");
                    task.status = FetchStatus::Succeeded;
                    break;
                }
                Err(err)
                    if err.is_retryable()
                        && task.attempts < self.config.max_attempts
                        && !cancel.is_cancelled() =>
                {
                    warn!(key = %remote_key, attempt = task.attempts, error = %err, "retrying");
                    thread::sleep(backoff_delay(self.config.base_backoff(), task.attempts));
                }
                Err(RemoteError::Cancelled) => {
                    task.status = FetchStatus::Cancelled;
                    task.error = Some("cancelled mid-transfer".to_string());
                    break;
                }
                // A retryable failure observed after cancellation is an
                // abort, not a verdict on the frame.
                Err(err) if err.is_retryable() && cancel.is_cancelled() => {
                    task.status = FetchStatus::Cancelled;
                    task.error = Some(err.to_string());
                    break;
                }
                Err(err) => {
                    warn!(key = %remote_key, error = %err, "fetch failed");
                    task.status = FetchStatus::Failed;
                    task.error = Some(err.to_string());
                    break;
                }
            }
        }

        sink.event(ProgressEvent::FetchStatus {
            timestamp,
            status: task.status,
            attempts: task.attempts,
        });
        task
    }

    /// Streams into a temp file next to the destination and renames on
    /// success. A failed or cancelled transfer drops the temp file.
    fn try_fetch(
        &self,
        remote: &R,
        remote_key: &str,
        destination: &Utf8Path,
        cancel: &CancelToken,
    ) -> Result<u64, RemoteError> {
        let temp = LocalStore::temp_for(destination)
            .map_err(|err| RemoteError::LocalWrite(err.to_string()))?;
        let bytes = remote.fetch(remote_key, temp.path(), cancel)?;
        LocalStore::persist(temp, destination)
            .map_err(|err| RemoteError::LocalWrite(err.to_string()))?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(200);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(800));
    }

    #[test]
    fn terminal_states() {
        assert!(FetchStatus::Succeeded.is_terminal());
        assert!(FetchStatus::Cancelled.is_terminal());
        assert!(!FetchStatus::InFlight.is_terminal());
        assert!(!FetchStatus::Pending.is_terminal());
    }
}
