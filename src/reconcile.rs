use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::cache::{ReconciliationCache, ScanKey, ScanResult};
use crate::config::ArchiveConfig;
use crate::domain::Timestamp;
use crate::error::ArchiveError;
use crate::fetch::backoff_delay;
use crate::inventory::{self, InventoryScan};
use crate::progress::{CancelToken, ProgressEvent, ProgressSink, ProgressThrottle};
use crate::remote::RemoteStore;
use crate::store::LocalStore;
use crate::timegrid;

const PROGRESS_MIN_GAP: Duration = Duration::from_millis(100);

/// Whether a frame absent locally should also be probed upstream before it
/// counts as missing. Probing costs one request per absent frame but keeps
/// frames the publisher never produced out of the gap set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbsencePolicy {
    #[default]
    LocalOnly,
    ProbeRemote,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    pub force_rescan: bool,
    pub absence_policy: AbsencePolicy,
}

/// Orchestrates grid derivation, inventory scanning, and the cache into the
/// authoritative missing-frame list for one [`ScanKey`].
pub struct Reconciler<R: RemoteStore> {
    config: ArchiveConfig,
    store: LocalStore,
    cache: ReconciliationCache,
    remote: R,
}

impl<R: RemoteStore> Reconciler<R> {
    pub fn new(config: ArchiveConfig, cache: ReconciliationCache, remote: R) -> Self {
        let store = LocalStore::new(config.archive_root.clone());
        Self {
            config,
            store,
            cache,
            remote,
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn cache(&self) -> &ReconciliationCache {
        &self.cache
    }

    /// Runs one scan request to completion, consulting the cache first
    /// unless a rescan is forced. Concurrent callers with the same key are
    /// collapsed onto a single compute and writeback; the rest observe the
    /// stored result.
    pub fn start_scan(
        &self,
        key: &ScanKey,
        options: ScanOptions,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<ScanResult, ArchiveError> {
        if !options.force_rescan {
            match self.cache.get(key) {
                Ok(Some(result)) => {
                    debug!(key = %key.storage_name(), "cache hit");
                    sink.event(ProgressEvent::ScanPhase {
                        message: "cache hit".to_string(),
                    });
                    return Ok(result);
                }
                Ok(None) => {}
                Err(ArchiveError::CacheClosed) => return Err(ArchiveError::CacheClosed),
                Err(err) => warn!(error = %err, "cache lookup failed, scanning uncached"),
            }
        }

        let lock = self.cache.key_lock(key);
        let _guard = lock.lock().unwrap_or_else(|err| err.into_inner());

        // Another caller may have computed this key while we waited.
        if !options.force_rescan {
            if let Ok(Some(result)) = self.cache.get(key) {
                return Ok(result);
            }
        }

        // The key lock is still held here, so the writeback must use the
        // lock-free variant.
        let result = self.compute(key, &options, cancel, sink)?;
        if let Err(err) = self.cache.put_locked(&result) {
            // The cache is advisory; a failed writeback only costs a rescan.
            warn!(error = %err, "cache writeback failed");
        }
        Ok(result)
    }

    pub fn invalidate(&self, key: &ScanKey) -> Result<(), ArchiveError> {
        self.cache.invalidate(key)
    }

    fn compute(
        &self,
        key: &ScanKey,
        options: &ScanOptions,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<ScanResult, ArchiveError> {
        sink.event(ProgressEvent::ScanPhase {
            message: "scanning local inventory".to_string(),
        });
        let product_dir = self.store.product_dir(key.satellite, key.product);
        let inventory = inventory::scan(&product_dir)?;

        let interval = if key.interval_minutes > 0 {
            key.interval_minutes
        } else {
            self.detect_interval(key, &inventory)?
        };

        let expected: Vec<Timestamp> =
            timegrid::expected(key.start, key.end, interval)?.collect();
        let total = expected.len();
        sink.event(ProgressEvent::ScanPhase {
            message: format!("reconciling {total} expected frames"),
        });

        let started = Instant::now();
        let mut throttle = ProgressThrottle::new(PROGRESS_MIN_GAP);
        let mut missing = Vec::new();
        let mut found_count = 0usize;

        for (index, timestamp) in expected.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            if inventory.found.contains(timestamp) {
                found_count += 1;
            } else {
                match options.absence_policy {
                    AbsencePolicy::LocalOnly => missing.push(*timestamp),
                    AbsencePolicy::ProbeRemote => {
                        let remote_key =
                            timegrid::remote_key(key.satellite, key.product, *timestamp);
                        if self.probe_exists(&remote_key)? {
                            missing.push(*timestamp);
                        } else {
                            // Never published upstream; not a fetchable gap.
                            debug!(key = %remote_key, "frame absent upstream");
                        }
                    }
                }
            }
            if throttle.ready() {
                sink.event(ProgressEvent::ScanProgress {
                    current: index + 1,
                    total,
                    eta: estimate_remaining(started, index + 1, total),
                });
            }
        }

        sink.event(ProgressEvent::ScanProgress {
            current: total,
            total,
            eta: None,
        });
        info!(
            expected = total,
            found = found_count,
            missing = missing.len(),
            interval,
            "scan complete"
        );

        Ok(ScanResult {
            key: *key,
            detected_interval: interval,
            missing,
            expected_count: total,
            found_count,
            completed_at: Utc::now(),
        })
    }

    /// Local samples first; an enumerable backend is the fallback source
    /// when the local archive is too thin to infer a spacing.
    fn detect_interval(
        &self,
        key: &ScanKey,
        inventory: &InventoryScan,
    ) -> Result<u32, ArchiveError> {
        let samples = inventory.sorted();
        match timegrid::detect_interval(&samples) {
            Ok(interval) => Ok(interval),
            Err(local_err) => {
                if !self.remote.supports_listing() {
                    return Err(local_err);
                }
                let prefix = timegrid::day_prefix(key.satellite, key.product, key.start);
                debug!(prefix = %prefix, "sampling remote listing for interval detection");
                let keys = self
                    .remote
                    .list(&prefix)
                    .map_err(|err| err.for_key(&prefix))?;
                let mut stamps: Vec<Timestamp> = keys
                    .iter()
                    .filter_map(|key| timegrid::timestamp_from_name(key))
                    .collect();
                stamps.sort();
                stamps.dedup();
                timegrid::detect_interval(&stamps).map_err(|_| local_err)
            }
        }
    }

    fn probe_exists(&self, remote_key: &str) -> Result<bool, ArchiveError> {
        let mut attempt = 1u32;
        loop {
            match self.remote.exists(remote_key) {
                Ok(exists) => return Ok(exists),
                Err(err) if err.is_retryable() && attempt < self.config.max_attempts => {
                    thread::sleep(backoff_delay(self.config.base_backoff(), attempt));
                    attempt += 1;
                }
                Err(err) => return Err(err.for_key(remote_key)),
            }
        }
    }
}

fn estimate_remaining(started: Instant, current: usize, total: usize) -> Option<Duration> {
    if current == 0 || total <= current {
        return None;
    }
    let per_item = started.elapsed().div_f64(current as f64);
    Some(per_item.mul_f64((total - current) as f64))
}
