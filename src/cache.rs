use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{Product, Satellite, Timestamp};
use crate::error::ArchiveError;
use crate::store::LocalStore;

/// Identity of a reconciliation request. Two keys with identical fields are
/// the same request no matter when they are issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanKey {
    pub satellite: Satellite,
    pub product: Product,
    pub start: Timestamp,
    pub end: Timestamp,
    /// Zero requests interval auto-detection.
    pub interval_minutes: u32,
}

impl ScanKey {
    /// Deterministic storage name; doubles as the per-key lock identity.
    pub fn storage_name(&self) -> String {
        format!(
            "{}_{}_{}_{}_i{}.json",
            self.satellite.slug(),
            self.product.code(),
            self.start.compact(),
            self.end.compact(),
            self.interval_minutes
        )
    }
}

/// Stored outcome of one scan. Immutable once written; a force-rescan for
/// the same key overwrites it wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub key: ScanKey,
    pub detected_interval: u32,
    pub missing: Vec<Timestamp>,
    pub expected_count: usize,
    pub found_count: usize,
    pub completed_at: DateTime<Utc>,
}

/// A worker-private view onto the shared durable store. Handles are cheap,
/// but the point is the discipline: a handle is created on the thread that
/// uses it and is never handed across threads.
#[derive(Debug)]
struct CacheHandle {
    root: Utf8PathBuf,
}

impl CacheHandle {
    fn entry_path(&self, key: &ScanKey) -> Utf8PathBuf {
        self.root.join(key.storage_name())
    }

    fn read(&self, key: &ScanKey) -> Option<ScanResult> {
        let path = self.entry_path(key);
        if !path.as_std_path().exists() {
            return None;
        }
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) => {
                warn!(path = %path, error = %err, "cache entry unreadable, treating as miss");
                return None;
            }
        };
        match serde_json::from_str::<ScanResult>(&content) {
            Ok(result) => Some(result),
            Err(err) => {
                warn!(path = %path, error = %err, "cache entry corrupt, treating as miss");
                None
            }
        }
    }

    fn write(&self, result: &ScanResult) -> Result<(), ArchiveError> {
        let content = serde_json::to_vec_pretty(result)
            .map_err(|err| ArchiveError::CacheUnavailable(err.to_string()))?;
        LocalStore::write_bytes_atomic(&self.entry_path(&result.key), &content)
            .map_err(|err| ArchiveError::CacheUnavailable(err.to_string()))
    }

    fn remove(&self, key: &ScanKey) -> Result<(), ArchiveError> {
        let path = self.entry_path(key);
        if path.as_std_path().exists() {
            fs::remove_file(path.as_std_path())
                .map_err(|err| ArchiveError::CacheUnavailable(err.to_string()))?;
        }
        Ok(())
    }
}

struct CacheShared {
    root: Utf8PathBuf,
    handles: Mutex<HashMap<ThreadId, Arc<CacheHandle>>>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    closed: AtomicBool,
}

/// Durable store of prior scan results, one JSON document per [`ScanKey`].
///
/// Concurrency contract: each worker thread gets its own lazily created
/// storage handle out of a registry, mutations on the same key are
/// serialized through a keyed lock, and `close()` releases every open
/// handle exactly once. Reads against other keys are never blocked.
#[derive(Clone)]
pub struct ReconciliationCache {
    shared: Arc<CacheShared>,
}

impl ReconciliationCache {
    pub fn open(root: Utf8PathBuf) -> Result<Self, ArchiveError> {
        fs::create_dir_all(root.as_std_path())
            .map_err(|err| ArchiveError::CacheUnavailable(err.to_string()))?;
        Ok(Self {
            shared: Arc::new(CacheShared {
                root,
                handles: Mutex::new(HashMap::new()),
                key_locks: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn handle(&self) -> Result<Arc<CacheHandle>, ArchiveError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ArchiveError::CacheClosed);
        }
        let mut handles = self
            .shared
            .handles
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        let handle = handles
            .entry(thread::current().id())
            .or_insert_with(|| {
                Arc::new(CacheHandle {
                    root: self.shared.root.clone(),
                })
            })
            .clone();
        Ok(handle)
    }

    /// Lock serializing compute-and-writeback for one key. Exposed so the
    /// reconciler can collapse concurrent identical scans into one compute.
    pub fn key_lock(&self, key: &ScanKey) -> Arc<Mutex<()>> {
        let mut locks = self
            .shared
            .key_locks
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        locks
            .entry(key.storage_name())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// A miss is `Ok(None)`; unreadable and corrupt entries degrade to a
    /// miss rather than failing the scan.
    pub fn get(&self, key: &ScanKey) -> Result<Option<ScanResult>, ArchiveError> {
        Ok(self.handle()?.read(key))
    }

    pub fn put(&self, result: &ScanResult) -> Result<(), ArchiveError> {
        let handle = self.handle()?;
        let lock = self.key_lock(&result.key);
        let _guard = lock.lock().unwrap_or_else(|err| err.into_inner());
        handle.write(result)
    }

    /// Writeback for a caller that already holds the key's lock from
    /// [`ReconciliationCache::key_lock`]. The lock is not reentrant, so
    /// such a caller must not go through [`ReconciliationCache::put`].
    pub(crate) fn put_locked(&self, result: &ScanResult) -> Result<(), ArchiveError> {
        self.handle()?.write(result)
    }

    pub fn invalidate(&self, key: &ScanKey) -> Result<(), ArchiveError> {
        let handle = self.handle()?;
        let lock = self.key_lock(key);
        let _guard = lock.lock().unwrap_or_else(|err| err.into_inner());
        handle.remove(key)
    }

    /// Releases every registered handle. Idempotent; later operations fail
    /// with [`ArchiveError::CacheClosed`].
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let mut handles = self
            .shared
            .handles
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        handles.clear();
    }

    pub fn open_handles(&self) -> usize {
        self.shared
            .handles
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }
}
