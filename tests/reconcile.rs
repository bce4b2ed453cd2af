use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use sat_archive::cache::{ReconciliationCache, ScanKey};
use sat_archive::config::ArchiveConfig;
use sat_archive::domain::{Product, Satellite, Timestamp};
use sat_archive::error::ArchiveError;
use sat_archive::progress::{CancelToken, NullSink};
use sat_archive::reconcile::{AbsencePolicy, Reconciler, ScanOptions};
use sat_archive::remote::{RemoteError, RemoteStore};
use sat_archive::store::LocalStore;
use sat_archive::timegrid;

const SAT: Satellite = Satellite::Goes16;
const PROD: Product = Product::GeoColor;

#[derive(Default)]
struct MockState {
    objects: BTreeSet<String>,
    listing: Option<Vec<String>>,
    exists_calls: AtomicUsize,
    list_calls: AtomicUsize,
}

#[derive(Clone, Default)]
struct MockRemote {
    state: Arc<MockState>,
}

impl MockRemote {
    fn with_objects(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            state: Arc::new(MockState {
                objects: keys.into_iter().collect(),
                ..MockState::default()
            }),
        }
    }

    fn with_listing(keys: Vec<String>) -> Self {
        Self {
            state: Arc::new(MockState {
                listing: Some(keys),
                ..MockState::default()
            }),
        }
    }

    fn exists_calls(&self) -> usize {
        self.state.exists_calls.load(Ordering::SeqCst)
    }

    fn list_calls(&self) -> usize {
        self.state.list_calls.load(Ordering::SeqCst)
    }
}

impl RemoteStore for MockRemote {
    fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        self.state.exists_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.objects.contains(key))
    }

    fn fetch(&self, _key: &str, _dest: &Path, _cancel: &CancelToken) -> Result<u64, RemoteError> {
        unreachable!("scans never download frames")
    }

    fn supports_listing(&self) -> bool {
        self.state.listing.is_some()
    }

    fn list(&self, _prefix: &str) -> Result<Vec<String>, RemoteError> {
        self.state.list_calls.fetch_add(1, Ordering::SeqCst);
        match &self.state.listing {
            Some(keys) => Ok(keys.clone()),
            None => Err(RemoteError::Permanent {
                status: None,
                message: "listing disabled".to_string(),
            }),
        }
    }
}

struct Harness {
    _archive_dir: tempfile::TempDir,
    _cache_dir: tempfile::TempDir,
    config: ArchiveConfig,
    cache: ReconciliationCache,
}

impl Harness {
    fn new() -> Self {
        let archive_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let config = ArchiveConfig {
            archive_root: Utf8PathBuf::from_path_buf(archive_dir.path().to_path_buf()).unwrap(),
            cache_root: Utf8PathBuf::from_path_buf(cache_dir.path().to_path_buf()).unwrap(),
            concurrency: 2,
            max_attempts: 3,
            base_backoff_ms: 1,
            request_timeout_secs: 5,
        };
        let cache = ReconciliationCache::open(config.cache_root.clone()).unwrap();
        Self {
            _archive_dir: archive_dir,
            _cache_dir: cache_dir,
            config,
            cache,
        }
    }

    fn reconciler(&self, remote: MockRemote) -> Reconciler<MockRemote> {
        Reconciler::new(self.config.clone(), self.cache.clone(), remote)
    }

    fn seed_frames(&self, stamps: &[&str]) {
        let store = LocalStore::new(self.config.archive_root.clone());
        store.ensure_product_dir(SAT, PROD).unwrap();
        for stamp in stamps {
            let path = store.frame_path(SAT, PROD, ts(stamp));
            fs::write(path.as_std_path(), b"frame").unwrap();
        }
    }
}

fn ts(compact: &str) -> Timestamp {
    Timestamp::parse_compact(compact).unwrap()
}

fn key(interval: u32) -> ScanKey {
    ScanKey {
        satellite: SAT,
        product: PROD,
        start: ts("202608230000"),
        end: ts("202608230040"),
        interval_minutes: interval,
    }
}

fn probe_options() -> ScanOptions {
    ScanOptions {
        force_rescan: false,
        absence_policy: AbsencePolicy::ProbeRemote,
    }
}

#[test]
fn uncached_scan_completes_and_stores_its_result() {
    let harness = Harness::new();
    harness.seed_frames(&["202608230000", "202608230020", "202608230040"]);
    let reconciler = harness.reconciler(MockRemote::default());

    // Run on a helper thread with a deadline: a scan that wedges on its
    // own writeback would otherwise hang the whole suite.
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result =
            reconciler.start_scan(&key(10), ScanOptions::default(), &CancelToken::new(), &NullSink);
        let _ = tx.send(result);
    });
    let result = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("scan did not complete within 10s")
        .unwrap();

    assert_eq!(result.missing.len(), 2);
    assert!(harness.cache.get(&key(10)).unwrap().is_some());
}

#[test]
fn reports_the_gaps_between_holdings() {
    let harness = Harness::new();
    harness.seed_frames(&["202608230000", "202608230020", "202608230040"]);
    let reconciler = harness.reconciler(MockRemote::default());

    let result = reconciler
        .start_scan(&key(10), ScanOptions::default(), &CancelToken::new(), &NullSink)
        .unwrap();

    assert_eq!(result.expected_count, 5);
    assert_eq!(result.found_count, 3);
    let missing: Vec<String> = result.missing.iter().map(Timestamp::compact).collect();
    assert_eq!(missing, vec!["202608230010", "202608230030"]);
}

#[test]
fn second_scan_returns_the_stored_result() {
    let harness = Harness::new();
    harness.seed_frames(&["202608230000"]);
    let reconciler = harness.reconciler(MockRemote::default());
    let cancel = CancelToken::new();

    let first = reconciler
        .start_scan(&key(10), ScanOptions::default(), &cancel, &NullSink)
        .unwrap();
    let second = reconciler
        .start_scan(&key(10), ScanOptions::default(), &cancel, &NullSink)
        .unwrap();
    assert_eq!(second.completed_at, first.completed_at);

    // A forced rescan recomputes instead of reading back.
    thread::sleep(Duration::from_millis(10));
    let forced = reconciler
        .start_scan(
            &key(10),
            ScanOptions {
                force_rescan: true,
                ..ScanOptions::default()
            },
            &cancel,
            &NullSink,
        )
        .unwrap();
    assert!(forced.completed_at > first.completed_at);
}

#[test]
fn probing_excludes_frames_the_publisher_never_produced() {
    let harness = Harness::new();
    harness.seed_frames(&["202608230000", "202608230020", "202608230040"]);
    // Of the two local gaps only 00:10 exists upstream; 00:30 was skipped
    // by the publisher and must not be reported as missing.
    let remote = MockRemote::with_objects([timegrid::remote_key(SAT, PROD, ts("202608230010"))]);
    let reconciler = harness.reconciler(remote.clone());

    let result = reconciler
        .start_scan(&key(10), probe_options(), &CancelToken::new(), &NullSink)
        .unwrap();

    let missing: Vec<String> = result.missing.iter().map(Timestamp::compact).collect();
    assert_eq!(missing, vec!["202608230010"]);
    assert_eq!(remote.exists_calls(), 2);
}

#[test]
fn concurrent_identical_scans_share_one_compute() {
    let harness = Harness::new();
    harness.seed_frames(&["202608230000", "202608230020", "202608230040"]);
    let remote = MockRemote::with_objects([
        timegrid::remote_key(SAT, PROD, ts("202608230010")),
        timegrid::remote_key(SAT, PROD, ts("202608230030")),
    ]);
    let reconciler = harness.reconciler(remote.clone());
    let cancel = CancelToken::new();

    thread::scope(|scope| {
        for _ in 0..4 {
            let reconciler = &reconciler;
            let cancel = &cancel;
            scope.spawn(move || {
                let result = reconciler
                    .start_scan(&key(10), probe_options(), cancel, &NullSink)
                    .unwrap();
                assert_eq!(result.missing.len(), 2);
            });
        }
    });

    // One probe per absent frame, not one per caller.
    assert_eq!(remote.exists_calls(), 2);
}

#[test]
fn interval_detected_from_local_holdings() {
    let harness = Harness::new();
    harness.seed_frames(&[
        "202608230000",
        "202608230010",
        "202608230020",
        "202608230040",
    ]);
    let reconciler = harness.reconciler(MockRemote::default());

    let result = reconciler
        .start_scan(&key(0), ScanOptions::default(), &CancelToken::new(), &NullSink)
        .unwrap();

    assert_eq!(result.detected_interval, 10);
    assert_eq!(result.expected_count, 5);
    assert_eq!(result.missing.len(), 1);
}

#[test]
fn interval_detected_from_remote_listing_when_archive_is_empty() {
    let harness = Harness::new();
    let listing: Vec<String> = ["202608230000", "202608230010", "202608230020"]
        .iter()
        .map(|stamp| timegrid::remote_key(SAT, PROD, ts(stamp)))
        .collect();
    let remote = MockRemote::with_listing(listing);
    let reconciler = harness.reconciler(remote.clone());

    let result = reconciler
        .start_scan(&key(0), ScanOptions::default(), &CancelToken::new(), &NullSink)
        .unwrap();

    assert_eq!(result.detected_interval, 10);
    assert_eq!(result.found_count, 0);
    assert_eq!(result.missing.len(), 5);
    assert_eq!(remote.list_calls(), 1);
}

#[test]
fn undetectable_schedule_is_an_error() {
    let harness = Harness::new();
    let reconciler = harness.reconciler(MockRemote::default());

    let err = reconciler
        .start_scan(&key(0), ScanOptions::default(), &CancelToken::new(), &NullSink)
        .unwrap_err();
    assert_matches!(err, ArchiveError::ScheduleUndetectable(_));
}

#[test]
fn cancelled_scan_writes_nothing_back() {
    let harness = Harness::new();
    harness.seed_frames(&["202608230000"]);
    let reconciler = harness.reconciler(MockRemote::default());
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = reconciler
        .start_scan(&key(10), ScanOptions::default(), &cancel, &NullSink)
        .unwrap_err();
    assert_matches!(err, ArchiveError::Cancelled);
    assert!(harness.cache.get(&key(10)).unwrap().is_none());
}
