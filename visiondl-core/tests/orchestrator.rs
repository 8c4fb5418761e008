//! End-to-end orchestrator tests against a scripted archive host.
//!
//! No network: the host is a map from remote key to a scripted
//! response, and every test runs inside a temp directory.

use chrono::NaiveDate;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use visiondl_core::{
    run_batch, ArchiveHost, BatchSpec, DataKind, HostError, Interval, KindSelection,
    ProgressStore, RetryPolicy, RunError, SessionSettings, SilentReporter, UnitStatus,
    VenueSegment,
};

/// Scripted host: per-key response, every archive request recorded.
struct MockHost {
    responses: BTreeMap<String, Result<Vec<u8>, HostError>>,
    default: Result<Vec<u8>, HostError>,
    calls: RefCell<Vec<String>>,
}

impl MockHost {
    fn serving_all(bytes: &[u8]) -> Self {
        Self {
            responses: BTreeMap::new(),
            default: Ok(bytes.to_vec()),
            calls: RefCell::new(Vec::new()),
        }
    }

    fn failing_all(err: HostError) -> Self {
        Self {
            responses: BTreeMap::new(),
            default: Err(err),
            calls: RefCell::new(Vec::new()),
        }
    }

    fn with_response(mut self, key_fragment: &str, response: Result<Vec<u8>, HostError>) -> Self {
        self.responses.insert(key_fragment.to_string(), response);
        self
    }

    fn archive_calls(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl ArchiveHost for MockHost {
    fn fetch_archive(&self, key: &str, dest: &Path) -> Result<(), HostError> {
        self.calls.borrow_mut().push(key.to_string());
        let response = self
            .responses
            .iter()
            .find(|(fragment, _)| key.contains(fragment.as_str()))
            .map(|(_, r)| r)
            .unwrap_or(&self.default);
        match response {
            Ok(bytes) => {
                fs::write(dest, bytes).unwrap();
                Ok(())
            }
            Err(e) => Err(e.clone()),
        }
    }

    fn fetch_checksum(&self, _key: &str) -> Result<Option<String>, HostError> {
        Ok(None)
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Two symbols, one full month, spot klines 1h → 2 units.
fn two_unit_spec() -> BatchSpec {
    BatchSpec {
        segment: VenueSegment::Spot,
        kinds: vec![KindSelection {
            kind: DataKind::Klines,
            intervals: vec![Interval::Hour1],
        }],
        symbols: vec!["BTCUSDT".into(), "ETHUSDT".into()],
        start: date(2024, 6, 1),
        end: date(2024, 6, 30),
    }
}

fn settings_in(dir: &TempDir) -> SessionSettings {
    let mut settings = SessionSettings::new(dir.path().join("data"));
    settings.retry = RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };
    settings
}

fn not_cancelled() -> AtomicBool {
    AtomicBool::new(false)
}

#[test]
fn clean_run_fetches_every_unit() {
    let tmp = TempDir::new().unwrap();
    let settings = settings_in(&tmp);
    let host = MockHost::serving_all(b"archive");

    let summary = run_batch(
        &two_unit_spec(),
        &settings,
        &host,
        &SilentReporter,
        &not_cancelled(),
    )
    .unwrap();

    assert_eq!(summary.total, 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 0);
    assert!(summary.all_succeeded());
    assert_eq!(host.archive_calls(), 2);

    // Artifacts landed at the derived paths; no .part files remain.
    let expected = settings
        .output_dir
        .join("data/spot/monthly/klines/BTCUSDT/1h/BTCUSDT-1h-2024-06.zip");
    assert!(expected.exists());

    let store = ProgressStore::open(&settings.progress_path).unwrap();
    assert_eq!(store.snapshot().completed, 2);
}

#[test]
fn second_run_with_resume_makes_zero_host_calls() {
    let tmp = TempDir::new().unwrap();
    let settings = settings_in(&tmp);

    let first = MockHost::serving_all(b"archive");
    run_batch(&two_unit_spec(), &settings, &first, &SilentReporter, &not_cancelled()).unwrap();

    let second = MockHost::serving_all(b"archive");
    let summary = run_batch(
        &two_unit_spec(),
        &settings,
        &second,
        &SilentReporter,
        &not_cancelled(),
    )
    .unwrap();

    assert_eq!(second.archive_calls(), 0);
    assert_eq!(summary.already_satisfied, 2);
    assert_eq!(summary.completed, 0);
}

#[test]
fn not_found_is_recorded_as_skipped_not_failed() {
    let tmp = TempDir::new().unwrap();
    let settings = settings_in(&tmp);
    let host = MockHost::serving_all(b"archive").with_response("ETHUSDT", Err(HostError::NotFound));

    let summary = run_batch(
        &two_unit_spec(),
        &settings,
        &host,
        &SilentReporter,
        &not_cancelled(),
    )
    .unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.skipped_no_data, 1);
    assert_eq!(summary.failed, 0);
    assert!(summary.all_succeeded());

    // Exactly one request for the missing unit: no retries on not-found.
    let eth_calls = host
        .calls
        .borrow()
        .iter()
        .filter(|k| k.contains("ETHUSDT"))
        .count();
    assert_eq!(eth_calls, 1);

    let store = ProgressStore::open(&settings.progress_path).unwrap();
    let record = store.get("spot/klines/ETHUSDT/1h/2024-06").unwrap();
    assert_eq!(record.status, UnitStatus::SkippedNoData);

    // A later resumed run does not ask the host about it again.
    let second = MockHost::serving_all(b"archive");
    run_batch(&two_unit_spec(), &settings, &second, &SilentReporter, &not_cancelled()).unwrap();
    assert_eq!(second.archive_calls(), 0);
}

#[test]
fn one_failing_unit_does_not_block_the_rest() {
    let tmp = TempDir::new().unwrap();
    let settings = settings_in(&tmp);
    // BTCUSDT sorts first; it fails permanently, ETHUSDT must still run.
    let host = MockHost::serving_all(b"archive")
        .with_response("BTCUSDT", Err(HostError::Permanent("HTTP 403".into())));

    let summary = run_batch(
        &two_unit_spec(),
        &settings,
        &host,
        &SilentReporter,
        &not_cancelled(),
    )
    .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed_keys, vec!["spot/klines/BTCUSDT/1h/2024-06"]);
    assert!(!summary.all_succeeded());

    let store = ProgressStore::open(&settings.progress_path).unwrap();
    assert_eq!(
        store.get("spot/klines/BTCUSDT/1h/2024-06").unwrap().status,
        UnitStatus::Failed
    );
    assert_eq!(
        store.get("spot/klines/ETHUSDT/1h/2024-06").unwrap().status,
        UnitStatus::Completed
    );
}

#[test]
fn valid_artifacts_survive_a_deleted_progress_file() {
    let tmp = TempDir::new().unwrap();
    let settings = settings_in(&tmp);

    let first = MockHost::serving_all(b"archive");
    run_batch(&two_unit_spec(), &settings, &first, &SilentReporter, &not_cancelled()).unwrap();

    fs::remove_file(&settings.progress_path).unwrap();

    let second = MockHost::serving_all(b"archive");
    let summary = run_batch(
        &two_unit_spec(),
        &settings,
        &second,
        &SilentReporter,
        &not_cancelled(),
    )
    .unwrap();

    // The filesystem is the second source of truth: nothing re-fetched.
    assert_eq!(second.archive_calls(), 0);
    assert_eq!(summary.already_satisfied, 2);

    // And the store was rebuilt as completed.
    let store = ProgressStore::open(&settings.progress_path).unwrap();
    assert_eq!(store.snapshot().completed, 2);
}

#[test]
fn zero_byte_artifact_is_discarded_and_refetched() {
    let tmp = TempDir::new().unwrap();
    let settings = settings_in(&tmp);

    let dest = settings
        .output_dir
        .join("data/spot/monthly/klines/BTCUSDT/1h/BTCUSDT-1h-2024-06.zip");
    fs::create_dir_all(dest.parent().unwrap()).unwrap();
    fs::write(&dest, b"").unwrap();

    let host = MockHost::serving_all(b"archive");
    let summary = run_batch(
        &two_unit_spec(),
        &settings,
        &host,
        &SilentReporter,
        &not_cancelled(),
    )
    .unwrap();

    assert_eq!(summary.completed, 2);
    assert_eq!(fs::read(&dest).unwrap(), b"archive");
}

#[test]
fn refetched_artifact_is_not_condemned_by_a_stale_sidecar() {
    let tmp = TempDir::new().unwrap();
    let settings = settings_in(&tmp);
    let spec = BatchSpec {
        symbols: vec!["BTCUSDT".into()],
        ..two_unit_spec()
    };

    // A corrupt artifact with a sidecar digest that matches nothing the
    // host will ever serve, and no progress file.
    let dest = settings
        .output_dir
        .join("data/spot/monthly/klines/BTCUSDT/1h/BTCUSDT-1h-2024-06.zip");
    fs::create_dir_all(dest.parent().unwrap()).unwrap();
    fs::write(&dest, b"corrupt").unwrap();
    fs::write(
        dest.with_file_name("BTCUSDT-1h-2024-06.zip.CHECKSUM"),
        format!("{}  BTCUSDT-1h-2024-06.zip\n", "0".repeat(64)),
    )
    .unwrap();

    // The host publishes no checksum, so the replacement carries none.
    let first = MockHost::serving_all(b"archive");
    let summary = run_batch(&spec, &settings, &first, &SilentReporter, &not_cancelled()).unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(first.archive_calls(), 1);
    assert_eq!(fs::read(&dest).unwrap(), b"archive");

    // Even with the store lost, the replacement passes the integrity
    // check; the old digest must not survive to invalidate it.
    fs::remove_file(&settings.progress_path).unwrap();
    let second = MockHost::serving_all(b"archive");
    let summary = run_batch(&spec, &settings, &second, &SilentReporter, &not_cancelled()).unwrap();
    assert_eq!(second.archive_calls(), 0);
    assert_eq!(summary.already_satisfied, 1);
}

#[test]
fn resumed_store_from_a_different_selection_is_flagged() {
    let tmp = TempDir::new().unwrap();
    let settings = settings_in(&tmp);

    let host = MockHost::serving_all(b"archive");
    let first = run_batch(&two_unit_spec(), &settings, &host, &SilentReporter, &not_cancelled())
        .unwrap();
    assert!(!first.selection_changed);

    let other_spec = BatchSpec {
        symbols: vec!["SOLUSDT".into()],
        ..two_unit_spec()
    };
    let second =
        run_batch(&other_spec, &settings, &host, &SilentReporter, &not_cancelled()).unwrap();
    assert!(second.selection_changed);

    // Prior records are kept alongside the new unit's.
    let store = ProgressStore::open(&settings.progress_path).unwrap();
    assert_eq!(store.snapshot().completed, 3);

    // Same selection again: nothing to flag.
    let third =
        run_batch(&other_spec, &settings, &host, &SilentReporter, &not_cancelled()).unwrap();
    assert!(!third.selection_changed);
}

#[test]
fn cancellation_before_start_leaves_all_units_pending() {
    let tmp = TempDir::new().unwrap();
    let settings = settings_in(&tmp);
    let host = MockHost::serving_all(b"archive");

    let cancel = AtomicBool::new(true);
    let summary = run_batch(&two_unit_spec(), &settings, &host, &SilentReporter, &cancel).unwrap();

    assert!(summary.cancelled);
    assert_eq!(host.archive_calls(), 0);

    let store = ProgressStore::open(&settings.progress_path).unwrap();
    assert_eq!(store.snapshot().pending, 2);
}

#[test]
fn cancellation_is_checked_between_units() {
    let tmp = TempDir::new().unwrap();
    let settings = settings_in(&tmp);
    let host = MockHost::serving_all(b"archive");
    let cancel = AtomicBool::new(false);

    // Reporter flips the flag after the first unit completes.
    struct CancelAfterFirst<'a>(&'a AtomicBool);
    impl visiondl_core::RunReporter for CancelAfterFirst<'_> {
        fn on_unit_start(&self, _key: &str, _index: usize, _total: usize) {}
        fn on_unit_done(
            &self,
            _key: &str,
            _index: usize,
            _total: usize,
            _outcome: &visiondl_core::UnitOutcome,
        ) {
            self.0.store(true, Ordering::Relaxed);
        }
        fn on_run_complete(&self, _summary: &visiondl_core::RunSummary) {}
    }

    let summary = run_batch(
        &two_unit_spec(),
        &settings,
        &host,
        &CancelAfterFirst(&cancel),
        &cancel,
    )
    .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.completed, 1);
    assert_eq!(host.archive_calls(), 1);

    let store = ProgressStore::open(&settings.progress_path).unwrap();
    let snap = store.snapshot();
    assert_eq!(snap.completed, 1);
    assert_eq!(snap.pending, 1);
}

#[test]
fn failed_unit_is_retried_on_resume_and_attempts_accumulate() {
    let tmp = TempDir::new().unwrap();
    let mut settings = settings_in(&tmp);
    settings.retry.max_attempts = 2;

    let down = MockHost::failing_all(HostError::Transient("HTTP 503".into()));
    let spec = BatchSpec {
        symbols: vec!["BTCUSDT".into()],
        ..two_unit_spec()
    };
    let first = run_batch(&spec, &settings, &down, &SilentReporter, &not_cancelled()).unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(down.archive_calls(), 2); // both in-run attempts used

    let up = MockHost::serving_all(b"archive");
    let second = run_batch(&spec, &settings, &up, &SilentReporter, &not_cancelled()).unwrap();
    assert_eq!(second.completed, 1);
    assert_eq!(up.archive_calls(), 1);

    let store = ProgressStore::open(&settings.progress_path).unwrap();
    let record = store.get("spot/klines/BTCUSDT/1h/2024-06").unwrap();
    assert_eq!(record.status, UnitStatus::Completed);
    assert_eq!(record.attempts, 3); // 2 from the failed run + 1 now
}

#[test]
fn permanently_exhausted_unit_is_not_refetched() {
    let tmp = TempDir::new().unwrap();
    let mut settings = settings_in(&tmp);
    settings.retry.max_attempts = 1; // cumulative cap = 1 × 3 resume rounds

    let spec = BatchSpec {
        symbols: vec!["BTCUSDT".into()],
        ..two_unit_spec()
    };

    for round in 0..3 {
        let down = MockHost::failing_all(HostError::Transient("HTTP 500".into()));
        let summary =
            run_batch(&spec, &settings, &down, &SilentReporter, &not_cancelled()).unwrap();
        assert_eq!(summary.failed, 1, "round {round}");
        assert_eq!(down.archive_calls(), 1, "round {round}");
    }

    // Attempt budget exhausted: reported failed with no network activity.
    let down = MockHost::failing_all(HostError::Transient("HTTP 500".into()));
    let summary = run_batch(&spec, &settings, &down, &SilentReporter, &not_cancelled()).unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(down.archive_calls(), 0);
}

#[test]
fn resume_disabled_still_skips_valid_artifacts_but_ignores_the_store() {
    let tmp = TempDir::new().unwrap();
    let mut settings = settings_in(&tmp);

    let first = MockHost::serving_all(b"archive").with_response("ETHUSDT", Err(HostError::NotFound));
    run_batch(&two_unit_spec(), &settings, &first, &SilentReporter, &not_cancelled()).unwrap();

    settings.resume = false;
    let second = MockHost::serving_all(b"archive");
    let summary = run_batch(
        &two_unit_spec(),
        &settings,
        &second,
        &SilentReporter,
        &not_cancelled(),
    )
    .unwrap();

    // The skipped_no_data record is ignored, so ETHUSDT is asked for
    // again; the valid BTCUSDT artifact is still honored.
    assert_eq!(second.archive_calls(), 1);
    assert_eq!(summary.already_satisfied, 1);
    assert_eq!(summary.completed, 1);
}

#[test]
fn validation_error_aborts_before_any_network_activity() {
    let tmp = TempDir::new().unwrap();
    let settings = settings_in(&tmp);
    let host = MockHost::serving_all(b"archive");

    let mut spec = two_unit_spec();
    spec.kinds[0].intervals.clear();

    let result = run_batch(&spec, &settings, &host, &SilentReporter, &not_cancelled());
    assert!(matches!(result, Err(RunError::Invalid(_))));
    assert_eq!(host.archive_calls(), 0);
    assert!(!settings.progress_path.exists());
}
