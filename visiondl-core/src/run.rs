//! Batch orchestrator — drives the expanded unit list through
//! existence check → fetcher → progress-store update, sequentially,
//! and produces the run summary.
//!
//! One orchestrator process owns one progress file; writes are serial
//! by construction. A per-unit failure is recorded and the run moves
//! on; only validation errors, store corruption, and fatal local I/O
//! abort the batch. Cancellation is checked between units, so an
//! in-flight transfer finishes or fails before the run exits and every
//! unreached unit stays pending for the next resumed run.

use crate::check::{check_artifact, checksum_sidecar_path, LocalState};
use crate::domain::WorkUnit;
use crate::expand::{expand, BatchSpec, ExpandError};
use crate::fetch::{fetch_unit, remove_if_present, ArchiveHost, FetchOutcome, RetryPolicy};
use crate::progress::{ProgressRecord, ProgressStore, StoreError, UnitStatus};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

/// A failed unit is retried on later resumed runs until its cumulative
/// attempts reach `max_attempts × RESUME_ROUNDS`; past that it is
/// reported as permanently failed without further network activity.
const RESUME_ROUNDS: u32 = 3;

/// Immutable settings for one orchestrator run.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub output_dir: PathBuf,
    pub progress_path: PathBuf,
    pub resume: bool,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub proxy: Option<String>,
}

impl SessionSettings {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let output_dir = output_dir.into();
        let progress_path = output_dir.join(".visiondl-progress.json");
        Self {
            output_dir,
            progress_path,
            resume: true,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            proxy: None,
        }
    }
}

/// Failure that aborts the whole run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid batch spec: {0}")]
    Invalid(#[from] ExpandError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("local i/o failure at {path}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// How one unit ended, as reported to the `RunReporter`.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Completed,
    SkippedNoData,
    /// Satisfied without network activity: a resumed store record or a
    /// valid artifact already on disk.
    AlreadySatisfied,
    Failed(String),
}

/// Counts for one completed run, plus the failed keys for operator
/// follow-up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub skipped_no_data: usize,
    pub already_satisfied: usize,
    pub failed: usize,
    pub failed_keys: Vec<String>,
    /// True when cancellation stopped the run before all units were
    /// reached; unreached units remain pending in the store.
    pub cancelled: bool,
    /// True when the progress file was last written for a different
    /// selection. Prior records are kept but may describe units this
    /// run never touches.
    pub selection_changed: bool,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

/// Progress callbacks for a batch run.
pub trait RunReporter {
    fn on_unit_start(&self, key: &str, index: usize, total: usize);
    fn on_unit_done(&self, key: &str, index: usize, total: usize, outcome: &UnitOutcome);
    fn on_run_complete(&self, summary: &RunSummary);

    /// The resumed progress file was written for a different selection.
    fn on_selection_changed(&self, _prior_fingerprint: &str) {}
}

/// Reporter that prints one line per unit to stdout.
pub struct StdoutReporter;

impl RunReporter for StdoutReporter {
    fn on_unit_start(&self, key: &str, index: usize, total: usize) {
        println!("[{}/{}] {key}", index + 1, total);
    }

    fn on_unit_done(&self, _key: &str, _index: usize, _total: usize, outcome: &UnitOutcome) {
        match outcome {
            UnitOutcome::Completed => println!("  done"),
            UnitOutcome::SkippedNoData => println!("  no archive published"),
            UnitOutcome::AlreadySatisfied => println!("  already satisfied"),
            UnitOutcome::Failed(msg) => println!("  FAILED: {msg}"),
        }
    }

    fn on_run_complete(&self, summary: &RunSummary) {
        println!();
        if summary.cancelled {
            println!("Run cancelled.");
        }
        if summary.selection_changed {
            println!("Note: the progress file was written for a different selection; its prior records were kept.");
        }
        println!(
            "{} units: {} fetched, {} no data, {} already satisfied, {} failed",
            summary.total,
            summary.completed,
            summary.skipped_no_data,
            summary.already_satisfied,
            summary.failed
        );
        for key in &summary.failed_keys {
            println!("  failed: {key}");
        }
    }
}

/// Reporter that does nothing. Useful for embedding and tests.
pub struct SilentReporter;

impl RunReporter for SilentReporter {
    fn on_unit_start(&self, _key: &str, _index: usize, _total: usize) {}
    fn on_unit_done(&self, _key: &str, _index: usize, _total: usize, _outcome: &UnitOutcome) {}
    fn on_run_complete(&self, _summary: &RunSummary) {}
}

/// Run the full pipeline for one spec to completion (or cancellation).
pub fn run_batch(
    spec: &BatchSpec,
    settings: &SessionSettings,
    host: &dyn ArchiveHost,
    reporter: &dyn RunReporter,
    cancel: &AtomicBool,
) -> Result<RunSummary, RunError> {
    let units = expand(spec)?;

    fs::create_dir_all(&settings.output_dir).map_err(|e| RunError::LocalIo {
        path: settings.output_dir.clone(),
        source: e,
    })?;

    let mut store = ProgressStore::open(&settings.progress_path)?;

    let fingerprint = spec.fingerprint();
    let mut selection_changed = false;
    if let Some(prior) = store.spec_fingerprint() {
        if prior != fingerprint {
            selection_changed = true;
            reporter.on_selection_changed(prior);
        }
    }
    store.set_spec_fingerprint(&fingerprint)?;
    store.seed_pending(units.iter().map(WorkUnit::key))?;

    let attempt_cap = settings.retry.max_attempts.saturating_mul(RESUME_ROUNDS);
    let total = units.len();
    let mut summary = RunSummary {
        total,
        selection_changed,
        ..RunSummary::default()
    };

    for (index, unit) in units.iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            summary.cancelled = true;
            break;
        }

        let key = unit.key();
        reporter.on_unit_start(&key, index, total);

        let outcome = process_unit(unit, &key, settings, host, &mut store, attempt_cap)?;
        match &outcome {
            UnitOutcome::Completed => summary.completed += 1,
            UnitOutcome::SkippedNoData => summary.skipped_no_data += 1,
            UnitOutcome::AlreadySatisfied => summary.already_satisfied += 1,
            UnitOutcome::Failed(_) => {
                summary.failed += 1;
                summary.failed_keys.push(key.clone());
            }
        }
        reporter.on_unit_done(&key, index, total, &outcome);
    }

    reporter.on_run_complete(&summary);
    Ok(summary)
}

fn process_unit(
    unit: &WorkUnit,
    key: &str,
    settings: &SessionSettings,
    host: &dyn ArchiveHost,
    store: &mut ProgressStore,
    attempt_cap: u32,
) -> Result<UnitOutcome, RunError> {
    let prior = store.get(key).cloned();
    let prior_attempts = prior.as_ref().map_or(0, |r| r.attempts);

    if settings.resume {
        match prior.as_ref().map(|r| r.status) {
            Some(UnitStatus::Completed) | Some(UnitStatus::SkippedNoData) => {
                return Ok(UnitOutcome::AlreadySatisfied);
            }
            Some(UnitStatus::Failed) if prior_attempts >= attempt_cap => {
                let msg = prior
                    .as_ref()
                    .and_then(|r| r.last_error.clone())
                    .unwrap_or_else(|| "retries exhausted".into());
                return Ok(UnitOutcome::Failed(format!(
                    "permanently failed after {prior_attempts} attempts: {msg}"
                )));
            }
            _ => {}
        }
    }

    let dest = unit.local_path(&settings.output_dir);

    match check_artifact(&dest).map_err(|e| RunError::LocalIo {
        path: dest.clone(),
        source: e,
    })? {
        LocalState::PresentValid => {
            let mut record = ProgressRecord::new(UnitStatus::Completed);
            record.attempts = prior_attempts;
            store.upsert(key, record)?;
            return Ok(UnitOutcome::AlreadySatisfied);
        }
        LocalState::PresentInvalid => {
            fs::remove_file(&dest).map_err(|e| RunError::LocalIo {
                path: dest.clone(),
                source: e,
            })?;
            // The sidecar goes with the artifact it described; a stale
            // digest would invalidate the replacement download.
            remove_if_present(&checksum_sidecar_path(&dest)).map_err(|e| RunError::LocalIo {
                path: dest.clone(),
                source: e,
            })?;
        }
        LocalState::Absent => {}
    }

    let mut in_progress = ProgressRecord::new(UnitStatus::InProgress);
    in_progress.attempts = prior_attempts;
    store.upsert(key, in_progress)?;

    let report = fetch_unit(
        host,
        unit,
        &dest,
        &settings.retry,
        &|d| std::thread::sleep(d),
    )
    .map_err(|e| RunError::LocalIo {
        path: dest.clone(),
        source: e,
    })?;

    let (status, last_error, outcome) = match report.outcome {
        FetchOutcome::Completed => (UnitStatus::Completed, None, UnitOutcome::Completed),
        FetchOutcome::SkippedNoData => {
            (UnitStatus::SkippedNoData, None, UnitOutcome::SkippedNoData)
        }
        FetchOutcome::Failed(msg) => (
            UnitStatus::Failed,
            Some(msg.clone()),
            UnitOutcome::Failed(msg),
        ),
    };

    let mut record = ProgressRecord::new(status);
    record.attempts = prior_attempts + report.attempts;
    record.last_error = last_error;
    store.upsert(key, record)?;

    Ok(outcome)
}
