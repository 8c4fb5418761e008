//! visiondl core — bulk download engine for dated market-data archives.
//!
//! Retrieves a cross-product of venue segment × data kind × symbol ×
//! interval × calendar period from the public archive host, surviving
//! interrupted runs, host-side missing files, and transient network
//! failures. The pieces, leaf-first:
//!
//! - `domain` — work units and the remote key / local path derivation
//! - `expand` — batch spec validation and matrix expansion
//! - `progress` — durable, atomically rewritten progress store
//! - `check` — existence and checksum integrity of local artifacts
//! - `fetch` — transport seam, retry policy, per-unit fetch loop
//! - `run` — the sequential batch orchestrator and run summary

pub mod check;
pub mod domain;
pub mod expand;
pub mod fetch;
pub mod progress;
pub mod run;

pub use check::{check_artifact, LocalState};
pub use domain::{DataKind, Interval, Period, VenueSegment, WorkUnit, BASE_URL};
pub use expand::{expand, BatchSpec, ExpandError, KindSelection};
pub use fetch::{ArchiveHost, FetchOutcome, FetchReport, HostError, HttpArchiveHost, RetryPolicy};
pub use progress::{ProgressRecord, ProgressStore, StoreSnapshot, UnitStatus};
pub use run::{
    run_batch, RunError, RunReporter, RunSummary, SessionSettings, SilentReporter,
    StdoutReporter, UnitOutcome,
};
