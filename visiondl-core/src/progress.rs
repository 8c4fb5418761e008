//! Durable progress store — file-backed map from unit key to fetch status.
//!
//! Every upsert rewrites the whole backing file to a temporary name and
//! renames it into place, so a crash between upserts leaves either the
//! previous complete file or the new complete file, never a torn one. A
//! concurrent status query reads whichever complete version is current.
//!
//! Unknown JSON fields are tolerated on load, so a progress file written
//! by a newer build (new kinds, new record fields) stays readable.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const STORE_VERSION: u32 = 1;

/// Lifecycle status of one work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    InProgress,
    Completed,
    SkippedNoData,
    Failed,
}

/// Progress record for one work unit, keyed by the unit's canonical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub status: UnitStatus,
    /// Cumulative fetch attempts across all runs.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: NaiveDateTime,
}

impl ProgressRecord {
    pub fn new(status: UnitStatus) -> Self {
        Self {
            status,
            attempts: 0,
            last_error: None,
            updated_at: chrono::Utc::now().naive_utc(),
        }
    }
}

/// Progress store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("progress file i/o: {0}")]
    Io(#[from] io::Error),

    #[error("progress file is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// On-disk shape of the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    spec_fingerprint: Option<String>,
    #[serde(default)]
    records: BTreeMap<String, ProgressRecord>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            spec_fingerprint: None,
            records: BTreeMap::new(),
        }
    }
}

/// Point-in-time summary of the store, for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreSnapshot {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub skipped_no_data: usize,
    pub failed: usize,
    pub failed_keys: Vec<String>,
}

/// File-backed progress map with atomic rewrite-and-replace persistence.
pub struct ProgressStore {
    path: PathBuf,
    file: StoreFile,
}

impl ProgressStore {
    /// Open the store at `path`, loading existing records if the file
    /// exists. A missing file is an empty store, not an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => StoreFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn spec_fingerprint(&self) -> Option<&str> {
        self.file.spec_fingerprint.as_deref()
    }

    /// Record the fingerprint of the spec this store is tracking.
    pub fn set_spec_fingerprint(&mut self, fingerprint: &str) -> Result<(), StoreError> {
        if self.file.spec_fingerprint.as_deref() == Some(fingerprint) {
            return Ok(());
        }
        self.file.spec_fingerprint = Some(fingerprint.to_string());
        self.persist()
    }

    pub fn get(&self, key: &str) -> Option<&ProgressRecord> {
        self.file.records.get(key)
    }

    pub fn records(&self) -> &BTreeMap<String, ProgressRecord> {
        &self.file.records
    }

    /// Insert or replace one record and persist the whole store.
    pub fn upsert(&mut self, key: &str, record: ProgressRecord) -> Result<(), StoreError> {
        self.file.records.insert(key.to_string(), record);
        self.persist()
    }

    /// Insert Pending records for keys not yet seen, with a single write.
    /// Returns the number of records created.
    pub fn seed_pending<I>(&mut self, keys: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut created = 0;
        for key in keys {
            if !self.file.records.contains_key(&key) {
                self.file
                    .records
                    .insert(key, ProgressRecord::new(UnitStatus::Pending));
                created += 1;
            }
        }
        if created > 0 {
            self.persist()?;
        }
        Ok(created)
    }

    /// Counts per status plus the failed keys.
    pub fn snapshot(&self) -> StoreSnapshot {
        let mut snap = StoreSnapshot {
            total: self.file.records.len(),
            ..StoreSnapshot::default()
        };
        for (key, record) in &self.file.records {
            match record.status {
                UnitStatus::Pending => snap.pending += 1,
                UnitStatus::InProgress => snap.in_progress += 1,
                UnitStatus::Completed => snap.completed += 1,
                UnitStatus::SkippedNoData => snap.skipped_no_data += 1,
                UnitStatus::Failed => {
                    snap.failed += 1;
                    snap.failed_keys.push(key.clone());
                }
            }
        }
        snap
    }

    /// Rewrite the backing file: serialize to `{path}.tmp`, rename into
    /// place. Never leaves a partial file at the final path.
    fn persist(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = tmp_path(&self.path);
        let json = serde_json::to_string_pretty(&self.file)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            e
        })?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
