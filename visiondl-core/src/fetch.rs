//! Archive fetcher — retrieval of one work unit with bounded retries.
//!
//! The transport sits behind the `ArchiveHost` trait so retry and
//! backoff behavior can be tested against a scripted host without a
//! network. `HttpArchiveHost` is the production implementation over
//! reqwest's blocking client, with optional proxy support.
//!
//! Downloads land at `{dest}.part` and are renamed into place only after
//! the full transfer (and checksum verification, when the host publishes
//! one) succeeds, so the existence check never mistakes a half-written
//! file for a valid artifact.

use crate::check::{self, checksum_sidecar_path, sha256_file};
use crate::domain::{WorkUnit, BASE_URL};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Host-side failure, classified for the retry loop.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HostError {
    /// Definitive "no archive exists for this unit" — a terminal,
    /// expected outcome, never retried.
    #[error("archive not found on host")]
    NotFound,

    /// Timeout, connection failure, 5xx — worth retrying with backoff.
    #[error("transient host error: {0}")]
    Transient(String),

    /// Non-retryable response.
    #[error("permanent host error: {0}")]
    Permanent(String),
}

/// Transport seam over the archive host.
pub trait ArchiveHost {
    /// Stream the archive at `key` into `dest`. The file at `dest` may
    /// be partial after an error; the caller owns cleanup.
    fn fetch_archive(&self, key: &str, dest: &Path) -> Result<(), HostError>;

    /// Retrieve the companion checksum digest for `key`, if the host
    /// publishes one. Absence is `Ok(None)`, not an error.
    fn fetch_checksum(&self, key: &str) -> Result<Option<String>, HostError>;
}

/// Pure retry policy: attempt budget and backoff delays, decoupled from
/// the transport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt after `completed_attempts` failures:
    /// base × 2^(n-1), capped at `max_delay`.
    pub fn delay_for(&self, completed_attempts: u32) -> Duration {
        if completed_attempts == 0 {
            return Duration::ZERO;
        }
        let exp = completed_attempts.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.max_delay)
    }
}

/// Terminal outcome of fetching one unit.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Completed,
    SkippedNoData,
    Failed(String),
}

/// What happened while fetching one unit, with enough detail for the
/// progress-store update.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchReport {
    pub outcome: FetchOutcome,
    /// Host requests made for the archive itself (not the checksum).
    pub attempts: u32,
}

/// Fetch one unit into `dest` with bounded retries and backoff.
///
/// `sleep` is injected so tests can observe backoff without waiting.
/// Local I/O failures (disk full, unwritable destination) are returned
/// as errors — they are fatal to the run, not per-unit failures.
pub fn fetch_unit(
    host: &dyn ArchiveHost,
    unit: &WorkUnit,
    dest: &Path,
    policy: &RetryPolicy,
    sleep: &dyn Fn(Duration),
) -> io::Result<FetchReport> {
    let key = unit.remote_key();
    let part = part_path(dest);

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    // Checksum lookup is best-effort: a host hiccup here must not fail
    // the unit, it just downgrades verification to size-only.
    let expected_digest = match host.fetch_checksum(&key) {
        Ok(digest) => digest.and_then(|d| check::parse_checksum(&d)),
        Err(_) => None,
    };

    let mut attempts = 0;
    let mut last_error = String::new();

    while attempts < policy.max_attempts {
        if attempts > 0 {
            sleep(policy.delay_for(attempts));
        }
        attempts += 1;

        match host.fetch_archive(&key, &part) {
            Ok(()) => {
                if let Some(expected) = &expected_digest {
                    let actual = sha256_file(&part)?;
                    if actual != *expected {
                        // Corrupt transfer; treat like a transient failure.
                        fs::remove_file(&part)?;
                        last_error = format!(
                            "checksum mismatch: expected {expected}, got {actual}"
                        );
                        continue;
                    }
                }

                fs::rename(&part, dest)?;
                match &expected_digest {
                    Some(expected) => {
                        fs::write(
                            checksum_sidecar_path(dest),
                            format!("{expected}  {}\n", unit.file_name()),
                        )?;
                    }
                    // A sidecar left over from an earlier artifact no
                    // longer describes this file; keeping it would fail
                    // every later integrity check.
                    None => remove_if_present(&checksum_sidecar_path(dest))?,
                }

                return Ok(FetchReport {
                    outcome: FetchOutcome::Completed,
                    attempts,
                });
            }
            Err(HostError::NotFound) => {
                remove_if_present(&part)?;
                return Ok(FetchReport {
                    outcome: FetchOutcome::SkippedNoData,
                    attempts,
                });
            }
            Err(HostError::Transient(msg)) => {
                remove_if_present(&part)?;
                last_error = msg;
            }
            Err(HostError::Permanent(msg)) => {
                remove_if_present(&part)?;
                return Ok(FetchReport {
                    outcome: FetchOutcome::Failed(msg),
                    attempts,
                });
            }
        }
    }

    Ok(FetchReport {
        outcome: FetchOutcome::Failed(format!(
            "retries exhausted after {attempts} attempts: {last_error}"
        )),
        attempts,
    })
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

pub(crate) fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Production transport over the public archive host.
pub struct HttpArchiveHost {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpArchiveHost {
    /// Build the transport with a per-request timeout and an optional
    /// upstream proxy applied to all requests.
    pub fn new(timeout: Duration, proxy: Option<&str>) -> Result<Self, reqwest::Error> {
        Self::with_base_url(BASE_URL, timeout, proxy)
    }

    pub fn with_base_url(
        base_url: &str,
        timeout: Duration,
        proxy: Option<&str>,
    ) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::blocking::Client::builder().timeout(timeout);
        if let Some(proxy_url) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }
        Ok(Self {
            client: builder.build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    fn classify(e: &reqwest::Error) -> HostError {
        if e.is_timeout() || e.is_connect() {
            HostError::Transient(e.to_string())
        } else {
            HostError::Permanent(e.to_string())
        }
    }

    fn classify_status(status: reqwest::StatusCode) -> Option<HostError> {
        if status == reqwest::StatusCode::NOT_FOUND {
            Some(HostError::NotFound)
        } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Some(HostError::Transient(format!("HTTP {status}")))
        } else if !status.is_success() {
            Some(HostError::Permanent(format!("HTTP {status}")))
        } else {
            None
        }
    }
}

impl ArchiveHost for HttpArchiveHost {
    fn fetch_archive(&self, key: &str, dest: &Path) -> Result<(), HostError> {
        let url = self.url_for(key);
        let mut resp = self.client.get(&url).send().map_err(|e| Self::classify(&e))?;

        if let Some(err) = Self::classify_status(resp.status()) {
            return Err(err);
        }

        let mut file = fs::File::create(dest)
            .map_err(|e| HostError::Permanent(format!("create {}: {e}", dest.display())))?;
        resp.copy_to(&mut file)
            .map_err(|e| HostError::Transient(format!("transfer interrupted: {e}")))?;
        Ok(())
    }

    fn fetch_checksum(&self, key: &str) -> Result<Option<String>, HostError> {
        let url = format!("{}.CHECKSUM", self.url_for(key));
        let resp = self.client.get(&url).send().map_err(|e| Self::classify(&e))?;

        match Self::classify_status(resp.status()) {
            Some(HostError::NotFound) => return Ok(None),
            Some(err) => return Err(err),
            None => {}
        }

        let body = resp
            .text()
            .map_err(|e| HostError::Transient(format!("checksum read: {e}")))?;
        Ok(check::parse_checksum(&body))
    }
}
