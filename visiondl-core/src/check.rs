//! Existence / integrity check for local artifacts.
//!
//! The filesystem is the secondary source of truth for "already
//! fetched": even with the progress store deleted, a present artifact
//! that passes this check is not fetched again. Validity requires a
//! non-zero size, and a digest match when a checksum sidecar was saved
//! alongside the artifact.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// State of a unit's local destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    Absent,
    PresentValid,
    PresentInvalid,
}

/// Path of the checksum sidecar for an artifact: `{path}.CHECKSUM`,
/// matching the host's companion-file naming.
pub fn checksum_sidecar_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".CHECKSUM");
    path.with_file_name(name)
}

/// Parse a checksum artifact: the first whitespace-separated token must
/// be a 64-character hex SHA-256 digest. Returns the lowercase digest.
pub fn parse_checksum(content: &str) -> Option<String> {
    let token = content.split_whitespace().next()?;
    if token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(token.to_ascii_lowercase())
    } else {
        None
    }
}

/// Streaming SHA-256 of a file, as lowercase hex.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Classify the artifact at `path`.
///
/// - no file → `Absent`
/// - zero-byte file → `PresentInvalid`
/// - sidecar digest mismatch → `PresentInvalid`
/// - otherwise → `PresentValid`
pub fn check_artifact(path: &Path) -> io::Result<LocalState> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LocalState::Absent),
        Err(e) => return Err(e),
    };

    if meta.len() == 0 {
        return Ok(LocalState::PresentInvalid);
    }

    let sidecar = checksum_sidecar_path(path);
    let content = match fs::read_to_string(&sidecar) {
        Ok(content) => Some(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };
    if let Some(content) = content {
        // An unparseable sidecar gives no expectation to verify against.
        if let Some(expected) = parse_checksum(&content) {
            if sha256_file(path)? != expected {
                return Ok(LocalState::PresentInvalid);
            }
        }
    }

    Ok(LocalState::PresentValid)
}
