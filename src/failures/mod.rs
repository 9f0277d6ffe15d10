//! Failure Log Module
//!
//! Writes one JSON file per terminal endpoint failure so runs can be
//! inspected offline:
//!
//! ```text
//! <root>/<YYYY-MM-DD>/<expectedChainId>/<HH-MM-SS-mmm>_<sanitized-url>.json
//! ```
//!
//! A name that is already taken (two URLs that sanitize alike, failing in the
//! same millisecond) gets a `_<n>` suffix instead of replacing the file.
//!
//! Writes are queued and flushed by a single background loop. A test batch
//! is bracketed by `start_test_batch` / `complete_test_batch`, and completion
//! only returns once every queued record is on disk.

mod tracker;

pub use tracker::FailureTracker;

use std::path::{Path, PathBuf};

use crate::types::FailureRecord;

/// Longest sanitized URL kept in a file name
const MAX_URL_COMPONENT_CHARS: usize = 100;

/// Snapshot of tracker counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureStats {
    /// Records waiting to be written
    pub queued: usize,

    /// Records written to disk
    pub written: u64,

    /// Records dropped after exhausting write retries
    pub dropped: u64,

    /// Write attempts that failed and were retried
    pub retried: u64,
}

/// Deterministic location of a failure record
pub fn record_path(root: &Path, record: &FailureRecord) -> PathBuf {
    let date = record.timestamp.format("%Y-%m-%d").to_string();
    let time = record.timestamp.format("%H-%M-%S-%3f").to_string();

    root.join(date)
        .join(sanitize(&record.expected_chain_id, MAX_URL_COMPONENT_CHARS))
        .join(format!("{}_{}.json", time, sanitize_url(&record.url)))
}

/// `path` with `_<n>` appended to the file stem
pub fn with_name_suffix(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}_{}.json", stem, n))
}

/// URL reduced to a file-name-safe component
pub fn sanitize_url(url: &str) -> String {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    sanitize(without_scheme, MAX_URL_COMPONENT_CHARS)
}

fn sanitize(value: &str, max_chars: usize) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .take(max_chars)
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}
