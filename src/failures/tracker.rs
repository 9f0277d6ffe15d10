//! Failure Tracker
//!
//! Asynchronous, disk-backed sink for failure records.
//!
//! - Ingestion never blocks: `log_failure` only serializes and enqueues.
//! - At most one flush loop runs at a time (guarded by an async mutex).
//! - Records never replace each other: a taken name gets a numeric suffix.
//! - A failed write is re-queued at the front and retried a fixed number of
//!   times before it is dropped with an error log.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use super::{record_path, with_name_suffix, FailureStats};
use crate::config::ProbeConfig;
use crate::types::{FailureRecord, ProbeError};

/// One queued write
/// Suffixes tried for one record before the write counts as failed
const MAX_NAME_SUFFIX: u32 = 1_000;

struct PendingWrite {
    path: PathBuf,
    contents: Vec<u8>,
    attempts: u32,
}

struct Inner {
    root: PathBuf,
    queue: Mutex<VecDeque<PendingWrite>>,
    /// Single-flight guard for the flush loop
    flush_lock: tokio::sync::Mutex<()>,
    batch_active: AtomicBool,
    written: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
    warn_threshold: usize,
    max_write_attempts: u32,
    write_retry_delay: Duration,
}

/// Cheaply cloneable handle to the failure log
#[derive(Clone)]
pub struct FailureTracker {
    inner: Arc<Inner>,
}

impl FailureTracker {
    pub fn new(config: &ProbeConfig) -> Self {
        Self::with_root(config.failure_log_dir.clone(), config)
    }

    /// Tracker writing below `root` instead of the configured directory
    pub fn with_root(root: PathBuf, config: &ProbeConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                root,
                queue: Mutex::new(VecDeque::new()),
                flush_lock: tokio::sync::Mutex::new(()),
                batch_active: AtomicBool::new(false),
                written: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                retried: AtomicU64::new(0),
                warn_threshold: config.failure_queue_warn_threshold,
                max_write_attempts: config.failure_write_retries.saturating_add(1),
                write_retry_delay: Duration::from_millis(config.failure_write_retry_delay_ms),
            }),
        }
    }

    #[cfg(test)]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Queue a failure record for writing
    ///
    /// Outside a batch the record is flushed right away in the background;
    /// inside a batch it waits for `complete_test_batch`.
    pub fn log_failure(&self, record: FailureRecord) {
        let path = record_path(&self.inner.root, &record);
        let contents = match serde_json::to_vec_pretty(&record) {
            Ok(contents) => contents,
            Err(e) => {
                error!("Failed to serialize failure record for {}: {}", record.url, e);
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        debug!("📝 Failure queued: {} ({}) -> {:?}", record.url, record.reason, path);

        let depth = {
            let mut queue = self.queue();
            queue.push_back(PendingWrite {
                path,
                contents,
                attempts: 0,
            });
            queue.len()
        };

        if depth > self.inner.warn_threshold {
            warn!(
                "Failure queue depth {} exceeds {} (slow disk or runaway failure rate?)",
                depth, self.inner.warn_threshold
            );
        }

        if !self.inner.batch_active.load(Ordering::Acquire) {
            let tracker = self.clone();
            tokio::spawn(async move {
                tracker.flush_all().await;
            });
        }
    }

    /// Mark the start of a test batch; writes accumulate until completion
    pub fn start_test_batch(&self) {
        self.inner.batch_active.store(true, Ordering::Release);
        debug!("Failure batch started");
    }

    /// Drain every queued record to disk, then end the batch
    pub async fn complete_test_batch(&self) {
        loop {
            self.flush_all().await;
            if self.queue().is_empty() {
                break;
            }
        }

        self.inner.batch_active.store(false, Ordering::Release);

        // Anything queued while the flag was being cleared
        self.flush_all().await;

        let stats = self.stats();
        info!(
            "📦 Failure batch complete: {} written, {} dropped",
            stats.written, stats.dropped
        );
    }

    /// Write everything currently queued
    ///
    /// Waits for a flush already in progress and then drains what is left, so
    /// the queue is empty (or only holds records queued concurrently) on return.
    pub async fn flush_all(&self) {
        let _guard = self.inner.flush_lock.lock().await;

        loop {
            let Some(mut item) = self.queue().pop_front() else {
                break;
            };

            match write_record(&item.path, &item.contents).await {
                Ok(written) => {
                    if written != item.path {
                        debug!("Failure file name taken, wrote {:?}", written);
                    }
                    self.inner.written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    item.attempts += 1;
                    if item.attempts < self.inner.max_write_attempts {
                        warn!(
                            "{} (attempt {}/{}), retrying",
                            e, item.attempts, self.inner.max_write_attempts
                        );
                        self.inner.retried.fetch_add(1, Ordering::Relaxed);
                        self.queue().push_front(item);
                        tokio::time::sleep(self.inner.write_retry_delay).await;
                    } else {
                        error!(
                            "Dropping failure record {:?} after {} attempts: {}",
                            item.path, item.attempts, e
                        );
                        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> FailureStats {
        FailureStats {
            queued: self.queue().len(),
            written: self.inner.written.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            retried: self.inner.retried.load(Ordering::Relaxed),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<PendingWrite>> {
        // A panic while holding the lock cannot leave the deque half-updated
        self.inner.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn write_record(path: &Path, contents: &[u8]) -> Result<PathBuf, ProbeError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ProbeError::WriteFailure(format!("{:?}: {}", parent, e)))?;
    }

    for n in 0..MAX_NAME_SUFFIX {
        let candidate = if n == 0 {
            path.to_path_buf()
        } else {
            with_name_suffix(path, n)
        };

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(ProbeError::WriteFailure(format!("{:?}: {}", candidate, e))),
        };

        file.write_all(contents)
            .await
            .map_err(|e| ProbeError::WriteFailure(format!("{:?}: {}", candidate, e)))?;
        file.flush()
            .await
            .map_err(|e| ProbeError::WriteFailure(format!("{:?}: {}", candidate, e)))?;
        return Ok(candidate);
    }

    Err(ProbeError::WriteFailure(format!(
        "{:?}: {} names already taken",
        path, MAX_NAME_SUFFIX
    )))
}
