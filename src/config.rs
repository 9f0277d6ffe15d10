//! Health Check Configuration
//!
//! Configurable parameters for the endpoint checker.
//! Defaults are tuned for a full refresh of the public endpoint lists
//! (a few thousand URLs) from a single machine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a refresh run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    // === Concurrency ===

    /// Maximum endpoint tests (or probes) in flight at once
    pub concurrency_limit: usize,

    /// Wall-clock cap for one endpoint test (milliseconds)
    pub endpoint_max_duration_ms: u64,

    /// Interval between progress reports (milliseconds)
    pub progress_log_interval_ms: u64,

    // === Requests ===

    /// Hard timeout for a single JSON-RPC call (milliseconds)
    pub per_request_timeout_ms: u64,

    /// Timeout for parsing a response body (milliseconds)
    pub json_parse_timeout_ms: u64,

    /// User-Agent header sent with every request
    pub user_agent: String,

    // === Retries ===

    /// Additional attempts after the first one, per stage
    pub max_retries: u32,

    /// Base delay between attempts (milliseconds)
    pub retry_delay_ms: u64,

    /// Double the delay after every failed attempt
    pub exponential_backoff: bool,

    /// Give up instead of waiting when a rate-limit delay exceeds this (milliseconds)
    pub max_retry_after_timeout_ms: u64,

    // === Protocol ===

    /// Require the `eth_getLogs` stage to pass
    pub require_get_logs: bool,

    /// Number of blocks behind head covered by the `eth_getLogs` check
    pub get_logs_window: u64,

    // === Capability probes ===

    /// Run the batch-size probe
    pub probe_batch_size: bool,

    /// Run the log-depth probe
    pub probe_log_depth: bool,

    /// Batch sizes tried by the coarse search
    pub batch_size_candidates: Vec<u64>,

    /// Block ranges tried by the coarse search
    pub log_range_candidates: Vec<u64>,

    /// Fine search stops once the interval is this narrow
    pub batch_size_precision: u64,

    /// Fine search stops once the interval is this narrow
    pub log_range_precision: u64,

    // === Failure log ===

    /// Root directory for failure records
    pub failure_log_dir: PathBuf,

    /// Queue depth that triggers a warning
    pub failure_queue_warn_threshold: usize,

    /// Extra write attempts per failure record before it is dropped
    pub failure_write_retries: u32,

    /// Delay between write attempts (milliseconds)
    pub failure_write_retry_delay_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            // Concurrency
            concurrency_limit: 50,
            endpoint_max_duration_ms: 120_000,  // 2 minutes
            progress_log_interval_ms: 10_000,

            // Requests
            per_request_timeout_ms: 10_000,
            json_parse_timeout_ms: 5_000,
            user_agent: format!("rpc-healthcheck/{}", env!("CARGO_PKG_VERSION")),

            // Retries
            max_retries: 2,
            retry_delay_ms: 1_000,
            exponential_backoff: true,
            max_retry_after_timeout_ms: 30_000,

            // Protocol
            require_get_logs: true,
            get_logs_window: 10,

            // Capability probes
            probe_batch_size: true,
            probe_log_depth: true,
            batch_size_candidates: vec![1, 2, 5, 10, 20, 50, 100, 200, 500, 1000],
            log_range_candidates: vec![1, 10, 100, 500, 1_000, 5_000, 10_000, 50_000, 100_000],
            batch_size_precision: 5,
            log_range_precision: 500,

            // Failure log
            failure_log_dir: PathBuf::from("logs/failed-rpcs"),
            failure_queue_warn_threshold: 1_000,
            failure_write_retries: 3,
            failure_write_retry_delay_ms: 100,
        }
    }
}

impl ProbeConfig {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    // Builder-style methods for CLI overrides

    pub fn with_concurrency_limit(mut self, limit: Option<usize>) -> Self {
        if let Some(limit) = limit {
            self.concurrency_limit = limit;
        }
        self
    }

    pub fn with_failure_log_dir(mut self, dir: Option<PathBuf>) -> Self {
        if let Some(dir) = dir {
            self.failure_log_dir = dir;
        }
        self
    }

    pub fn with_probes_disabled(mut self, disabled: bool) -> Self {
        if disabled {
            self.probe_batch_size = false;
            self.probe_log_depth = false;
        }
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.per_request_timeout_ms)
    }

    pub fn json_parse_timeout(&self) -> Duration {
        Duration::from_millis(self.json_parse_timeout_ms)
    }

    pub fn endpoint_max_duration(&self) -> Duration {
        Duration::from_millis(self.endpoint_max_duration_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_log_interval_ms)
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency_limit == 0 {
            anyhow::bail!("concurrency_limit must be greater than 0");
        }

        if self.per_request_timeout_ms == 0 || self.json_parse_timeout_ms == 0 {
            anyhow::bail!("request and JSON parse timeouts must be greater than 0");
        }

        if self.progress_log_interval_ms == 0 {
            anyhow::bail!("progress_log_interval_ms must be greater than 0");
        }

        if self.endpoint_max_duration_ms <= self.per_request_timeout_ms {
            anyhow::bail!(
                "endpoint_max_duration_ms ({}) must be greater than per_request_timeout_ms ({})",
                self.endpoint_max_duration_ms,
                self.per_request_timeout_ms
            );
        }

        if self.probe_batch_size && self.batch_size_candidates.iter().all(|&c| c == 0) {
            anyhow::bail!("batch_size_candidates must contain at least one positive value");
        }

        if self.probe_log_depth && self.log_range_candidates.iter().all(|&c| c == 0) {
            anyhow::bail!("log_range_candidates must contain at least one positive value");
        }

        if self.batch_size_precision == 0 || self.log_range_precision == 0 {
            anyhow::bail!("probe precision must be at least 1");
        }

        Ok(())
    }
}
