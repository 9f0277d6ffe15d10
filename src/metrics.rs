//! Run Metrics
//!
//! Counters collected while a refresh runs, and the summary logged (and
//! written next to the results) when it ends.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::types::TestStage;

/// Metrics collector for one refresh run
#[derive(Default)]
pub struct RunMetrics {
    /// Start time for elapsed calculation
    start_time: Option<Instant>,

    /// Endpoints admitted to the primary pass
    pub endpoints_total: AtomicU64,

    /// Endpoint tests that reached a terminal state
    pub endpoints_completed: AtomicU64,

    /// Endpoints that passed every stage (before quorum)
    pub endpoints_passed: AtomicU64,

    /// Endpoints that failed a stage or were abandoned
    pub endpoints_failed: AtomicU64,

    /// Endpoints dropped by the chain-id quorum
    pub chain_id_mismatches: AtomicU64,

    /// Terminal failures per stage
    pub chain_id_failures: AtomicU64,
    pub block_number_failures: AtomicU64,
    pub get_logs_failures: AtomicU64,
    pub max_duration_failures: AtomicU64,

    /// 429 responses seen
    pub rate_limited_responses: AtomicU64,

    /// Attempts beyond the first, across all stages
    pub retries: AtomicU64,

    /// Capability probes completed
    pub probes_completed: AtomicU64,
}

impl RunMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    /// Elapsed time since the run started
    pub fn elapsed_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn set_endpoints_total(&self, total: u64) {
        self.endpoints_total.store(total, Ordering::Relaxed);
    }

    pub fn inc_completed(&self) {
        self.endpoints_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_passed(&self) {
        self.endpoints_passed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.rate_limited_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_retries(&self, count: u32) {
        self.retries.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn add_chain_id_mismatches(&self, count: u64) {
        self.chain_id_mismatches.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_probes_completed(&self) {
        self.probes_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a terminal failure at a protocol stage
    pub fn record_failure(&self, stage: TestStage) {
        self.endpoints_failed.fetch_add(1, Ordering::Relaxed);
        let counter = match stage {
            TestStage::ChainId => &self.chain_id_failures,
            TestStage::BlockNumber => &self.block_number_failures,
            TestStage::GetLogs => &self.get_logs_failures,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an endpoint abandoned at the max-duration cap
    pub fn record_abandoned(&self) {
        self.endpoints_failed.fetch_add(1, Ordering::Relaxed);
        self.max_duration_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Failures per stage, keyed by stage name
    pub fn stage_failures(&self) -> BTreeMap<String, u64> {
        let mut map = BTreeMap::new();
        map.insert(TestStage::ChainId.to_string(), self.chain_id_failures.load(Ordering::Relaxed));
        map.insert(TestStage::BlockNumber.to_string(), self.block_number_failures.load(Ordering::Relaxed));
        map.insert(TestStage::GetLogs.to_string(), self.get_logs_failures.load(Ordering::Relaxed));
        map.insert("maxDuration".to_string(), self.max_duration_failures.load(Ordering::Relaxed));
        map
    }

    /// Build the end-of-run summary
    pub fn summary(&self, healthy: u64, chains_without_healthy: Vec<String>) -> RunSummary {
        RunSummary {
            total: self.endpoints_total.load(Ordering::Relaxed),
            healthy,
            failed: self.endpoints_failed.load(Ordering::Relaxed),
            chain_id_mismatches: self.chain_id_mismatches.load(Ordering::Relaxed),
            stage_failures: self.stage_failures(),
            rate_limited_responses: self.rate_limited_responses.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            chains_without_healthy,
            elapsed_secs: self.elapsed_secs(),
        }
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "elapsed_secs": self.elapsed_secs(),
            "endpoints": {
                "total": self.endpoints_total.load(Ordering::Relaxed),
                "completed": self.endpoints_completed.load(Ordering::Relaxed),
                "passed": self.endpoints_passed.load(Ordering::Relaxed),
                "failed": self.endpoints_failed.load(Ordering::Relaxed),
                "chain_id_mismatches": self.chain_id_mismatches.load(Ordering::Relaxed),
            },
            "stage_failures": self.stage_failures(),
            "rate_limited": self.rate_limited_responses.load(Ordering::Relaxed),
            "retries": self.retries.load(Ordering::Relaxed),
            "probes_completed": self.probes_completed.load(Ordering::Relaxed),
        })
    }
}

/// Structured summary of a finished run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total: u64,
    pub healthy: u64,
    pub failed: u64,
    pub chain_id_mismatches: u64,
    pub stage_failures: BTreeMap<String, u64>,
    pub rate_limited_responses: u64,
    pub retries: u64,
    /// Expected chains that ended the run with no healthy endpoint
    pub chains_without_healthy: Vec<String>,
    pub elapsed_secs: u64,
}
