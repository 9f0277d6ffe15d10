//! Refresh Runner
//!
//! One refresh is two passes over the endpoint list:
//!
//! 1. **Health checks**: every endpoint goes through the protocol stages on
//!    the scheduler, the survivors go through chain-id quorum, and every
//!    failure (stage, max duration, mismatch) lands in the failure log before
//!    the pass returns.
//! 2. **Capability probes** (optional): the validated endpoints are probed for
//!    batch size and log depth, and the results are written onto the records.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::capability::CapabilityProber;
use crate::config::ProbeConfig;
use crate::failures::FailureTracker;
use crate::metrics::{RunMetrics, RunSummary};
use crate::quorum::{self, validate_chain_ids};
use crate::rpc::RpcInvoker;
use crate::scheduler::{JobOutcome, Scheduler};
use crate::tester::EndpointTester;
use crate::types::{Endpoint, FailureRecord, HealthyRecord, ProbeError, TestStage};

/// Result of a refresh, as written to the output file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOutput {
    /// Validated endpoints per expected chain id
    pub healthy_rpcs: BTreeMap<String, Vec<HealthyRecord>>,

    /// Chain ids reported by excluded endpoints, per expected chain id
    pub chain_id_mismatches: BTreeMap<String, Vec<String>>,

    /// At least one endpoint was abandoned at the duration cap
    pub incomplete: bool,
}

impl RefreshOutput {
    pub fn healthy_count(&self) -> usize {
        self.healthy_rpcs.values().map(Vec::len).sum()
    }
}

/// Probe job: one healthy record and where to write its result back
#[derive(Debug, Clone)]
struct ProbeJob {
    chain_id: String,
    index: usize,
    record: HealthyRecord,
}

impl fmt::Display for ProbeJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.chain_id, self.record.url)
    }
}

pub struct RefreshRunner {
    config: ProbeConfig,
    invoker: Arc<dyn RpcInvoker>,
    tracker: FailureTracker,
    metrics: Arc<RunMetrics>,
    scheduler: Scheduler,
}

impl RefreshRunner {
    pub fn new(
        config: ProbeConfig,
        invoker: Arc<dyn RpcInvoker>,
        tracker: FailureTracker,
        metrics: Arc<RunMetrics>,
    ) -> Self {
        let scheduler = Scheduler::new(&config);
        Self {
            config,
            invoker,
            tracker,
            metrics,
            scheduler,
        }
    }

    /// Test every endpoint and resolve chain ids
    ///
    /// Every failure record produced by the pass is on disk when this returns.
    pub async fn run_health_checks(&self, endpoints: Vec<Endpoint>) -> RefreshOutput {
        self.metrics.set_endpoints_total(endpoints.len() as u64);
        self.tracker.start_test_batch();

        let input_order: HashMap<Endpoint, usize> = endpoints
            .iter()
            .enumerate()
            .map(|(i, endpoint)| (endpoint.clone(), i))
            .collect();

        let tester = Arc::new(EndpointTester::new(
            &self.config,
            self.invoker.clone(),
            self.tracker.clone(),
            self.metrics.clone(),
        ));

        let outcomes = self
            .scheduler
            .run("health check", endpoints, move |endpoint: Endpoint, status| {
                let tester = tester.clone();
                async move { tester.test(&endpoint, &status).await }
            })
            .await;

        let mut passed = Vec::new();
        let mut incomplete = false;

        for outcome in outcomes {
            self.metrics.inc_completed();
            match outcome {
                JobOutcome::Finished { result, .. } => passed.extend(result),
                JobOutcome::Abandoned {
                    job,
                    last_state,
                    elapsed,
                } => {
                    incomplete = true;
                    self.metrics.record_abandoned();
                    self.tracker.log_failure(
                        FailureRecord::new(&job, last_state.stage, "max duration exceeded")
                            .with_error(&ProbeError::MaxDurationExceeded)
                            .with_attempts(last_state.attempt)
                            .with_duration_ms(elapsed.as_millis() as u64),
                    );
                }
            }
        }

        // Completion order is arbitrary; publish in input order
        passed.sort_by_key(|record| {
            input_order
                .get(&record.endpoint())
                .copied()
                .unwrap_or(usize::MAX)
        });

        let resolved = validate_chain_ids(passed);
        for (record, dominant) in &resolved.excluded {
            self.tracker.log_failure(
                FailureRecord::new(&record.endpoint(), TestStage::ChainIdValidation, "chain id mismatch")
                    .with_error(&quorum::mismatch_error(record, dominant))
                    .with_response_time_ms(record.response_time_ms)
                    .with_attempts(1),
            );
        }
        self.metrics.add_chain_id_mismatches(resolved.excluded_count() as u64);

        self.tracker.complete_test_batch().await;

        let output = RefreshOutput {
            healthy_rpcs: resolved.validated,
            chain_id_mismatches: resolved.mismatches,
            incomplete,
        };

        info!(
            "✅ Health checks done: {} healthy across {} chains, {} mismatched{}",
            output.healthy_count(),
            output.healthy_rpcs.len(),
            resolved.excluded.len(),
            if incomplete { " (incomplete)" } else { "" }
        );

        output
    }

    /// Probe validated endpoints and write capabilities onto their records
    ///
    /// Returns the number of records that were probed to completion.
    pub async fn run_capability_probes(&self, healthy_rpcs: &mut BTreeMap<String, Vec<HealthyRecord>>) -> usize {
        let prober = Arc::new(CapabilityProber::new(
            &self.config,
            self.invoker.clone(),
            self.metrics.clone(),
        ));
        if !prober.is_enabled() {
            info!("Capability probes disabled");
            return 0;
        }

        let jobs: Vec<ProbeJob> = healthy_rpcs
            .iter()
            .flat_map(|(chain_id, records)| {
                records.iter().enumerate().map(|(index, record)| ProbeJob {
                    chain_id: chain_id.clone(),
                    index,
                    record: record.clone(),
                })
            })
            .collect();

        let outcomes = self
            .scheduler
            .run("capability probe", jobs, move |job: ProbeJob, status| {
                let prober = prober.clone();
                async move { prober.probe(&job.record, &status).await }
            })
            .await;

        let mut probed = 0;
        for outcome in outcomes {
            match outcome {
                JobOutcome::Finished { job, result, .. } => {
                    if let Some(record) = healthy_rpcs
                        .get_mut(&job.chain_id)
                        .and_then(|records| records.get_mut(job.index))
                    {
                        result.apply(record);
                        probed += 1;
                    }
                }
                JobOutcome::Abandoned { job, elapsed, .. } => {
                    warn!("Probe of {} abandoned after {:?}, left unprobed", job, elapsed);
                }
            }
        }

        info!("🔬 Capability probes done: {} endpoints probed", probed);
        probed
    }

    /// End-of-run summary for an output
    pub fn summarize(&self, endpoints: &[Endpoint], output: &RefreshOutput) -> RunSummary {
        let expected: BTreeSet<&str> = endpoints.iter().map(|e| e.chain_id.as_str()).collect();
        let chains_without_healthy = expected
            .into_iter()
            .filter(|chain| {
                output
                    .healthy_rpcs
                    .get(*chain)
                    .map_or(true, |records| records.is_empty())
            })
            .map(str::to_string)
            .collect();

        self.metrics
            .summary(output.healthy_count() as u64, chains_without_healthy)
    }
}
