//! Endpoint Tester
//!
//! Runs the ordered protocol check for one endpoint:
//!
//! 1. `eth_chainId` must return a hex quantity (the reported chain id)
//! 2. `eth_blockNumber` must return a hex quantity (the head block)
//! 3. `eth_getLogs` over the last few blocks must return an array
//!
//! Each stage is retried independently. If any stage runs out of retries
//! the endpoint fails as a whole: a failure record is logged for that stage
//! and no healthy record is produced.

mod state;

pub use state::{EndpointTestState, TestStatus};

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::ProbeConfig;
use crate::failures::FailureTracker;
use crate::metrics::RunMetrics;
use crate::rpc::protocol::{self, ETH_CHAIN_ID};
use crate::rpc::{execute_with_retries, RetryPolicy, RpcInvoker};
use crate::types::{Endpoint, FailureRecord, HealthyRecord, ProbeError, TestStage};

/// Validates the payload of one stage
type StageCheck<T> = fn(&Value) -> Result<T, ProbeError>;

/// Tests endpoints against the JSON-RPC protocol stages
pub struct EndpointTester {
    invoker: Arc<dyn RpcInvoker>,
    policy: RetryPolicy,
    tracker: FailureTracker,
    metrics: Arc<RunMetrics>,
    require_get_logs: bool,
    get_logs_window: u64,
}

impl EndpointTester {
    pub fn new(
        config: &ProbeConfig,
        invoker: Arc<dyn RpcInvoker>,
        tracker: FailureTracker,
        metrics: Arc<RunMetrics>,
    ) -> Self {
        Self {
            invoker,
            policy: RetryPolicy::from_config(config),
            tracker,
            metrics,
            require_get_logs: config.require_get_logs,
            get_logs_window: config.get_logs_window,
        }
    }

    /// Test one endpoint, returning a record only if every stage passed
    pub async fn test(&self, endpoint: &Endpoint, status: &TestStatus) -> Option<HealthyRecord> {
        let started = Instant::now();
        let mut response_time_ms = 0u64;

        let chain_id = match self
            .run_stage(endpoint, status, TestStage::ChainId, json!([]), check_chain_id)
            .await
        {
            Ok((chain_id, elapsed)) => {
                response_time_ms += elapsed;
                chain_id.to_string()
            }
            Err(failure) => return self.fail(endpoint, status, failure, started),
        };

        let last_block_number = match self
            .run_stage(endpoint, status, TestStage::BlockNumber, json!([]), check_block_number)
            .await
        {
            Ok((block, elapsed)) => {
                response_time_ms += elapsed;
                block
            }
            Err(failure) => {
                let failure = FailureRecord {
                    returned_chain_id: Some(chain_id),
                    ..failure
                };
                return self.fail(endpoint, status, failure, started);
            }
        };

        if self.require_get_logs {
            let from = last_block_number.saturating_sub(self.get_logs_window);
            let params = protocol::get_logs_params(from, last_block_number);

            match self
                .run_stage(endpoint, status, TestStage::GetLogs, params, check_logs_array)
                .await
            {
                Ok(((), elapsed)) => response_time_ms += elapsed,
                Err(failure) => {
                    let failure = FailureRecord {
                        returned_chain_id: Some(chain_id),
                        ..failure
                    };
                    return self.fail(endpoint, status, failure, started);
                }
            }
        }

        status.finish();
        self.metrics.inc_passed();

        debug!(
            "✅ {} healthy (chain {}, block {}, {}ms)",
            endpoint, chain_id, last_block_number, response_time_ms
        );

        Some(HealthyRecord {
            chain_id: endpoint.chain_id.clone(),
            url: endpoint.url.clone(),
            source: endpoint.source,
            response_time_ms,
            returned_chain_id: chain_id,
            last_block_number,
            max_batch_size: None,
            get_logs_block_depth: None,
        })
    }

    /// Run one stage under the retry policy
    ///
    /// Returns the validated value and the response time of the successful
    /// attempt, or the failure record describing why the stage gave up.
    async fn run_stage<T>(
        &self,
        endpoint: &Endpoint,
        status: &TestStatus,
        stage: TestStage,
        params: Value,
        check: StageCheck<T>,
    ) -> Result<(T, u64), FailureRecord> {
        let method = stage.method().unwrap_or(ETH_CHAIN_ID);
        status.enter_stage(stage);

        let invoker = self.invoker.as_ref();
        let metrics = self.metrics.as_ref();
        let url = endpoint.url.as_str();
        let params = &params;

        let outcome = execute_with_retries(&self.policy, Some(status), || async move {
            let response = invoker
                .call(url, method, params.clone())
                .await
                .inspect_err(|e| {
                    if e.is_rate_limited() {
                        metrics.inc_rate_limited();
                    }
                })?;
            let value = check(&response.payload)?;
            Ok::<_, ProbeError>((value, response.response_time_ms))
        })
        .await;

        match outcome {
            Ok(retried) => {
                self.metrics.add_retries(retried.attempts - 1);
                Ok(retried.value)
            }
            Err(exhausted) => {
                self.metrics.add_retries(exhausted.attempts - 1);
                let failure = FailureRecord::new(endpoint, stage, format!("{} test failed", method))
                    .with_error(&exhausted.last_error)
                    .with_attempts(exhausted.attempts);
                Err(if exhausted.retry_after_exceeded {
                    failure.with_retry_after_exceeded()
                } else {
                    failure
                })
            }
        }
    }

    fn fail(
        &self,
        endpoint: &Endpoint,
        status: &TestStatus,
        failure: FailureRecord,
        started: Instant,
    ) -> Option<HealthyRecord> {
        info!(
            "❌ {} failed at {}: {}",
            endpoint,
            failure.stage,
            failure.error.as_deref().unwrap_or(&failure.reason)
        );

        status.fail(failure.reason.clone());
        self.metrics.record_failure(failure.stage);
        self.tracker
            .log_failure(failure.with_duration_ms(started.elapsed().as_millis() as u64));
        None
    }
}

fn check_chain_id(payload: &Value) -> Result<u64, ProbeError> {
    protocol::extract_hex_result(payload, "Invalid chainId format")
}

fn check_block_number(payload: &Value) -> Result<u64, ProbeError> {
    protocol::extract_hex_result(payload, "Invalid blockNumber format")
}

fn check_logs_array(payload: &Value) -> Result<(), ProbeError> {
    if protocol::extract_result(payload)?.is_array() {
        Ok(())
    } else {
        Err(ProbeError::MalformedResult("eth_getLogs result is not an array".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::{ETH_BLOCK_NUMBER, ETH_GET_LOGS};
    use crate::tests::support::{ScriptedInvoker, ScriptedReply};
    use tempfile::tempdir;

    fn fast_config() -> ProbeConfig {
        let mut config = ProbeConfig::default();
        config.max_retries = 2;
        config.retry_delay_ms = 10;
        config
    }

    fn tester(invoker: Arc<ScriptedInvoker>, root: &std::path::Path) -> (EndpointTester, FailureTracker) {
        let config = fast_config();
        let tracker = FailureTracker::with_root(root.to_path_buf(), &config);
        let tester = EndpointTester::new(&config, invoker, tracker.clone(), Arc::new(RunMetrics::new()));
        (tester, tracker)
    }

    fn endpoint(url: &str) -> Endpoint {
        Endpoint::new("1", url, crate::types::EndpointSource::Chainlist)
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_stages_pass() {
        let dir = tempdir().unwrap();
        let invoker = Arc::new(ScriptedInvoker::healthy("0x1", 0x100));
        let (tester, _) = tester(invoker.clone(), dir.path());

        let record = tester
            .test(&endpoint("https://a.example"), &TestStatus::detached())
            .await
            .unwrap();

        assert_eq!(record.returned_chain_id, "1");
        assert_eq!(record.last_block_number, 256);
        assert_eq!(
            invoker.methods_called("https://a.example"),
            vec![ETH_CHAIN_ID, ETH_BLOCK_NUMBER, ETH_GET_LOGS]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_chain_id_never_reaches_later_stages() {
        let dir = tempdir().unwrap();
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.on(
            "https://bad.example",
            ETH_CHAIN_ID,
            ScriptedReply::Result(json!("mainnet")),
        );
        let (tester, tracker) = tester(invoker.clone(), dir.path());

        tracker.start_test_batch();
        let status = TestStatus::detached();
        let record = tester.test(&endpoint("https://bad.example"), &status).await;
        tracker.complete_test_batch().await;

        assert!(record.is_none());
        // 1 attempt + 2 retries, all on eth_chainId
        assert_eq!(invoker.methods_called("https://bad.example"), vec![ETH_CHAIN_ID; 3]);
        assert_eq!(status.snapshot().stage, TestStage::Failed);
        assert_eq!(tracker.stats().written, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_logs_must_be_array() {
        let dir = tempdir().unwrap();
        let invoker = Arc::new(ScriptedInvoker::healthy("0x1", 50));
        invoker.on(
            "https://a.example",
            ETH_GET_LOGS,
            ScriptedReply::Result(json!({"logs": []})),
        );
        let (tester, tracker) = tester(invoker, dir.path());

        tracker.start_test_batch();
        let record = tester.test(&endpoint("https://a.example"), &TestStatus::detached()).await;
        tracker.complete_test_batch().await;

        assert!(record.is_none());
        assert_eq!(tracker.stats().written, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_logs_stage_can_be_skipped() {
        let dir = tempdir().unwrap();
        let invoker = Arc::new(ScriptedInvoker::healthy("0x89", 10));
        let mut config = fast_config();
        config.require_get_logs = false;
        let tracker = FailureTracker::with_root(dir.path().to_path_buf(), &config);
        let tester = EndpointTester::new(&config, invoker.clone(), tracker, Arc::new(RunMetrics::new()));

        let record = tester
            .test(&endpoint("https://a.example"), &TestStatus::detached())
            .await
            .unwrap();

        assert_eq!(record.returned_chain_id, "137");
        assert_eq!(
            invoker.methods_called("https://a.example"),
            vec![ETH_CHAIN_ID, ETH_BLOCK_NUMBER]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_time_is_sum_of_stages() {
        let dir = tempdir().unwrap();
        let invoker = Arc::new(ScriptedInvoker::healthy("0x1", 10).with_response_time(40));
        let (tester, _) = tester(invoker, dir.path());

        let record = tester
            .test(&endpoint("https://a.example"), &TestStatus::detached())
            .await
            .unwrap();

        assert_eq!(record.response_time_ms, 120);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_logs_window_clamps_at_genesis() {
        let dir = tempdir().unwrap();
        let invoker = Arc::new(ScriptedInvoker::healthy("0x1", 3));
        let (tester, _) = tester(invoker.clone(), dir.path());

        tester
            .test(&endpoint("https://a.example"), &TestStatus::detached())
            .await
            .unwrap();

        let params = invoker.last_params("https://a.example", ETH_GET_LOGS).unwrap();
        assert_eq!(params[0]["fromBlock"], "0x0");
        assert_eq!(params[0]["toBlock"], "0x3");
    }
}
