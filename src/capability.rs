//! Capability Probes
//!
//! Finds the largest JSON-RPC batch and the widest `eth_getLogs` block range
//! an endpoint accepts. Both use [`find_max`]: a coarse binary search over a
//! candidate list followed by a fine binary search between the last accepted
//! and first rejected candidate.

use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::config::ProbeConfig;
use crate::metrics::RunMetrics;
use crate::rpc::protocol::{self, ETH_BLOCK_NUMBER, ETH_GET_LOGS};
use crate::rpc::{execute_with_retries, RetryPolicy, RpcInvoker};
use crate::tester::TestStatus;
use crate::types::{HealthyRecord, ProbeError, TestStage};

/// Largest value in `candidates` (refined to within `precision`) for which `test` holds
///
/// Returns 0 when the smallest candidate already fails. The returned value
/// always passed a test, so it never overshoots the real limit.
pub async fn find_max<F, Fut>(candidates: &[u64], precision: u64, mut test: F) -> u64
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = bool>,
{
    let mut sorted = candidates.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let Some(&smallest) = sorted.first() else {
        return 0;
    };
    if !test(smallest).await {
        return 0;
    }

    // sorted[lo] passed; everything above hi is known to fail
    let (mut lo, mut hi) = (0usize, sorted.len() - 1);
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        if test(sorted[mid]).await {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }

    if lo == sorted.len() - 1 {
        return sorted[lo];
    }

    let (mut good, mut bad) = (sorted[lo], sorted[lo + 1]);
    while bad - good > precision.max(1) {
        let mid = good + (bad - good) / 2;
        if test(mid).await {
            good = mid;
        } else {
            bad = mid;
        }
    }

    good
}

/// Capabilities measured for one endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub max_batch_size: Option<u64>,
    pub get_logs_block_depth: Option<u64>,
}

impl Capabilities {
    pub fn apply(&self, record: &mut HealthyRecord) {
        if self.max_batch_size.is_some() {
            record.max_batch_size = self.max_batch_size;
        }
        if self.get_logs_block_depth.is_some() {
            record.get_logs_block_depth = self.get_logs_block_depth;
        }
    }
}

/// Runs the capability probes against healthy endpoints
pub struct CapabilityProber {
    invoker: Arc<dyn RpcInvoker>,
    policy: RetryPolicy,
    metrics: Arc<RunMetrics>,
    probe_batch_size: bool,
    probe_log_depth: bool,
    batch_size_candidates: Vec<u64>,
    batch_size_precision: u64,
    log_range_candidates: Vec<u64>,
    log_range_precision: u64,
}

impl CapabilityProber {
    pub fn new(config: &ProbeConfig, invoker: Arc<dyn RpcInvoker>, metrics: Arc<RunMetrics>) -> Self {
        Self {
            invoker,
            policy: RetryPolicy::from_config(config),
            metrics,
            probe_batch_size: config.probe_batch_size,
            probe_log_depth: config.probe_log_depth,
            batch_size_candidates: config.batch_size_candidates.clone(),
            batch_size_precision: config.batch_size_precision,
            log_range_candidates: config.log_range_candidates.clone(),
            log_range_precision: config.log_range_precision,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.probe_batch_size || self.probe_log_depth
    }

    /// Run every enabled probe against one endpoint
    pub async fn probe(&self, record: &HealthyRecord, status: &TestStatus) -> Capabilities {
        status.enter_stage(TestStage::Capability);
        let mut caps = Capabilities::default();

        if self.probe_batch_size {
            caps.max_batch_size = Some(self.max_batch_size(&record.url, status).await);
        }
        if self.probe_log_depth {
            caps.get_logs_block_depth =
                Some(self.max_log_depth(&record.url, record.last_block_number, status).await);
        }

        status.finish();
        self.metrics.inc_probes_completed();
        debug!(
            "🔬 {} batch={:?} logDepth={:?}",
            record.url, caps.max_batch_size, caps.get_logs_block_depth
        );
        caps
    }

    /// Largest batch of `eth_blockNumber` calls the endpoint answers in full
    pub async fn max_batch_size(&self, url: &str, status: &TestStatus) -> u64 {
        find_max(&self.batch_size_candidates, self.batch_size_precision, |size| {
            self.supports(status, move |invoker| async move {
                let body = protocol::batch(ETH_BLOCK_NUMBER, &json!([]), size, invoker.next_id());
                let response = invoker.invoke(url, &body).await?;
                Ok::<_, ProbeError>(batch_accepted(&response.payload, size))
            })
        })
        .await
    }

    /// Widest `eth_getLogs` range ending at the head that the endpoint serves
    pub async fn max_log_depth(&self, url: &str, fallback_head: u64, status: &TestStatus) -> u64 {
        let head = self.current_head(url, status).await.unwrap_or(fallback_head);
        let candidates = depth_candidates(&self.log_range_candidates, head);

        find_max(&candidates, self.log_range_precision, |depth| {
            let from = head.saturating_sub(depth.saturating_sub(1));
            self.supports(status, move |invoker| async move {
                let response = invoker
                    .call(url, ETH_GET_LOGS, protocol::get_logs_params(from, head))
                    .await?;
                Ok::<_, ProbeError>(protocol::extract_result(&response.payload).is_ok())
            })
        })
        .await
    }

    async fn current_head(&self, url: &str, status: &TestStatus) -> Option<u64> {
        let invoker = self.invoker.as_ref();
        execute_with_retries(&self.policy, Some(status), || async move {
            let response = invoker.call(url, ETH_BLOCK_NUMBER, json!([])).await?;
            protocol::extract_hex_result(&response.payload, "Invalid blockNumber format")
        })
        .await
        .ok()
        .map(|retried| retried.value)
    }

    /// One probe step under the retry policy
    ///
    /// Call-level errors are retried. A well-formed answer is final: `Ok(true)`
    /// when the endpoint served the request, `Ok(false)` when it refused it.
    async fn supports<'a, F, Fut>(&'a self, status: &'a TestStatus, attempt: F) -> bool
    where
        F: Fn(&'a dyn RpcInvoker) -> Fut,
        Fut: Future<Output = Result<bool, ProbeError>>,
    {
        let invoker = self.invoker.as_ref();
        match execute_with_retries(&self.policy, Some(status), || attempt(invoker)).await {
            Ok(retried) => {
                self.metrics.add_retries(retried.attempts - 1);
                retried.value
            }
            Err(exhausted) => {
                self.metrics.add_retries(exhausted.attempts - 1);
                debug!("Probe step gave up: {}", exhausted);
                false
            }
        }
    }
}

/// Log range candidates a chain at `head` can actually span
///
/// Blocks `0..=head` are all there is, so larger candidates collapse to
/// `head + 1` and every probed range covers exactly the depth it reports.
fn depth_candidates(candidates: &[u64], head: u64) -> Vec<u64> {
    let chain_length = head.saturating_add(1);
    candidates.iter().map(|&depth| depth.min(chain_length)).collect()
}

/// A batch is accepted when every call came back without an error
fn batch_accepted(payload: &Value, size: u64) -> bool {
    match payload.as_array() {
        Some(items) => {
            items.len() as u64 == size
                && items
                    .iter()
                    .all(|item| item.get("error").map_or(true, Value::is_null))
        }
        None => false,
    }
}
