//! Test support: a scripted in-memory `RpcInvoker`
//!
//! Replies are scripted per `(url, method)`. A script is a queue: each call
//! pops the front reply until one is left, which then sticks. Replies
//! registered for the url `"*"` apply to every url without its own script.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::rpc::protocol::{self, ETH_BLOCK_NUMBER, ETH_CHAIN_ID, ETH_GET_LOGS};
use crate::rpc::{CallOutcome, RpcInvoker, RpcResponse};
use crate::types::ProbeError;

const ANY_URL: &str = "*";

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// JSON-RPC success with this `result`
    Result(Value),

    /// JSON-RPC error object with this message
    RpcError(String),

    /// Call-level failure
    Fail(ProbeError),

    /// Never answers
    Hang,
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub url: String,
    pub method: String,
    pub params: Value,

    /// Number of envelopes when the body was a batch
    pub batch_size: Option<usize>,
}

#[derive(Default)]
pub struct ScriptedInvoker {
    replies: Mutex<HashMap<(String, String), VecDeque<ScriptedReply>>>,
    calls: Mutex<Vec<RecordedCall>>,
    batch_limits: Mutex<HashMap<String, usize>>,
    log_range_limits: Mutex<HashMap<String, u64>>,
    delay: Option<Duration>,
    response_time_ms: u64,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedInvoker {
    /// Invoker with no scripts; unscripted calls fail with a transport error
    pub fn new() -> Self {
        Self::default()
    }

    /// Every url reports `chain_hex`, head `block` and an empty log list
    pub fn healthy(chain_hex: &str, block: u64) -> Self {
        let invoker = Self::new();
        invoker.on(ANY_URL, ETH_CHAIN_ID, ScriptedReply::Result(json!(chain_hex)));
        invoker.on(
            ANY_URL,
            ETH_BLOCK_NUMBER,
            ScriptedReply::Result(json!(protocol::to_hex_quantity(block))),
        );
        invoker.on(ANY_URL, ETH_GET_LOGS, ScriptedReply::Result(json!([])));
        invoker
    }

    /// Append a reply to the script for `(url, method)`
    pub fn on(&self, url: &str, method: &str, reply: ScriptedReply) {
        self.replies
            .lock()
            .unwrap()
            .entry((url.to_string(), method.to_string()))
            .or_default()
            .push_back(reply);
    }

    /// Largest batch `url` accepts; larger batches get a JSON-RPC error
    pub fn limit_batch(&self, url: &str, max: usize) {
        self.batch_limits.lock().unwrap().insert(url.to_string(), max);
    }

    /// Widest `eth_getLogs` range `url` accepts
    pub fn limit_log_range(&self, url: &str, max_blocks: u64) {
        self.log_range_limits.lock().unwrap().insert(url.to_string(), max_blocks);
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_response_time(mut self, ms: u64) -> Self {
        self.response_time_ms = ms;
        self
    }

    pub fn calls(&self, url: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.url == url)
            .cloned()
            .collect()
    }

    pub fn methods_called(&self, url: &str) -> Vec<String> {
        self.calls(url).into_iter().map(|c| c.method).collect()
    }

    pub fn last_params(&self, url: &str, method: &str) -> Option<Value> {
        self.calls(url)
            .into_iter()
            .rev()
            .find(|c| c.method == method && c.batch_size.is_none())
            .map(|c| c.params)
    }

    /// Batch sizes sent to `url`, in order
    pub fn batch_sizes(&self, url: &str) -> Vec<usize> {
        self.calls(url).into_iter().filter_map(|c| c.batch_size).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, url: &str, method: &str) -> Option<ScriptedReply> {
        let mut replies = self.replies.lock().unwrap();
        let key = [url, ANY_URL]
            .into_iter()
            .map(|u| (u.to_string(), method.to_string()))
            .find(|k| replies.contains_key(k))?;
        let script = replies.get_mut(&key)?;
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
    }

    fn reply_for(&self, url: &str, envelope: &Value, reply: Option<ScriptedReply>) -> Result<Value, ProbeError> {
        let method = envelope["method"].as_str().unwrap_or_default();
        let id = envelope["id"].clone();

        if method == ETH_GET_LOGS {
            if let Some(max) = self.log_range_limits.lock().unwrap().get(url) {
                if log_range(&envelope["params"]).is_some_and(|range| range > *max) {
                    return Ok(error_envelope(id, "query exceeds max block range"));
                }
            }
        }

        match reply {
            Some(ScriptedReply::Result(result)) => {
                Ok(json!({"jsonrpc": "2.0", "id": id, "result": result}))
            }
            Some(ScriptedReply::RpcError(message)) => Ok(error_envelope(id, &message)),
            Some(ScriptedReply::Fail(error)) => Err(error),
            Some(ScriptedReply::Hang) | None => {
                Err(ProbeError::Transport(format!("no scripted reply for {} {}", url, method)))
            }
        }
    }

    fn record(&self, url: &str, envelope: &Value, batch_size: Option<usize>) {
        self.calls.lock().unwrap().push(RecordedCall {
            url: url.to_string(),
            method: envelope["method"].as_str().unwrap_or_default().to_string(),
            params: envelope["params"].clone(),
            batch_size,
        });
    }
}

#[async_trait]
impl RpcInvoker for ScriptedInvoker {
    async fn invoke(&self, url: &str, body: &Value) -> CallOutcome {
        let _gauge = InFlight::enter(&self.in_flight, &self.max_in_flight);

        let (first, batch_size) = match body.as_array() {
            Some(batch) => (batch.first().cloned().unwrap_or(Value::Null), Some(batch.len())),
            None => (body.clone(), None),
        };
        self.record(url, &first, batch_size);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let payload = match body.as_array() {
            Some(batch) => {
                let limit = self.batch_limits.lock().unwrap().get(url).copied();
                if limit.is_some_and(|max| batch.len() > max) {
                    error_envelope(Value::Null, "batch too large")
                } else {
                    let mut results = Vec::with_capacity(batch.len());
                    for envelope in batch {
                        let method = envelope["method"].as_str().unwrap_or_default();
                        let reply = self.next_reply(url, method);
                        results.push(self.reply_for(url, envelope, reply)?);
                    }
                    Value::Array(results)
                }
            }
            None => {
                let method = body["method"].as_str().unwrap_or_default();
                let reply = self.next_reply(url, method);
                if matches!(reply, Some(ScriptedReply::Hang)) {
                    std::future::pending::<()>().await;
                }
                self.reply_for(url, body, reply)?
            }
        };

        Ok(RpcResponse {
            payload,
            response_time_ms: self.response_time_ms,
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn error_envelope(id: Value, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32005, "message": message}})
}

/// Blocks covered by `eth_getLogs` params
fn log_range(params: &Value) -> Option<u64> {
    let filter = params.get(0)?;
    let from = protocol::parse_hex_quantity(filter.get("fromBlock")?)?;
    let to = protocol::parse_hex_quantity(filter.get("toBlock")?)?;
    Some(to.saturating_sub(from) + 1)
}

/// In-flight gauge that also counts calls dropped mid-flight
struct InFlight<'a> {
    gauge: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(gauge: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = gauge.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { gauge }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Failure files written below `dir`
pub fn failure_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

/// Parsed failure records below `dir`
pub fn failure_records(dir: &std::path::Path) -> Vec<crate::types::FailureRecord> {
    failure_files(dir)
        .iter()
        .map(|path| serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap())
        .collect()
}
