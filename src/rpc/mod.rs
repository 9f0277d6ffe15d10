//! JSON-RPC Invoker Module
//!
//! Issues one JSON-RPC call against an endpoint with a hard timeout and
//! classifies what came back:
//!
//! | Response                         | Outcome                         |
//! |----------------------------------|---------------------------------|
//! | 429                              | `RateLimited { retry_after_ms }`|
//! | other non-2xx                    | `Http { status, message }`      |
//! | 2xx, body not JSON / parse slow  | `ParseTimeout`                  |
//! | 2xx, JSON body                   | `Ok(RpcResponse)`               |
//! | no response before the deadline  | `Timeout`                       |
//! | connection/TLS/DNS failure       | `Transport`                     |
//!
//! All calls share one `reqwest::Client`, so keep-alive connections are
//! reused across endpoints on the same host and scheme.

pub mod protocol;
pub mod retry;

pub use retry::{execute_with_retries, RetryPolicy};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::ProbeConfig;
use crate::types::ProbeError;

/// Maximum body characters kept in HTTP error messages
const ERROR_BODY_PREVIEW_CHARS: usize = 200;

/// Idle keep-alive connections kept per host
const POOL_MAX_IDLE_PER_HOST: usize = 4;

/// Parsed response of a successful call
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    /// Parsed JSON body (object for single calls, array for batches)
    pub payload: Value,

    /// Wall clock from send to parse completion
    pub response_time_ms: u64,
}

/// Classified outcome of one call
pub type CallOutcome = Result<RpcResponse, ProbeError>;

/// Something that can deliver a JSON-RPC body to an endpoint
#[async_trait]
pub trait RpcInvoker: Send + Sync {
    /// Send a pre-built body (single envelope or batch array)
    async fn invoke(&self, url: &str, body: &Value) -> CallOutcome;

    /// Next request id
    fn next_id(&self) -> u64;

    /// Send a single call
    async fn call(&self, url: &str, method: &'static str, params: Value) -> CallOutcome {
        let request = protocol::JsonRpcRequest::new(method, params, self.next_id());
        self.invoke(url, &request.to_value()).await
    }
}

/// HTTP invoker backed by a shared `reqwest` connection pool
pub struct HttpInvoker {
    client: reqwest::Client,
    request_timeout: Duration,
    json_parse_timeout: Duration,
    request_id: AtomicU64,
}

impl HttpInvoker {
    pub fn new(config: &ProbeConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            request_timeout: config.request_timeout(),
            json_parse_timeout: config.json_parse_timeout(),
            request_id: AtomicU64::new(1),
        })
    }

    async fn send(&self, url: &str, body: &Value, started: Instant) -> CallOutcome {
        let response = match tokio::time::timeout(
            self.request_timeout,
            self.client.post(url).json(body).send(),
        )
        .await
        {
            Err(_) => return Err(ProbeError::Timeout),
            Ok(Err(e)) => return Err(classify_transport_error(e)),
            Ok(Ok(response)) => response,
        };

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProbeError::RateLimited {
                retry_after_ms: parse_retry_after(response.headers(), Utc::now()),
            });
        }

        let remaining = self.request_timeout.saturating_sub(started.elapsed());

        if !status.is_success() {
            // Body is diagnostics only; a slow or broken body does not change the outcome
            let body = match tokio::time::timeout(remaining, response.text()).await {
                Ok(Ok(text)) => truncate(&text, ERROR_BODY_PREVIEW_CHARS),
                _ => String::new(),
            };
            let reason = status.canonical_reason().unwrap_or("Unknown");
            let message = if body.is_empty() {
                reason.to_string()
            } else {
                format!("{} - {}", reason, body)
            };
            return Err(ProbeError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = match tokio::time::timeout(remaining, response.bytes()).await {
            Err(_) => return Err(ProbeError::Timeout),
            Ok(Err(e)) => return Err(classify_transport_error(e)),
            Ok(Ok(bytes)) => bytes,
        };

        let parse = tokio::task::spawn_blocking(move || serde_json::from_slice::<Value>(&bytes));
        let payload = match tokio::time::timeout(self.json_parse_timeout, parse).await {
            Err(_) => {
                return Err(ProbeError::ParseTimeout(format!(
                    "parse exceeded {:?}",
                    self.json_parse_timeout
                )))
            }
            Ok(Err(e)) => return Err(ProbeError::ParseTimeout(format!("parse task failed: {}", e))),
            Ok(Ok(Err(e))) => return Err(ProbeError::ParseTimeout(e.to_string())),
            Ok(Ok(Ok(payload))) => payload,
        };

        Ok(RpcResponse {
            payload,
            response_time_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl RpcInvoker for HttpInvoker {
    async fn invoke(&self, url: &str, body: &Value) -> CallOutcome {
        let started = Instant::now();
        let outcome = self.send(url, body, started).await;

        if let Err(e) = &outcome {
            debug!("{} -> {} after {:?}", url, e, started.elapsed());
        }

        outcome
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn classify_transport_error(error: reqwest::Error) -> ProbeError {
    if error.is_timeout() {
        ProbeError::Timeout
    } else {
        ProbeError::Transport(error.to_string())
    }
}

/// Convert a `Retry-After` header (delta seconds or HTTP date) to milliseconds
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<u64> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs.saturating_mul(1000));
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    let wait = (date - now).num_milliseconds().max(0);
    Some(wait as u64)
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
