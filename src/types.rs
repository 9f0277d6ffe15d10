//! Core types for endpoint health checking
//!
//! These types describe the endpoints handed to the checker, the records it
//! produces for healthy endpoints and the failure records it writes for
//! everything else. Records are serialized in camelCase because the output
//! files are consumed by non-Rust tooling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// ENDPOINTS
// =============================================================================

/// Upstream list an endpoint was discovered in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointSource {
    /// chainlist.org embedded object literal
    Chainlist,

    /// ethereum-lists chain metadata API
    EthereumLists,

    /// Static network registry file
    NetworkRegistry,
}

/// One candidate RPC URL with the chain it is expected to serve
///
/// Identity is `(chain_id, url)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Expected chain id (decimal string)
    pub chain_id: String,

    /// RPC URL
    pub url: String,

    /// Where this endpoint came from
    pub source: EndpointSource,
}

impl Endpoint {
    pub fn new(chain_id: impl Into<String>, url: impl Into<String>, source: EndpointSource) -> Self {
        Self {
            chain_id: chain_id.into(),
            url: url.into(),
            source,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.chain_id, self.url)
    }
}

// =============================================================================
// TEST STAGES
// =============================================================================

/// Stage of an endpoint test
///
/// The protocol stages run strictly in order: `ChainId`, `BlockNumber`,
/// `GetLogs`. `ChainIdValidation` is the post-run quorum check and
/// `Capability` covers the probe pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestStage {
    Idle,
    ChainId,
    BlockNumber,
    GetLogs,
    Finished,
    Failed,
    ChainIdValidation,
    Capability,
}

impl TestStage {
    /// JSON-RPC method exercised by a protocol stage
    pub fn method(&self) -> Option<&'static str> {
        match self {
            TestStage::ChainId => Some(crate::rpc::protocol::ETH_CHAIN_ID),
            TestStage::BlockNumber => Some(crate::rpc::protocol::ETH_BLOCK_NUMBER),
            TestStage::GetLogs => Some(crate::rpc::protocol::ETH_GET_LOGS),
            _ => None,
        }
    }
}

impl fmt::Display for TestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestStage::Idle => "idle",
            TestStage::ChainId => "chainId",
            TestStage::BlockNumber => "blockNumber",
            TestStage::GetLogs => "getLogs",
            TestStage::Finished => "finished",
            TestStage::Failed => "failed",
            TestStage::ChainIdValidation => "chainIdValidation",
            TestStage::Capability => "capability",
        };
        f.write_str(name)
    }
}

// =============================================================================
// RECORDS
// =============================================================================

/// Endpoint that passed every required stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthyRecord {
    /// Expected chain id
    pub chain_id: String,

    pub url: String,

    pub source: EndpointSource,

    /// Sum of the successful stage response times (excludes backoff waits)
    pub response_time_ms: u64,

    /// Chain id reported by the endpoint (decimal)
    pub returned_chain_id: String,

    /// Head block reported by the endpoint
    pub last_block_number: u64,

    /// Largest accepted JSON-RPC batch, filled by the probe pass
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_batch_size: Option<u64>,

    /// Largest accepted `eth_getLogs` block range, filled by the probe pass
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub get_logs_block_depth: Option<u64>,
}

impl HealthyRecord {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.chain_id.clone(), self.url.clone(), self.source)
    }
}

/// Structured failure written to the failure log directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub url: String,

    pub expected_chain_id: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub returned_chain_id: Option<String>,

    pub timestamp: DateTime<Utc>,

    pub stage: TestStage,

    /// Short reason, e.g. "eth_chainId test failed"
    pub reason: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_kind: Option<String>,

    /// Detail of the last error seen
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub http_status: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response_time_ms: Option<u64>,

    pub attempts: u32,

    /// Gave up because the server's `Retry-After` was beyond the ceiling
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub retry_after_exceeded: bool,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub test_duration_ms: Option<u64>,
}

impl FailureRecord {
    /// Failure for an endpoint at a stage, with no error detail yet
    pub fn new(endpoint: &Endpoint, stage: TestStage, reason: impl Into<String>) -> Self {
        Self {
            url: endpoint.url.clone(),
            expected_chain_id: endpoint.chain_id.clone(),
            returned_chain_id: None,
            timestamp: Utc::now(),
            stage,
            reason: reason.into(),
            error_kind: None,
            error: None,
            http_status: None,
            response_time_ms: None,
            attempts: 0,
            retry_after_exceeded: false,
            test_duration_ms: None,
        }
    }

    /// Attach the error that caused the failure
    pub fn with_error(mut self, error: &ProbeError) -> Self {
        self.error_kind = Some(error.kind().to_string());
        self.error = Some(error.to_string());
        self.http_status = error.http_status();
        if let ProbeError::ChainIdMismatch { returned, .. } = error {
            self.returned_chain_id = Some(returned.clone());
        }
        self
    }

    /// Mark a stage cut short by an oversized `Retry-After`
    pub fn with_retry_after_exceeded(mut self) -> Self {
        self.retry_after_exceeded = true;
        if let Some(error) = self.error.as_mut() {
            error.push_str(" (Retry-After exceeds ceiling)");
        }
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.test_duration_ms = Some(duration_ms);
        self
    }

    pub fn with_response_time_ms(mut self, response_time_ms: u64) -> Self {
        self.response_time_ms = Some(response_time_ms);
        self
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Everything that can go wrong while probing an endpoint
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("Request timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("JSON parse failed or timed out: {0}")]
    ParseTimeout(String),

    #[error("{0}")]
    MalformedResult(String),

    #[error("Max duration exceeded")]
    MaxDurationExceeded,

    #[error("Chain id mismatch: expected {expected}, dominant {dominant}, returned {returned}")]
    ChainIdMismatch {
        expected: String,
        dominant: String,
        returned: String,
    },

    #[error("Failed to write failure record: {0}")]
    WriteFailure(String),
}

impl ProbeError {
    /// Stable name of the error kind, used in failure records and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::Timeout => "Timeout",
            ProbeError::Transport(_) => "TransportError",
            ProbeError::Http { .. } => "HttpError",
            ProbeError::RateLimited { .. } => "RateLimited",
            ProbeError::ParseTimeout(_) => "ParseTimeout",
            ProbeError::MalformedResult(_) => "MalformedResult",
            ProbeError::MaxDurationExceeded => "MaxDurationExceeded",
            ProbeError::ChainIdMismatch { .. } => "ChainIdMismatch",
            ProbeError::WriteFailure(_) => "WriteFailure",
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ProbeError::RateLimited { .. })
    }

    /// HTTP status carried by the error, if any
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ProbeError::Http { status, .. } => Some(*status),
            ProbeError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}
