//! JSON-RPC Protocol Constants and Utilities

use serde::Serialize;
use serde_json::Value;

use crate::types::ProbeError;

pub const ETH_CHAIN_ID: &str = "eth_chainId";
pub const ETH_BLOCK_NUMBER: &str = "eth_blockNumber";
pub const ETH_GET_LOGS: &str = "eth_getLogs";

/// JSON-RPC request envelope
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: Value,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(method: &'static str, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
            id,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "jsonrpc": self.jsonrpc,
            "method": self.method,
            "params": self.params,
            "id": self.id,
        })
    }
}

/// Batch of `size` identical calls with ids `first_id..first_id + size`
pub fn batch(method: &'static str, params: &Value, size: u64, first_id: u64) -> Value {
    Value::Array(
        (0..size)
            .map(|i| JsonRpcRequest::new(method, params.clone(), first_id + i).to_value())
            .collect(),
    )
}

/// `eth_getLogs` params covering `[from, to]`
pub fn get_logs_params(from: u64, to: u64) -> Value {
    serde_json::json!([{
        "fromBlock": to_hex_quantity(from),
        "toBlock": to_hex_quantity(to),
    }])
}

pub fn to_hex_quantity(value: u64) -> String {
    format!("0x{:x}", value)
}

/// Parse a quantity of the form `^0x[0-9A-Fa-f]+$`
pub fn parse_hex_quantity(value: &Value) -> Option<u64> {
    let digits = value.as_str()?.strip_prefix("0x")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Extract `result` from a single JSON-RPC response
///
/// A response carrying an `error` object (or no `result` at all) is a
/// malformed result for the purpose of endpoint testing.
pub fn extract_result(payload: &Value) -> Result<&Value, ProbeError> {
    if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(ProbeError::MalformedResult(format!("JSON-RPC error: {}", message)));
    }

    payload
        .get("result")
        .ok_or_else(|| ProbeError::MalformedResult("Missing result".to_string()))
}

/// Extract a hex quantity result, failing with `invalid_message` on any other shape
pub fn extract_hex_result(payload: &Value, invalid_message: &str) -> Result<u64, ProbeError> {
    let result = extract_result(payload)?;
    parse_hex_quantity(result).ok_or_else(|| ProbeError::MalformedResult(invalid_message.to_string()))
}
