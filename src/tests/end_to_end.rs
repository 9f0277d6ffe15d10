//! Full refresh against mock JSON-RPC nodes over real HTTP

use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use super::support::failure_records;
use crate::config::ProbeConfig;
use crate::failures::FailureTracker;
use crate::metrics::RunMetrics;
use crate::refresh::RefreshRunner;
use crate::rpc::HttpInvoker;
use crate::types::{Endpoint, EndpointSource, TestStage};

/// Answers every call like a synced mainnet node
async fn mainnet_node(Json(body): Json<Value>) -> Json<Value> {
    match body {
        Value::Array(calls) => Json(Value::Array(calls.iter().map(answer).collect())),
        call => Json(answer(&call)),
    }
}

fn answer(call: &Value) -> Value {
    let result = match call["method"].as_str() {
        Some("eth_chainId") => json!("0x1"),
        Some("eth_blockNumber") => json!("0x12d687"),
        Some("eth_getLogs") => json!([]),
        _ => {
            return json!({
                "jsonrpc": "2.0",
                "id": call["id"],
                "error": {"code": -32601, "message": "method not found"}
            })
        }
    };
    json!({"jsonrpc": "2.0", "id": call["id"], "result": result})
}

/// Accepts the connection and never answers in time
async fn unresponsive_node() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(30)).await;
    Json(json!({}))
}

async fn spawn_nodes() -> String {
    let app = Router::new()
        .route("/a", post(mainnet_node))
        .route("/b", post(mainnet_node))
        .route("/c", post(unresponsive_node));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn fast_config(failure_dir: &std::path::Path) -> ProbeConfig {
    let mut config = ProbeConfig::default();
    config.per_request_timeout_ms = 200;
    config.json_parse_timeout_ms = 200;
    config.max_retries = 2;
    config.retry_delay_ms = 10;
    config.endpoint_max_duration_ms = 10_000;
    config.progress_log_interval_ms = 100;
    config.batch_size_candidates = vec![1, 10, 50];
    config.log_range_candidates = vec![10, 1_000];
    config.failure_log_dir = failure_dir.to_path_buf();
    config
}

#[tokio::test]
async fn test_refresh_keeps_live_endpoints_and_logs_the_dead_one() {
    let base = spawn_nodes().await;
    let dir = tempdir().unwrap();
    let config = fast_config(dir.path());

    let endpoints = vec![
        Endpoint::new("1", format!("{}/a", base), EndpointSource::Chainlist),
        Endpoint::new("1", format!("{}/b", base), EndpointSource::EthereumLists),
        Endpoint::new("1", format!("{}/c", base), EndpointSource::NetworkRegistry),
    ];

    let invoker = Arc::new(HttpInvoker::new(&config).unwrap());
    let tracker = FailureTracker::new(&config);
    let metrics = Arc::new(RunMetrics::new());
    let runner = RefreshRunner::new(config, invoker, tracker.clone(), metrics);

    let output = runner.run_health_checks(endpoints.clone()).await;

    let urls: Vec<&str> = output.healthy_rpcs["1"].iter().map(|r| r.url.as_str()).collect();
    assert_eq!(urls, vec![endpoints[0].url.as_str(), endpoints[1].url.as_str()]);
    assert!(output.chain_id_mismatches.is_empty());
    assert!(!output.incomplete);

    let record = &output.healthy_rpcs["1"][0];
    assert_eq!(record.returned_chain_id, "1");
    assert_eq!(record.last_block_number, 0x12d687);
    assert_eq!(record.source, EndpointSource::Chainlist);

    // The batch is complete, so the failure is already on disk
    let failures = failure_records(dir.path());
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].url, endpoints[2].url);
    assert_eq!(failures[0].reason, "eth_chainId test failed");
    assert_eq!(failures[0].stage, TestStage::ChainId);
    assert_eq!(failures[0].error_kind.as_deref(), Some("Timeout"));
    assert_eq!(failures[0].attempts, 3);

    let summary = runner.summarize(&endpoints, &output);
    assert_eq!(summary.total, 3);
    assert_eq!(summary.healthy, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.stage_failures["chainId"], 1);
    assert!(summary.chains_without_healthy.is_empty());
}

#[tokio::test]
async fn test_probe_pass_enriches_records_over_http() {
    let base = spawn_nodes().await;
    let dir = tempdir().unwrap();
    let config = fast_config(dir.path());

    let endpoints = vec![Endpoint::new("1", format!("{}/a", base), EndpointSource::Chainlist)];

    let invoker = Arc::new(HttpInvoker::new(&config).unwrap());
    let tracker = FailureTracker::new(&config);
    let runner = RefreshRunner::new(config, invoker, tracker, Arc::new(RunMetrics::new()));

    let mut output = runner.run_health_checks(endpoints).await;
    let probed = runner.run_capability_probes(&mut output.healthy_rpcs).await;

    assert_eq!(probed, 1);
    let record = &output.healthy_rpcs["1"][0];
    assert_eq!(record.max_batch_size, Some(50));
    assert_eq!(record.get_logs_block_depth, Some(1_000));

    let json = serde_json::to_value(&output).unwrap();
    assert_eq!(json["healthyRpcs"]["1"][0]["maxBatchSize"], 50);
    assert_eq!(json["healthyRpcs"]["1"][0]["getLogsBlockDepth"], 1_000);
    assert_eq!(json["incomplete"], false);
}
