//! rpc-healthcheck
//!
//! Refreshes a list of public EVM JSON-RPC endpoints and keeps only the ones
//! that are live, serve the chain they claim to serve and answer the calls
//! indexers actually make.
//!
//! ## Pipeline
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      RPC HEALTHCHECK                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Endpoints JSON       ──→ candidate (chainId, url) pairs    │
//! │  Scheduler            ──→ bounded worker pool               │
//! │  Endpoint Tester      ──→ chainId → blockNumber → getLogs   │
//! │  Chain-ID Quorum      ──→ drop endpoints on the wrong chain │
//! │  Capability Probes    ──→ max batch size, max log depth     │
//! │  Failure Tracker      ──→ logs/failed-rpcs/<date>/<chain>/  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

mod capability;
mod config;
mod failures;
mod metrics;
mod quorum;
mod refresh;
mod rpc;
mod scheduler;
mod tester;
mod types;

#[cfg(test)]
mod tests;

use config::ProbeConfig;
use failures::FailureTracker;
use metrics::RunMetrics;
use refresh::{RefreshOutput, RefreshRunner};
use rpc::HttpInvoker;
use types::Endpoint;

/// Exit code after an interrupt
const EXIT_INTERRUPTED: i32 = 130;

/// rpc-healthcheck - JSON-RPC endpoint liveness and capability checker
#[derive(Parser, Debug)]
#[command(name = "rpc-healthcheck")]
#[command(version)]
#[command(about = "Test public JSON-RPC endpoints and publish the healthy ones", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "healthcheck.toml")]
    config: PathBuf,

    /// JSON file with the candidate endpoints
    #[arg(short, long)]
    endpoints: PathBuf,

    /// Where to write the results (stdout summary only when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Failure log directory (overrides the config file)
    #[arg(long)]
    failure_dir: Option<PathBuf>,

    /// Maximum endpoints tested at once (overrides the config file)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Skip the capability probe pass
    #[arg(long)]
    skip_probes: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .init();

    info!("🩺 rpc-healthcheck v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = if args.config.exists() {
        ProbeConfig::load(&args.config)?
    } else {
        warn!("Config file {:?} not found, using defaults", args.config);
        ProbeConfig::default()
    };

    // Override config with CLI args
    let config = config
        .with_concurrency_limit(args.concurrency)
        .with_failure_log_dir(args.failure_dir.clone())
        .with_probes_disabled(args.skip_probes);

    config.validate()?;

    info!("⚙️  Configuration:");
    info!("   Concurrency: {}", config.concurrency_limit);
    info!("   Request timeout: {}ms", config.per_request_timeout_ms);
    info!(
        "   Retries: {} (delay {}ms, exponential={})",
        config.max_retries, config.retry_delay_ms, config.exponential_backoff
    );
    info!("   Endpoint cap: {}ms", config.endpoint_max_duration_ms);
    info!("   Failure log: {:?}", config.failure_log_dir);

    let endpoints = load_endpoints(&args.endpoints).await?;
    info!("📥 Loaded {} endpoints from {:?}", endpoints.len(), args.endpoints);

    let invoker = Arc::new(HttpInvoker::new(&config).context("building HTTP client")?);
    let tracker = FailureTracker::new(&config);
    let metrics = Arc::new(RunMetrics::new());
    let runner = RefreshRunner::new(config, invoker, tracker.clone(), metrics.clone());

    let output = tokio::select! {
        output = refresh(&runner, endpoints.clone()) => output,
        _ = shutdown_signal() => {
            warn!("🛑 Shutdown signal received, flushing failure log");
            tracker.flush_all().await;
            let stats = tracker.stats();
            info!("📦 Failure log flushed: {} written, {} dropped", stats.written, stats.dropped);
            std::process::exit(EXIT_INTERRUPTED);
        }
    };

    if let Some(path) = &args.output {
        let json = serde_json::to_string_pretty(&output)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("writing results to {:?}", path))?;
        info!("💾 Results written to {:?}", path);
    }

    let summary = runner.summarize(&endpoints, &output);
    info!(
        "📊 Summary: {}/{} healthy, {} failed, {} chain id mismatches, {} retries, {} rate limited, {}s",
        summary.healthy,
        summary.total,
        summary.failed,
        summary.chain_id_mismatches,
        summary.retries,
        summary.rate_limited_responses,
        summary.elapsed_secs
    );
    for (stage, count) in &summary.stage_failures {
        info!("   {} failures: {}", stage, count);
    }
    if !summary.chains_without_healthy.is_empty() {
        warn!(
            "{} chain(s) have no healthy endpoint: {}",
            summary.chains_without_healthy.len(),
            summary.chains_without_healthy.join(", ")
        );
    }
    info!("{}", serde_json::to_string(&metrics.to_json())?);

    let stats = tracker.stats();
    if stats.dropped > 0 {
        error!("{} failure record(s) could not be written", stats.dropped);
    }

    info!("👋 Done");
    Ok(())
}

/// Both passes of a refresh
async fn refresh(runner: &RefreshRunner, endpoints: Vec<Endpoint>) -> RefreshOutput {
    let mut output = runner.run_health_checks(endpoints).await;
    runner.run_capability_probes(&mut output.healthy_rpcs).await;
    output
}

async fn load_endpoints(path: &Path) -> anyhow::Result<Vec<Endpoint>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading endpoints from {:?}", path))?;
    let endpoints: Vec<Endpoint> = serde_json::from_str(&contents)
        .with_context(|| format!("parsing endpoints from {:?}", path))?;
    Ok(endpoints)
}

/// Resolves on SIGINT, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
