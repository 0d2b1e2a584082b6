//! Resolve suggestion requests through the tiered orchestrator.
//!
//! Reads configuration from `TIERGUARD_*` environment variables (and
//! optionally a JSON file), the API key from `OPENROUTER_KEY`, and one
//! request or a JSON array of requests from a file or stdin.
//!
//! # Examples
//!
//! ```sh
//! # Single request from a file
//! tierguard --request event.json
//!
//! # Batch from stdin, resolved concurrently, with a metrics snapshot
//! cat events.json | tierguard --metrics
//!
//! # Override models and timeout
//! tierguard --request event.json \
//!   --primary-model openai/gpt-4o --fallback-model anthropic/claude-3.5-haiku \
//!   --timeout 10
//! ```
//!
//! Exits with status 1 if any request fails terminally.

use clap::Parser;
use futures::future::join_all;
use serde::Serialize;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tierguard::prelude::*;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Resolve suggestion requests through cache, primary, and fallback tiers.
#[derive(Parser)]
#[command(name = "tierguard", version)]
struct Cli {
    /// JSON file with one request or an array of requests (default: stdin)
    #[arg(long)]
    request: Option<PathBuf>,

    /// JSON configuration file, applied before environment overrides
    #[arg(long)]
    config: Option<PathBuf>,

    /// Primary model override
    #[arg(long)]
    primary_model: Option<String>,

    /// Fallback model override
    #[arg(long)]
    fallback_model: Option<String>,

    /// Per-call timeout in seconds for remote tiers
    #[arg(long)]
    timeout: Option<u64>,

    /// Print a metrics snapshot to stderr when done
    #[arg(long)]
    metrics: bool,
}

/// Outcome of one request in batch output.
#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum BatchOutcome {
    Ok(InferenceResult),
    Error {
        category: Option<ErrorCategory>,
        message: String,
    },
}

impl From<Result<InferenceResult, TerminalFailure>> for BatchOutcome {
    fn from(outcome: Result<InferenceResult, TerminalFailure>) -> Self {
        match outcome {
            Ok(result) => BatchOutcome::Ok(result),
            Err(e) => BatchOutcome::Error {
                category: e.category(),
                message: e.to_string(),
            },
        }
    }
}

fn read_input(cli: &Cli) -> Result<String, String> {
    match &cli.request {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read request file '{}': {e}", path.display())),
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| format!("failed to read stdin: {e}"))?;
            Ok(buf)
        }
    }
}

/// Parse one request object or an array of them. Returns whether the
/// input was an array.
fn parse_requests(input: &str) -> Result<(Vec<InferenceRequest>, bool), String> {
    let value: serde_json::Value =
        serde_json::from_str(input).map_err(|e| format!("invalid request JSON: {e}"))?;
    let batch = value.is_array();
    let requests = if batch {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|r| vec![r])
    }
    .map_err(|e| format!("invalid request: {e}"))?;
    Ok((requests, batch))
}

fn load_config(cli: &Cli) -> Result<ResilienceConfig, String> {
    let mut config =
        ResilienceConfig::load(cli.config.as_deref()).map_err(|e| e.to_string())?;
    if let Some(model) = &cli.primary_model {
        config.remote.primary_model = model.clone();
    }
    if let Some(model) = &cli.fallback_model {
        config.remote.fallback_model = model.clone();
    }
    if let Some(secs) = cli.timeout {
        config.tier_timeout = Duration::from_secs(secs);
    }
    Ok(config)
}

async fn run(cli: &Cli) -> Result<bool, String> {
    let config = load_config(cli)?;
    let (requests, batch) = parse_requests(&read_input(cli)?)?;

    let client = Arc::new(ChatClient::from_config(&config.remote).map_err(|e| e.to_string())?);
    let orchestrator = TierOrchestrator::builder(config.clone())
        .primary(ChatTier::primary(client.clone(), &config.remote))
        .secondary(ChatTier::secondary(client, &config.remote))
        .build();

    let outcomes = join_all(requests.iter().map(|request| {
        orchestrator.resolve_with_cancel(request, async {
            let _ = tokio::signal::ctrl_c().await;
        })
    }))
    .await;
    let all_ok = outcomes.iter().all(Result::is_ok);

    let rendered = if batch {
        let outcomes: Vec<BatchOutcome> = outcomes.into_iter().map(BatchOutcome::from).collect();
        serde_json::to_string_pretty(&outcomes)
    } else {
        match outcomes.into_iter().next() {
            Some(Ok(result)) => serde_json::to_string_pretty(&result),
            Some(Err(e)) => {
                eprintln!("Error: {e}");
                Ok(String::new())
            }
            None => Ok(String::new()),
        }
    }
    .map_err(|e| format!("failed to format output: {e}"))?;
    if !rendered.is_empty() {
        println!("{rendered}");
    }

    if cli.metrics {
        let snapshot = serde_json::to_string_pretty(&orchestrator.snapshot())
            .map_err(|e| format!("failed to format metrics: {e}"))?;
        eprintln!("{snapshot}");
    }

    Ok(all_ok)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    match run(&cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(2);
        }
    }
}
