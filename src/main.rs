//! SolarFlux webhook auth CLI
//!
//! Reads newline-delimited webhook requests (JSON) on stdin and writes one JSON
//! response per line on stdout.

use anyhow::{Context, Result};
use clap::Parser;
use solarflux_webhook_auth::store::MemoryStore;
use solarflux_webhook_auth::{FluxAuthAgent, FluxAuthConfig, HookResponse, WebhookRequest};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// SolarFlux MQTT webhook auth
#[derive(Parser, Debug)]
#[command(name = "solarflux-auth")]
#[command(author = "SolarFlux Contributors")]
#[command(version)]
#[command(about = "Authentication, authorization and audit for SolarFlux MQTT webhooks", long_about = None)]
struct Args {
    /// Configuration file path (JSON)
    #[arg(short, long, env = "SOLARFLUX_AUTH_CONFIG")]
    config: Option<PathBuf>,

    /// Token and node fixtures file path (JSON)
    #[arg(short, long, env = "SOLARFLUX_AUTH_FIXTURES")]
    fixtures: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long)]
    json_logs: bool,

    /// Seconds to wait for the audit writer to drain on exit
    #[arg(long, default_value_t = 10)]
    shutdown_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries responses
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting SolarFlux webhook auth");

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        info!(path = %config_path.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
        serde_json::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        FluxAuthConfig::default()
    };

    let store = match &args.fixtures {
        Some(path) => {
            info!(path = %path.display(), "Loading fixtures");
            MemoryStore::from_fixtures_file(path)?
        }
        None => MemoryStore::new(),
    };

    let agent = Arc::new(FluxAuthAgent::with_config(config, Arc::new(store))?);
    info!("Agent initialized, reading requests");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                None
            }
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<WebhookRequest>(&line) {
            Ok(request) => {
                let agent = Arc::clone(&agent);
                // decisions may block on the store
                tokio::task::spawn_blocking(move || agent.handle(&request)).await?
            }
            Err(e) => {
                warn!(error = %e, "Failed to parse webhook request");
                HookResponse::error(format!("invalid request: {}", e))
            }
        };

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    let timeout = Duration::from_secs(args.shutdown_timeout_secs);
    let drained = tokio::task::spawn_blocking(move || agent.shutdown(timeout)).await?;
    info!(drained, "Stopped");

    Ok(())
}
