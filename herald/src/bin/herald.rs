use clap::Parser;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use herald::Herald;
use herald::config::{EventTypeSource, HeraldConfig};
use herald::domain::{Priority, ProcessingMode};
use herald::logging::init_logging;
use herald::notification::EmitOptions;
use herald::notification::channels::LogProvider;

/// Emit events to notification channels.
///
/// Reads one JSON request per line from stdin, for example
/// `{"eventType": "user.welcome", "payload": {"userId": 123}}`, and prints one
/// JSON result per line. Optional request fields: mode (sync|async),
/// waitForResult, correlationId, timeoutMs, priority (low|normal|high|critical),
/// delayMs and metadata. Log output is filtered by `RUST_LOG`.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "HERALD_CONFIG")]
    config: Option<PathBuf>,

    /// Queue directory, overrides `queue.data_dir`
    #[arg(long, env = "HERALD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Worker count, overrides `queue.concurrency`
    #[arg(long, env = "HERALD_CONCURRENCY")]
    concurrency: Option<usize>,
}

/// One line of input.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmitRequest {
    #[serde(alias = "type")]
    event_type: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    mode: Option<ProcessingMode>,
    #[serde(default)]
    wait_for_result: Option<bool>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    delay_ms: Option<u64>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

impl EmitRequest {
    fn options(&self) -> EmitOptions {
        EmitOptions {
            mode: self.mode.map(Into::into).unwrap_or_default(),
            wait_for_result: self.wait_for_result,
            correlation_id: self.correlation_id.clone(),
            timeout: self.timeout_ms.map(Duration::from_millis),
            priority: self.priority,
            delay: self.delay_ms.map(Duration::from_millis),
            metadata: self.metadata.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = HeraldConfig::load(args.config.as_deref())?;
    config.apply_overrides(args.data_dir, args.concurrency)?;
    let _logging = init_logging(&config.logging)?;

    let herald = Herald::new(config).await?;
    let configured = herald.register_configured_providers()?;
    if configured == 0 {
        register_log_fallbacks(&herald)?;
    }

    herald.start().await?;

    let health = herald.health().await;
    if !health.is_healthy() {
        warn!(router = health.router, queue = health.queue, "Starting with unhealthy components");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => handle_line(&herald, &line).await,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Failed to read input");
                        break;
                    }
                }
            }
        }
    }

    herald.shutdown().await;
    Ok(())
}

/// Route every configured channel to the log when no providers are set up.
fn register_log_fallbacks(herald: &Herald) -> anyhow::Result<()> {
    let event_types = herald.event_types();
    let channels: BTreeSet<String> = event_types
        .event_types()
        .iter()
        .filter_map(|name| event_types.get(name))
        .flat_map(|config| config.channels)
        .collect();

    for channel in &channels {
        herald.register_provider(Arc::new(LogProvider::new(channel.as_str())))?;
    }
    if !channels.is_empty() {
        info!(channels = ?channels, "No providers configured, logging deliveries instead");
    }
    Ok(())
}

async fn handle_line(herald: &Herald, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let output = match serde_json::from_str::<EmitRequest>(line) {
        Ok(request) => {
            match herald
                .emit(&request.event_type, request.payload.clone(), request.options())
                .await
            {
                Ok(result) => serde_json::to_value(&result).unwrap_or_else(|e| json!({ "error": e.to_string() })),
                Err(e) => json!({ "error": e.to_string(), "eventType": request.event_type }),
            }
        }
        Err(e) => json!({ "error": format!("invalid request: {}", e) }),
    };
    println!("{}", output);
}
