//! TRUSTLINK agent CLI.
//!
//! Usage:
//!   trustlink-agent run --config agent.toml
//!   trustlink-agent call --config agent.toml --target spiffe://example.org/agents/y \
//!       --action greet --payload '{"name":"x"}'
//!   trustlink-agent check-config --config agent.toml

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use trustlink_agent::{AgentConfig, AgentRuntime, HandlerSet};
use trustlink_contracts::error::{TrustlinkError, TrustlinkResult};

// ── CLI definition ────────────────────────────────────────────────────────────

/// TRUSTLINK: mutually authenticated, policy-checked agent-to-agent calls.
#[derive(Parser)]
#[command(name = "trustlink-agent", about = "TRUSTLINK agent runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the agent and serve until interrupted.
    Run {
        #[arg(long)]
        config: PathBuf,
    },
    /// Make one outbound call and print the result as JSON.
    Call {
        #[arg(long)]
        config: PathBuf,
        /// Identity of the agent to call.
        #[arg(long)]
        target: String,
        #[arg(long)]
        action: String,
        /// JSON payload.
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Overrides `timeouts.default_call_ms`.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Parse and validate a configuration file.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run { config } => run(config).await,
        Command::Call {
            config,
            target,
            action,
            payload,
            timeout_ms,
        } => call(config, target, action, payload, timeout_ms).await,
        Command::CheckConfig { config } => check_config(config),
    };

    if let Err(e) = result {
        eprintln!("trustlink-agent: {}", e);
        std::process::exit(1);
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn run(path: PathBuf) -> TrustlinkResult<()> {
    let config = AgentConfig::from_file(&path)?;
    let agent = AgentRuntime::build(config, HandlerSet::builtin())
        .await?
        .start()
        .await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        return Err(TrustlinkError::ConfigError {
            reason: format!("cannot listen for interrupt: {}", e),
        });
    }
    info!("interrupt received");
    agent.shutdown().await;
    Ok(())
}

async fn call(
    path: PathBuf,
    target: String,
    action: String,
    payload: String,
    timeout_ms: Option<u64>,
) -> TrustlinkResult<()> {
    let payload: Value = serde_json::from_str(&payload).map_err(|e| {
        TrustlinkError::InvalidPayload {
            reason: format!("--payload is not JSON: {}", e),
        }
    })?;

    let config = AgentConfig::from_file(&path)?;
    let runtime = AgentRuntime::build(config, HandlerSet::builtin()).await?;
    let dispatcher = runtime.dispatcher();

    let result = dispatcher
        .call(&target, &action, payload, timeout_ms.map(Duration::from_millis))
        .await;
    let closed = dispatcher.connections().shutdown();
    tracing::debug!(closed, "outbound connections closed");

    let rendered = serde_json::to_string_pretty(&result).map_err(|e| TrustlinkError::Codec {
        reason: e.to_string(),
    })?;
    println!("{}", rendered);

    if result.is_completed() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn check_config(path: PathBuf) -> TrustlinkResult<()> {
    let config = AgentConfig::from_file(&path)?;
    println!(
        "{}: ok ({} capabilities, {} peers, policy {:?})",
        path.display(),
        config.capabilities.len(),
        config.peers.len(),
        config.policy.mode
    );
    Ok(())
}
