//! Triage Agent Worker Daemon
//!
//! Connects out to the dispatch gateway over WebSocket, runs agent incidents
//! in a workspace directory, and reconnects whenever the link drops.

mod sessions;
mod worker;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::time::sleep;
use tracing::{info, warn};

use triage_executor::{Executor, ExecutorConfig, DEFAULT_TIMEOUT_SECS};

use sessions::SessionStore;
use worker::Worker;

const DEFAULT_GATEWAY_URL: &str = "ws://localhost:8080/ws/agent";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "triage-worker", version)]
#[command(about = "Agent worker daemon for the triage dispatch gateway")]
struct Cli {
    /// Gateway WebSocket URL
    #[arg(long, env = "TRIAGE_GATEWAY_URL", default_value = DEFAULT_GATEWAY_URL)]
    gateway_url: String,

    /// Directory agent runs execute in
    #[arg(long, env = "TRIAGE_WORKSPACE_DIR", default_value = "/tmp/triage-workspace")]
    workspace_dir: PathBuf,

    /// Session persistence file
    #[arg(long, env = "TRIAGE_SESSIONS_FILE", default_value = "/tmp/triage-sessions.json")]
    sessions_file: PathBuf,

    /// Agent CLI binary
    #[arg(long, env = "TRIAGE_AGENT_BINARY", default_value = "codex")]
    agent_binary: String,

    /// Per-run timeout in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    run_timeout_secs: u64,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    std::fs::create_dir_all(&cli.workspace_dir).with_context(|| {
        format!(
            "failed to create workspace directory {}",
            cli.workspace_dir.display()
        )
    })?;

    let sessions = Arc::new(SessionStore::load(&cli.sessions_file));
    let executor = Arc::new(Executor::new(ExecutorConfig {
        binary: cli.agent_binary.clone(),
        working_dir: Some(cli.workspace_dir.clone()),
        timeout_secs: cli.run_timeout_secs,
        ..ExecutorConfig::default()
    }));
    let worker = Arc::new(Worker::new(executor, sessions));

    info!(
        gateway = %cli.gateway_url,
        workspace = %cli.workspace_dir.display(),
        binary = %cli.agent_binary,
        "worker starting"
    );

    loop {
        tokio::select! {
            result = worker.clone().run_connection(&cli.gateway_url) => {
                match result {
                    Ok(()) => info!("connection closed"),
                    Err(err) => warn!(error = %err, "connection failed"),
                }
                sleep(RECONNECT_DELAY).await;
                info!("reconnecting");
            }
            _ = signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}
