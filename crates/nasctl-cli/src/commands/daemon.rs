//! Daemon management commands

use crate::cli::DaemonCommands;
use crate::config::CliConfig;
use crate::output::{self, OutputFormat};
use anyhow::{Context, Result};
use nasctl_client::{is_daemon_running, DaemonClient};
use nasctl_daemon::{shutdown_on_signal, Server, SessionConfig, SessionRegistry, WsConnector};
use nasctl_protocol::{parse_duration, DEFAULT_CALL_TIMEOUT};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub async fn execute(config: &CliConfig, cmd: DaemonCommands, format: OutputFormat) -> Result<()> {
    match cmd {
        DaemonCommands::Run { idle_timeout, .. } => run(config, idle_timeout.as_deref()).await,
        DaemonCommands::Stop => stop(config).await,
        DaemonCommands::Status => status(config, format).await,
    }
}

/// Serve requests in the foreground until stopped or idle.
async fn run(config: &CliConfig, idle_timeout: Option<&str>) -> Result<()> {
    let idle = parse_optional_duration(idle_timeout).context("Invalid --idle-timeout")?;
    let session_config = SessionConfig {
        default_timeout: parse_optional_duration(config.timeout())
            .context("Invalid timeout")?
            .unwrap_or(DEFAULT_CALL_TIMEOUT),
        ..SessionConfig::default()
    };

    let path = config.socket_path();
    let registry = SessionRegistry::new(Arc::new(WsConnector), session_config);
    let server = Server::bind(&path, registry, idle).await?;
    shutdown_on_signal(server.shutdown_handle());

    info!(pid = std::process::id(), socket = %path.display(), "Daemon started");
    server.run().await
}

fn parse_optional_duration(raw: Option<&str>) -> Result<Option<Duration>> {
    match raw {
        None => Ok(None),
        Some(raw) => parse_duration(raw)
            .map(Some)
            .with_context(|| format!("cannot parse duration {:?}", raw)),
    }
}

async fn stop(config: &CliConfig) -> Result<()> {
    let path = config.socket_path();
    if !is_daemon_running(&path) {
        println!("Daemon is not running");
        return Ok(());
    }

    let client = DaemonClient::connect_to(&path).await?;
    client.shutdown().await?;
    println!("Daemon stopped");
    Ok(())
}

async fn status(config: &CliConfig, format: OutputFormat) -> Result<()> {
    let path = config.socket_path();
    if !is_daemon_running(&path) {
        println!("Daemon is not running");
        return Ok(());
    }

    let client = DaemonClient::connect_to(&path).await?;
    let status = client.status().await?;
    println!("{}", output::render_status(&status, format)?);
    Ok(())
}
