//! Command implementations

pub mod bulk;
pub mod call;
pub mod config;
pub mod daemon;
pub mod job;

use crate::cli::{Cli, Commands};
use crate::config::CliConfig;
use anyhow::{Context, Result};
use nasctl_client::{ClientError, LaunchOptions, RemoteApi};

/// Execute the parsed command line
pub async fn execute(cli: Cli, config: CliConfig) -> Result<()> {
    let format = cli.format;
    match cli.command {
        Commands::Call { method, params } => call::execute(&config, &method, &params, format).await,
        Commands::Bulk {
            method,
            params,
            no_wait,
        } => bulk::execute(&config, &method, &params, no_wait, format).await,
        Commands::Job(cmd) => job::execute(&config, cmd, format).await,
        Commands::Daemon(cmd) => daemon::execute(&config, cmd, format).await,
        Commands::Config(cmd) => config::execute(&config, cmd, format),
    }
}

/// Daemon-backed api for the configured appliance, launching this binary
/// as the daemon when needed.
pub fn remote_api(config: &CliConfig) -> Result<RemoteApi> {
    let key = config.session_key()?;
    let launch = LaunchOptions::current_exe(config.socket_path(), config.idle_timeout())?;
    Ok(RemoteApi::new(key, launch))
}

/// Close `api` after a call, flushing outstanding deletes.
///
/// A failed call's error wins over anything seen while flushing.
pub async fn finish<T>(api: RemoteApi, result: Result<T, ClientError>) -> Result<T> {
    let (value, prior) = match result {
        Ok(value) => (Some(value), None),
        Err(e) => (None, Some(e)),
    };
    api.close(prior).await?;
    value.context("call produced no result")
}
