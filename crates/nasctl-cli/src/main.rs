use anyhow::{Context, Result};
use clap::Parser;
use std::fs::OpenOptions;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use nasctl_cli::{cli::Cli, commands, config::CliConfig};

const CRATES: [&str; 5] = [
    "nasctl",
    "nasctl_cli",
    "nasctl_client",
    "nasctl_daemon",
    "nasctl_protocol",
];

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.clone(), cli.overrides())?;
    init_logging(&cli, &config)?;

    commands::execute(cli, config).await
}

/// `RUST_LOG` wins; otherwise the CLI is quiet and a daemon logs at info.
fn init_logging(cli: &Cli, config: &CliConfig) -> Result<()> {
    let to_file = cli.logs_to_file();
    let default_level = if to_file {
        LevelFilter::INFO
    } else {
        LevelFilter::WARN
    };
    let level = cli.requested_level().unwrap_or(default_level);

    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(
            CRATES
                .iter()
                .map(|krate| format!("{}={}", krate, level))
                .collect::<Vec<_>>()
                .join(","),
        ),
    };

    if to_file {
        let path = config.log_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}
