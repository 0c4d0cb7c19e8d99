use crate::config::ConfigOverrides;
use crate::output::OutputFormat;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;

/// Log level options for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// No logging output
    Off,
    /// Error messages only
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace-level messages (most verbose)
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "nasctl")]
#[command(about = "nasctl - storage appliance administration over a shared daemon connection")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Set log level (off, error, warn, info, debug, trace)
    #[arg(short = 'l', long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Enable verbose logging (shortcut for --log-level=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file path (defaults to ~/.config/nasctl/config.toml)
    #[arg(short = 'C', long, global = true)]
    pub config: Option<PathBuf>,

    /// Appliance address (overrides config file)
    #[arg(short = 's', long, global = true)]
    pub server: Option<String>,

    /// API key (overrides config file)
    #[arg(long, global = true)]
    pub api_key: Option<String>,

    /// Daemon socket path
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    /// Per-call timeout, e.g. 30s or 2m
    #[arg(short = 't', long, global = true)]
    pub timeout: Option<String>,

    /// Output format
    #[arg(short = 'f', long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,
}

impl Cli {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            server: self.server.clone(),
            api_key: self.api_key.clone(),
            socket: self.socket.clone(),
            timeout: self.timeout.clone(),
        }
    }

    /// Level requested on the command line, if any.
    pub fn requested_level(&self) -> Option<LevelFilter> {
        if self.verbose {
            Some(LevelFilter::DEBUG)
        } else {
            self.log_level.map(LevelFilter::from)
        }
    }

    /// The foreground daemon logs to its log file unless told otherwise.
    pub fn logs_to_file(&self) -> bool {
        matches!(
            self.command,
            Commands::Daemon(DaemonCommands::Run {
                log_stderr: false,
                ..
            })
        )
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Invoke one remote method through the daemon
    ///
    /// Each PARAM is parsed as JSON and falls back to a plain string, so
    /// `nasctl call pool.dataset.delete tank/old '{"recursive": true}'`
    /// sends `["tank/old", {"recursive": true}]`.
    Call {
        /// Method name, e.g. pool.dataset.query
        method: String,

        /// Positional parameters
        params: Vec<String>,
    },

    /// Run one method once per parameter set, concurrently
    Bulk {
        /// Method applied to every parameter set
        method: String,

        /// JSON array; each element is one call's parameters
        params: String,

        /// Print the daemon job id instead of waiting for the results
        #[arg(long)]
        no_wait: bool,
    },

    /// Inspect or wait for jobs
    #[command(subcommand)]
    Job(JobCommands),

    /// Manage the background daemon
    #[command(subcommand)]
    Daemon(DaemonCommands),

    /// Show configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// Block until a job finishes and print its outcome
    Wait {
        id: u64,

        /// ID is a daemon-local bulk job instead of an appliance job
        #[arg(long)]
        local: bool,
    },
    /// Print a job's state without waiting
    Status {
        id: u64,

        /// ID is a daemon-local bulk job instead of an appliance job
        #[arg(long)]
        local: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum DaemonCommands {
    /// Run the daemon in the foreground
    Run {
        /// Exit after this long without requests (runs until stopped if unset)
        #[arg(long)]
        idle_timeout: Option<String>,

        /// Log to stderr instead of the daemon log file
        #[arg(long)]
        log_stderr: bool,
    },
    /// Ask a running daemon to shut down
    Stop,
    /// Show daemon status and live sessions
    Status,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Print the config file path
    Path,
}
