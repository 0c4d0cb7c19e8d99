use anyhow::{bail, Context, Result};
use nasctl_protocol::{parse_duration, SessionKey};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Idle timeout handed to daemons launched on demand.
pub const DEFAULT_IDLE_TIMEOUT: &str = "10m";

/// CLI configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Appliance connection settings
    pub connection: ConnectionConfig,
    /// Background daemon settings
    pub daemon: DaemonConfig,

    /// File the configuration was read from, if any
    #[serde(skip)]
    source: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Appliance address: `host`, `host:port` or a full `ws://`/`wss://` URL
    pub server: Option<String>,

    /// API key used to log in
    pub api_key: Option<String>,

    /// Per-call timeout, e.g. `30s` or `1m30s`
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Local socket path (defaults to `$XDG_RUNTIME_DIR/nasctl.sock`)
    pub socket: Option<PathBuf>,

    /// How long an idle daemon lingers before exiting
    pub idle_timeout: Option<String>,

    /// Log file of a detached daemon
    pub log_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: None,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT.to_string()),
            log_file: None,
        }
    }
}

/// Values given on the command line; they win over everything else.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub server: Option<String>,
    pub api_key: Option<String>,
    pub socket: Option<PathBuf>,
    pub timeout: Option<String>,
}

impl CliConfig {
    /// Load configuration with precedence: defaults < file < env < args
    pub fn load(config_file: Option<PathBuf>, overrides: ConfigOverrides) -> Result<Self> {
        let mut config = Self::from_file_or_default(config_file)?;
        config.apply_env(|name| std::env::var(name).ok());
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Apply `NASCTL_*` variables, read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server) = lookup("NASCTL_SERVER") {
            self.connection.server = Some(server);
        }
        if let Some(key) = lookup("NASCTL_API_KEY") {
            self.connection.api_key = Some(key);
        }
        if let Some(timeout) = lookup("NASCTL_TIMEOUT") {
            self.connection.timeout = Some(timeout);
        }
        if let Some(socket) = lookup("NASCTL_SOCKET") {
            self.daemon.socket = Some(PathBuf::from(socket));
        }
        if let Some(idle) = lookup("NASCTL_IDLE_TIMEOUT") {
            self.daemon.idle_timeout = Some(idle);
        }
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(server) = overrides.server {
            self.connection.server = Some(server);
        }
        if let Some(key) = overrides.api_key {
            self.connection.api_key = Some(key);
        }
        if let Some(socket) = overrides.socket {
            self.daemon.socket = Some(socket);
        }
        if let Some(timeout) = overrides.timeout {
            self.connection.timeout = Some(timeout);
        }
    }

    /// Reject duration strings the daemon would not understand, and zero.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("connection.timeout", &self.connection.timeout),
            ("daemon.idle_timeout", &self.daemon.idle_timeout),
        ];
        for (field, value) in durations {
            if let Some(value) = value {
                match parse_duration(value) {
                    None => bail!("Invalid duration for {}: {:?}", field, value),
                    Some(d) if d.is_zero() => {
                        bail!("Duration for {} must be greater than zero", field)
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Credentials for the configured appliance.
    pub fn session_key(&self) -> Result<SessionKey> {
        let server = self
            .connection
            .server
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .context("No server configured (use --server, NASCTL_SERVER or the config file)")?;
        let api_key = self
            .connection
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .context("No API key configured (use --api-key, NASCTL_API_KEY or the config file)")?;
        Ok(SessionKey::new(server, api_key))
    }

    pub fn socket_path(&self) -> PathBuf {
        self.daemon
            .socket
            .clone()
            .unwrap_or_else(nasctl_protocol::socket_path)
    }

    pub fn log_path(&self) -> PathBuf {
        self.daemon
            .log_file
            .clone()
            .unwrap_or_else(nasctl_protocol::default_log_path)
    }

    pub fn timeout(&self) -> Option<&str> {
        self.connection.timeout.as_deref()
    }

    pub fn idle_timeout(&self) -> Option<String> {
        self.daemon.idle_timeout.clone()
    }

    /// File this configuration was read from.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Get default config file path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("nasctl");
        Ok(config_dir.join("config.toml"))
    }

    /// Load config from file or return default
    fn from_file_or_default(config_file: Option<PathBuf>) -> Result<Self> {
        // Test mode never reads the user's config
        if std::env::var("NASCTL_TEST_MODE").is_ok() && config_file.is_none() {
            return Ok(Self::default());
        }

        let explicit = config_file.is_some();
        let path = config_file.or_else(|| Self::default_config_path().ok());
        match path {
            Some(path) if path.exists() => Self::from_file(&path),
            Some(path) if explicit => bail!("Config file not found: {}", path.display()),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Display the current configuration as TOML, API key redacted
    pub fn display_as_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.redacted()).context("Failed to serialize config as TOML")
    }

    /// Display the current configuration as JSON, API key redacted
    pub fn display_as_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.redacted())
            .context("Failed to serialize config as JSON")
    }

    fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.connection.api_key.is_some() {
            copy.connection.api_key = Some("<redacted>".to_string());
        }
        copy
    }
}
