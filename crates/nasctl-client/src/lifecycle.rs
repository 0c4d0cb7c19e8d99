//! Daemon launch for the single-binary pattern
//!
//! The `nasctl` binary forks itself as `nasctl daemon run` on demand and
//! waits for the socket to appear before connecting.

use crate::error::ClientError;
use crate::watch::wait_for_file;
use nasctl_protocol::remove_socket;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound on waiting for a freshly forked daemon's socket.
pub const LAUNCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to start a daemon.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Binary that understands `daemon run`
    pub executable: PathBuf,
    pub socket: PathBuf,
    /// Passed through as `--idle-timeout`
    pub idle_timeout: Option<String>,
}

impl LaunchOptions {
    /// Launch options for the running binary.
    pub fn current_exe(socket: PathBuf, idle_timeout: Option<String>) -> Result<Self, ClientError> {
        let executable = std::env::current_exe()
            .map_err(|e| ClientError::Launch(format!("cannot locate executable: {}", e)))?;
        Ok(Self {
            executable,
            socket,
            idle_timeout,
        })
    }
}

/// Check if daemon is running (socket exists and accepts connections)
pub fn is_daemon_running(socket: &Path) -> bool {
    if !socket.exists() {
        return false;
    }

    match std::os::unix::net::UnixStream::connect(socket) {
        Ok(_) => true,
        Err(e) => {
            debug!("Socket exists but connection failed: {}", e);
            false
        }
    }
}

/// Spawn `<executable> daemon run` detached from this process.
pub fn fork_daemon(options: &LaunchOptions) -> Result<(), ClientError> {
    let mut cmd = Command::new(&options.executable);
    cmd.arg("daemon").arg("run").arg("--socket").arg(&options.socket);
    if let Some(idle) = &options.idle_timeout {
        cmd.arg("--idle-timeout").arg(idle);
    }

    debug!(
        exe = %options.executable.display(),
        socket = %options.socket.display(),
        idle_timeout = ?options.idle_timeout,
        "Forking daemon"
    );

    {
        use std::os::unix::process::CommandExt;
        // Own process group so terminal signals aimed at the CLI miss it.
        cmd.process_group(0);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| {
            ClientError::Launch(format!(
                "failed to spawn {}: {}",
                options.executable.display(),
                e
            ))
        })?;

    info!("Forked daemon process");
    Ok(())
}

/// Ensure a daemon is listening on `options.socket`, forking one if needed.
pub async fn ensure_daemon(options: &LaunchOptions) -> Result<(), ClientError> {
    if is_daemon_running(&options.socket) {
        debug!(socket = %options.socket.display(), "Daemon already running");
        return Ok(());
    }

    // Anything still at the path is stale.
    remove_socket(&options.socket);
    let (dir, name) = split_socket_path(&options.socket)?;
    std::fs::create_dir_all(dir)?;

    info!("Daemon not running, forking new instance");
    fork_daemon(options)?;

    if wait_for_file(dir, name, LAUNCH_TIMEOUT).await {
        debug!(socket = %options.socket.display(), "Daemon socket appeared");
        Ok(())
    } else {
        Err(ClientError::Launch(format!(
            "daemon socket {} did not appear within {:?}",
            options.socket.display(),
            LAUNCH_TIMEOUT
        )))
    }
}

fn split_socket_path(socket: &Path) -> Result<(&Path, &str), ClientError> {
    let dir = socket
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = socket
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ClientError::Launch(format!("bad socket path {}", socket.display())))?;
    Ok((dir, name))
}
