use std::fs;
use std::path::{Path, PathBuf};

/// Get the socket path for the daemon
///
/// Priority:
/// 1. `NASCTL_SOCKET` environment variable (if set)
/// 2. `$XDG_RUNTIME_DIR/nasctl.sock` (if XDG_RUNTIME_DIR is set)
/// 3. `/tmp/nasctl.sock` (fallback)
pub fn socket_path() -> PathBuf {
    if let Ok(path) = std::env::var("NASCTL_SOCKET") {
        return PathBuf::from(path);
    }
    dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("nasctl.sock")
}

/// Log file used by a detached daemon.
pub fn default_log_path() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("nasctl")
        .join("daemon.log")
}

pub fn remove_socket(path: &Path) {
    let _ = fs::remove_file(path);
}
