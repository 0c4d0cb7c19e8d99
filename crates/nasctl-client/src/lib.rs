//! Client library for the nasctl daemon
//!
//! Daemon detection is socket-based:
//! - If socket exists and connectable -> daemon running
//! - If socket exists but not connectable -> stale socket, safe to replace
//! - If socket doesn't exist -> daemon not running
//!
//! Commands should go through [`RemoteApi`], which launches the daemon on
//! demand and relaunches it once if it disappears.

mod api;
mod client;
mod error;
pub mod lifecycle;
mod watch;

pub use api::RemoteApi;
pub use client::DaemonClient;
pub use error::ClientError;
pub use lifecycle::{ensure_daemon, fork_daemon, is_daemon_running, LaunchOptions};
pub use watch::wait_for_file;
