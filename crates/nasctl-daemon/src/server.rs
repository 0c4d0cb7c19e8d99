//! Unix socket server for JSON-RPC

use crate::registry::SessionRegistry;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nasctl_protocol::{
    pseudo, remove_socket, Request, Response, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND,
    PARSE_ERROR,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, error, info, warn};

/// Tracks requests in flight and wakes the idle watchdog on any activity.
#[derive(Default)]
struct Activity {
    in_flight: AtomicUsize,
    touched: Notify,
}

impl Activity {
    fn begin(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touched.notify_waiters();
    }

    fn end(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.touched.notify_waiters();
    }

    fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }
}

/// Resolves once `timeout` passes with no activity and nothing in flight.
async fn idle_watchdog(activity: Arc<Activity>, timeout: Duration) {
    loop {
        let touched = activity.touched.notified();
        tokio::pin!(touched);
        touched.as_mut().enable();
        tokio::select! {
            _ = &mut touched => continue,
            _ = tokio::time::sleep(timeout) => {
                if !activity.is_busy() {
                    return;
                }
            }
        }
    }
}

#[derive(Clone)]
struct ServerContext {
    registry: Arc<SessionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    activity: Arc<Activity>,
    started_at: DateTime<Utc>,
}

/// Daemon server that listens on a Unix socket
pub struct Server {
    listener: UnixListener,
    path: PathBuf,
    idle_timeout: Option<Duration>,
    ctx: ServerContext,
}

impl Server {
    /// Bind to a Unix socket path, replacing any stale socket file.
    pub async fn bind(
        path: &Path,
        registry: Arc<SessionRegistry>,
        idle_timeout: Option<Duration>,
    ) -> Result<Self> {
        // Remove stale socket
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("removing stale socket {}", path.display()))?;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating socket directory {}", parent.display()))?;
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("binding socket {}", path.display()))?;
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(path = %path.display(), ?idle_timeout, "Daemon listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            idle_timeout,
            ctx: ServerContext {
                registry,
                shutdown_tx,
                activity: Arc::new(Activity::default()),
                started_at: Utc::now(),
            },
        })
    }

    /// Get a shutdown sender for external shutdown triggers
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.ctx.shutdown_tx.clone()
    }

    /// Run the server until shutdown, idle timeout, or `daemon.shutdown`.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.ctx.shutdown_tx.subscribe();
        let idle = {
            let activity = self.ctx.activity.clone();
            let idle_timeout = self.idle_timeout;
            async move {
                match idle_timeout {
                    Some(timeout) => idle_watchdog(activity, timeout).await,
                    None => std::future::pending::<()>().await,
                }
            }
        };
        tokio::pin!(idle);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            let ctx = self.ctx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, ctx).await {
                                    debug!(error = %e, "Client connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = &mut idle => {
                    info!(idle_timeout = ?self.idle_timeout, "Idle timeout reached");
                    break;
                }
            }
        }

        self.ctx.registry.close_all().await;
        remove_socket(&self.path);
        info!("Daemon stopped");
        Ok(())
    }
}

/// Forward SIGTERM and SIGINT to the server's shutdown handle.
pub fn shutdown_on_signal(shutdown_tx: broadcast::Sender<()>) {
    tokio::spawn(async move {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!("Cannot listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = terminate => info!("Received SIGTERM"),
        }
        let _ = shutdown_tx.send(());
    });
}

async fn handle_client(stream: UnixStream, ctx: ServerContext) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let writer: Arc<Mutex<OwnedWriteHalf>> = Arc::new(Mutex::new(writer));
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut shutdown_rx = ctx.shutdown_tx.subscribe();

    loop {
        line.clear();
        let n = tokio::select! {
            read = reader.read_line(&mut line) => read?,
            _ = shutdown_rx.recv() => break,
        };
        if n == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        // Requests on one connection run concurrently; responses are matched by id.
        ctx.activity.begin();
        let text = std::mem::take(&mut line);
        let ctx = ctx.clone();
        let writer = writer.clone();
        tokio::spawn(async move {
            let (response, shutdown) = handle_line(&text, &ctx).await;
            match response.to_json_line() {
                Ok(output) => {
                    let mut w = writer.lock().await;
                    if let Err(e) = w.write_all(output.as_bytes()).await {
                        debug!(error = %e, "Client went away before response");
                    }
                }
                Err(e) => error!("Failed to encode response: {}", e),
            }
            ctx.activity.end();
            if shutdown {
                let _ = ctx.shutdown_tx.send(());
            }
        });
    }
    Ok(())
}

/// Returns the response and whether the daemon should shut down after
/// sending it.
async fn handle_line(line: &str, ctx: &ServerContext) -> (Response, bool) {
    let req = match serde_json::from_str::<Request>(line) {
        Ok(req) => req,
        Err(e) => {
            warn!("Parse error: {}", e);
            return (Response::error(None, PARSE_ERROR, e.to_string()), false);
        }
    };
    if req.jsonrpc != "2.0" {
        return (
            Response::error(req.id, INVALID_REQUEST, "jsonrpc must be \"2.0\""),
            false,
        );
    }

    if pseudo::is_daemon_method(&req.method) {
        return handle_daemon_method(req, ctx);
    }
    (handle_request(req, ctx).await, false)
}

fn handle_daemon_method(req: Request, ctx: &ServerContext) -> (Response, bool) {
    match req.method.as_str() {
        pseudo::PING => (Response::success(req.id, "pong"), false),
        pseudo::STATUS => {
            let uptime = Utc::now() - ctx.started_at;
            let status = json!({
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "started_at": ctx.started_at,
                "uptime_secs": uptime.num_seconds(),
                "sessions": ctx.registry.status(),
            });
            (Response::success(req.id, status), false)
        }
        pseudo::SHUTDOWN => {
            info!("Shutdown requested by client");
            (Response::success(req.id, json!({"status": "ok"})), true)
        }
        other => (
            Response::error(req.id, METHOD_NOT_FOUND, format!("Unknown method: {}", other)),
            false,
        ),
    }
}

async fn handle_request(req: Request, ctx: &ServerContext) -> Response {
    let Some(key) = req.session else {
        return Response::error(
            req.id,
            INVALID_PARAMS,
            format!("{} requires a session", req.method),
        );
    };

    let session = match ctx.registry.get_or_create(&key).await {
        Ok(session) => session,
        Err(e) => return Response::from_error(req.id, e.to_rpc_error()),
    };

    debug!(method = %req.method, server = %key.server, "Handling call");
    match session
        .call(&req.method, req.timeout.as_deref(), req.params)
        .await
    {
        Ok(result) => Response::success(req.id, result),
        Err(e) => Response::from_error(req.id, e.to_rpc_error()),
    }
}
