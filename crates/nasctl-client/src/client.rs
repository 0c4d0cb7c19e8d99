//! Daemon client implementation

use crate::error::ClientError;
use nasctl_protocol::{pseudo, Request, RequestId, Response, SessionKey};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// One connection to the daemon's local socket.
///
/// Calls on a single client are serialized; open more clients for
/// concurrency.
pub struct DaemonClient {
    conn: Mutex<Connection>,
    next_id: AtomicU64,
}

impl DaemonClient {
    /// Connect to daemon at a specific socket path
    pub async fn connect_to(path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| ClientError::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        let (read, write) = stream.into_split();
        debug!(path = %path.display(), "Connected to daemon");

        Ok(Self {
            conn: Mutex::new(Connection {
                reader: BufReader::new(read),
                writer: write,
            }),
            next_id: AtomicU64::new(1),
        })
    }

    /// Send one request and wait for the response carrying its id.
    pub async fn request(&self, request: &Request) -> Result<Response, ClientError> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');

        let mut conn = self.conn.lock().await;
        conn.writer.write_all(line.as_bytes()).await?;
        trace!(method = %request.method, "Sent request");

        loop {
            let mut buf = String::new();
            let n = conn.reader.read_line(&mut buf).await?;
            if n == 0 {
                return Err(ClientError::Disconnected);
            }
            let response: Response = serde_json::from_str(&buf)?;
            if response.id == request.id {
                return Ok(response);
            }
            debug!(id = ?response.id, "Skipping response for another request");
        }
    }

    /// Call `method` and unwrap the JSON-RPC result.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<&str>,
        session: Option<&SessionKey>,
    ) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut request = Request::new(id, method, params).with_timeout(timeout.map(str::to_owned));
        if let Some(session) = session {
            request = request.with_session(session.clone());
        }

        let response = self.request(&request).await?;
        debug_assert_eq!(response.id, Some(RequestId::Number(id)));
        if let Some(error) = response.error {
            return Err(ClientError::Rpc(error));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Ping the daemon
    pub async fn ping(&self) -> Result<String, ClientError> {
        let result = self.call(pseudo::PING, Value::Null, None, None).await?;
        Ok(result.as_str().unwrap_or_default().to_string())
    }

    /// Daemon pid, uptime and live sessions
    pub async fn status(&self) -> Result<Value, ClientError> {
        self.call(pseudo::STATUS, Value::Null, None, None).await
    }

    /// Request daemon shutdown
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.call(pseudo::SHUTDOWN, Value::Null, None, None).await?;
        Ok(())
    }
}
