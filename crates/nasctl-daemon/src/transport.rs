//! Backend transport seam.
//!
//! A session writes through a [`MessageSink`] from many tasks and reads from
//! its [`MessageStream`] in exactly one task. [`WsConnector`] is the
//! production implementation over a WebSocket.

use crate::error::{CallError, TransportError};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use nasctl_protocol::SessionKey;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};

#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, text: String) -> Result<(), TransportError>;

    /// Best-effort close of the write side.
    async fn close(&self);
}

#[async_trait]
pub trait MessageStream: Send {
    /// Next text message. An error means the read side is finished.
    async fn next_message(&mut self) -> Result<String, TransportError>;
}

pub struct Transport {
    pub sink: Box<dyn MessageSink>,
    pub stream: Box<dyn MessageStream>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, key: &SessionKey) -> Result<Transport, CallError>;
}

/// Map a configured server to the API endpoint URL.
///
/// Bare hosts get `wss://<host>/api/current`; explicit ws/wss URLs are kept.
pub fn endpoint_url(server: &str) -> String {
    let server = server.trim().trim_end_matches('/');
    if server.starts_with("ws://") || server.starts_with("wss://") {
        server.to_string()
    } else if let Some(rest) = server.strip_prefix("https://") {
        format!("wss://{}/api/current", rest)
    } else if let Some(rest) = server.strip_prefix("http://") {
        format!("ws://{}/api/current", rest)
    } else {
        format!("wss://{}/api/current", server)
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, key: &SessionKey) -> Result<Transport, CallError> {
        let url = endpoint_url(&key.server);
        debug!(url = %url, "Connecting to backend");
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| CallError::Connect {
                server: key.server.clone(),
                reason: e.to_string(),
            })?;
        info!(url = %url, "Backend connection established");

        let (writer, reader) = stream.split();
        Ok(Transport {
            sink: Box::new(WsSink {
                writer: Mutex::new(writer),
            }),
            stream: Box::new(WsReader { reader }),
        })
    }
}

struct WsSink {
    writer: Mutex<SplitSink<WsStream, Message>>,
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }
}

struct WsReader {
    reader: SplitStream<WsStream>,
}

#[async_trait]
impl MessageStream for WsReader {
    async fn next_message(&mut self) -> Result<String, TransportError> {
        loop {
            match self.reader.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_owned()),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Ok(text),
                    Err(_) => trace!("Skipping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Backend sent close frame");
                    return Err(TransportError::Closed);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                None => return Err(TransportError::Closed),
            }
        }
    }
}
