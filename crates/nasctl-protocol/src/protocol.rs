//! JSON-RPC 2.0 types for the daemon's local socket.
//!
//! Framing is one JSON object per line in both directions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// JSON-RPC 2.0 request ID (can be string or number)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

/// Identity of one authenticated backend connection.
///
/// The daemon keeps at most one live session per key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// Server address or full `ws://`/`wss://` URL
    pub server: String,
    pub api_key: String,
}

impl SessionKey {
    pub fn new(server: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            api_key: api_key.into(),
        }
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("server", &self.server)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Duration string such as `"30s"`; unparseable values fall back to the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionKey>,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(RequestId::Number(id)),
            method: method.into(),
            params,
            timeout: None,
            session: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<String>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_session(mut self, session: SessionKey) -> Self {
        self.session = Some(session);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)?;
        if let Some(reason) = self
            .data
            .as_ref()
            .and_then(|d| d.get("reason"))
            .and_then(|r| r.as_str())
        {
            write!(f, ": {}", reason.trim())?;
        }
        Ok(())
    }
}

impl Response {
    pub fn success(id: Option<RequestId>, result: impl Into<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn error(id: Option<RequestId>, code: i32, message: impl Into<String>) -> Self {
        Self::error_with_data(id, code, message, None)
    }

    pub fn error_with_data(
        id: Option<RequestId>,
        code: i32,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self::from_error(
            id,
            RpcError {
                code,
                message: message.into(),
                data,
            },
        )
    }

    pub fn from_error(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Serialize as a single newline-terminated line.
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

// Standard JSON-RPC error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Daemon-specific codes
pub const TIMEOUT_ERROR: i32 = -32000;
pub const JOB_FAILED: i32 = -32001;
pub const SESSION_ERROR: i32 = -32002;
pub const INTERRUPTED: i32 = -32003;

/// Methods answered by the daemon itself and never forwarded to the backend.
pub mod pseudo {
    /// `[inner_method, [params, ...]]` -> daemon job id
    pub const BULK_CALL: &str = "bulk_call";
    pub const AWAIT_DAEMON_JOB: &str = "await_daemon_job";
    pub const PEEK_DAEMON_JOB: &str = "peek_daemon_job";
    pub const AWAIT_EXTERNAL_JOB: &str = "await_external_job";
    pub const PEEK_EXTERNAL_JOB: &str = "peek_external_job";

    pub const PING: &str = "daemon.ping";
    pub const STATUS: &str = "daemon.status";
    pub const SHUTDOWN: &str = "daemon.shutdown";

    /// True for methods that need no backend session at all.
    pub fn is_daemon_method(method: &str) -> bool {
        method.starts_with("daemon.")
    }

    /// True for methods answered by the daemon rather than forwarded.
    pub fn is_pseudo(method: &str) -> bool {
        is_daemon_method(method)
            || matches!(
                method,
                BULK_CALL
                    | AWAIT_DAEMON_JOB
                    | PEEK_DAEMON_JOB
                    | AWAIT_EXTERNAL_JOB
                    | PEEK_EXTERNAL_JOB
            )
    }
}
