//! Errors produced while serving a call.
//!
//! `CallError` is `Clone` because a single failure (a dead transport, a failed
//! job) is delivered to every waiter of the affected completions.

use nasctl_protocol::backend::BackendError;
use nasctl_protocol::{
    RpcError, INTERRUPTED, INVALID_PARAMS, JOB_FAILED, SESSION_ERROR, TIMEOUT_ERROR,
};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,

    #[error("transport error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("{method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    /// The call was sent before the caller gave up; its result is kept
    /// under a daemon job
    #[error("{method} timed out after {after:?}, result kept as daemon job {daemon_job}")]
    TimeoutPending {
        method: String,
        after: Duration,
        call_id: u64,
        daemon_job: u64,
    },

    /// Error reported by the backend, passed through untouched
    #[error("{message} (code {code})")]
    Backend {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("job {id} failed: {error}")]
    JobFailed {
        id: i64,
        error: String,
        exception: Option<Value>,
    },

    #[error("failed to connect to {server}: {reason}")]
    Connect { server: String, reason: String },

    #[error("authentication rejected by {server}")]
    Auth { server: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("session closed")]
    SessionClosed,

    #[error("wait interrupted")]
    Interrupted,

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("unknown daemon job {0}")]
    UnknownDaemonJob(u64),

    #[error("failed to encode request: {0}")]
    Encode(String),
}

impl From<BackendError> for CallError {
    fn from(err: BackendError) -> Self {
        CallError::Backend {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

impl CallError {
    /// Render for the local socket. Backend errors keep their code, message
    /// and data verbatim.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            CallError::Backend {
                code,
                message,
                data,
            } => RpcError {
                code: i32::try_from(*code).unwrap_or(i32::MIN),
                message: message.clone(),
                data: data.clone(),
            },
            CallError::Timeout { after, .. } => RpcError {
                code: TIMEOUT_ERROR,
                message: self.to_string(),
                data: Some(json!({ "timeout_ms": after.as_millis() as u64 })),
            },
            CallError::TimeoutPending {
                after,
                call_id,
                daemon_job,
                ..
            } => RpcError {
                code: TIMEOUT_ERROR,
                message: self.to_string(),
                data: Some(json!({
                    "timeout_ms": after.as_millis() as u64,
                    "call_id": call_id,
                    "daemon_job_id": daemon_job,
                })),
            },
            CallError::JobFailed { id, exception, .. } => RpcError {
                code: JOB_FAILED,
                message: self.to_string(),
                data: Some(json!({ "job_id": id, "exception": exception })),
            },
            CallError::InvalidParams(_) | CallError::UnknownDaemonJob(_) => RpcError {
                code: INVALID_PARAMS,
                message: self.to_string(),
                data: None,
            },
            CallError::Interrupted => RpcError {
                code: INTERRUPTED,
                message: self.to_string(),
                data: None,
            },
            CallError::Connect { .. }
            | CallError::Auth { .. }
            | CallError::Transport(_)
            | CallError::SessionClosed
            | CallError::Encode(_) => RpcError {
                code: SESSION_ERROR,
                message: self.to_string(),
                data: None,
            },
        }
    }

    /// JSON form used inside aggregate results (bulk and peek payloads).
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self.to_rpc_error()).unwrap_or(Value::Null)
    }
}
