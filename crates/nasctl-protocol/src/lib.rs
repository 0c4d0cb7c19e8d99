//! Wire types shared by the nasctl daemon and its clients.
//!
//! Two protocols meet here: the newline-delimited JSON-RPC spoken over the
//! daemon's local socket, and the JSON-RPC dialect of the appliance's
//! management API that the daemon multiplexes.

pub mod backend;
mod duration;
mod lifecycle;
mod protocol;

pub use duration::{effective_timeout, parse_duration, DEFAULT_CALL_TIMEOUT};
pub use lifecycle::{default_log_path, remove_socket, socket_path};
pub use protocol::{
    pseudo, Request, RequestId, Response, RpcError, SessionKey, INTERNAL_ERROR, INTERRUPTED,
    INVALID_PARAMS, INVALID_REQUEST, JOB_FAILED, METHOD_NOT_FOUND, PARSE_ERROR, SESSION_ERROR,
    TIMEOUT_ERROR,
};
