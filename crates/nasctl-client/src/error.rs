use nasctl_protocol::RpcError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot connect to daemon at {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("daemon I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("daemon closed the connection")]
    Disconnected,

    #[error("invalid daemon response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Error returned by the daemon or passed through from the appliance
    #[error("{0}")]
    Rpc(RpcError),

    #[error("failed to launch daemon: {0}")]
    Launch(String),

    #[error("{} outstanding operation(s) failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<ClientError>),
}

fn join_errors(errors: &[ClientError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ClientError {
    /// The daemon socket could not be dialed, so no request reached it.
    pub fn is_connect(&self) -> bool {
        matches!(self, ClientError::Connect { .. })
    }

    /// The connection broke or desynced; it cannot carry another request.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Disconnected | ClientError::Decode(_)
        )
    }

    pub fn rpc(&self) -> Option<&RpcError> {
        match self {
            ClientError::Rpc(e) => Some(e),
            _ => None,
        }
    }
}
