//! nasctl daemon
//!
//! Holds long-lived authenticated connections to storage appliances and
//! multiplexes short-lived CLI invocations over them through a local Unix
//! socket.

pub mod completion;
pub mod error;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use completion::{Completion, Outcome};
pub use error::{CallError, TransportError};
pub use registry::SessionRegistry;
pub use server::{shutdown_on_signal, Server};
pub use session::{ConflictKey, Session, SessionConfig, SessionStats};
pub use transport::{endpoint_url, Connector, MessageSink, MessageStream, Transport, WsConnector};
