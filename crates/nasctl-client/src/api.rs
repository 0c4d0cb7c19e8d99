//! `call`/`close` entry point used by commands.
//!
//! Hides the daemon: the first call launches it if needed, a call whose
//! socket cannot be dialed relaunches it and retries once, and deletes that
//! were handed back as provisional are awaited on close.

use crate::client::DaemonClient;
use crate::error::ClientError;
use crate::lifecycle::{ensure_daemon, LaunchOptions};
use nasctl_protocol::{pseudo, remove_socket, RpcError, SessionKey};
use serde_json::{json, Value};
use tracing::{debug, warn};

const DEFAULT_CLOSE_TIMEOUT: &str = "5m";

pub struct RemoteApi {
    session: SessionKey,
    launch: LaunchOptions,
    close_timeout: String,
    client: Option<DaemonClient>,
    /// Daemon jobs behind provisional results, awaited on close
    pending: Vec<u64>,
}

impl RemoteApi {
    pub fn new(session: SessionKey, launch: LaunchOptions) -> Self {
        Self {
            session,
            launch,
            close_timeout: DEFAULT_CLOSE_TIMEOUT.to_string(),
            client: None,
            pending: Vec::new(),
        }
    }

    /// Bound for each outstanding-job wait during [`close`](Self::close).
    pub fn with_close_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.close_timeout = timeout.into();
        self
    }

    pub fn pending_jobs(&self) -> &[u64] {
        &self.pending
    }

    async fn connection(&mut self) -> Result<&DaemonClient, ClientError> {
        if self.client.is_none() {
            ensure_daemon(&self.launch).await?;
            self.client = Some(DaemonClient::connect_to(&self.launch.socket).await?);
        }
        self.client.as_ref().ok_or(ClientError::Disconnected)
    }

    async fn try_call(
        &mut self,
        method: &str,
        timeout: Option<&str>,
        params: Value,
    ) -> Result<Value, ClientError> {
        let session = self.session.clone();
        let client = self.connection().await?;
        client.call(method, params, timeout, Some(&session)).await
    }

    /// Forward one call through the daemon.
    ///
    /// If the socket cannot be dialed the stale socket is removed, a fresh
    /// daemon is launched and the call is retried exactly once. A connection
    /// that breaks after the request was written is reported as is, since
    /// the daemon may already be running the call.
    pub async fn call(
        &mut self,
        method: &str,
        timeout: Option<&str>,
        params: Value,
    ) -> Result<Value, ClientError> {
        let result = match self.try_call(method, timeout, params.clone()).await {
            Err(e) if e.is_connect() => {
                warn!(error = %e, "Daemon unreachable, relaunching");
                self.client = None;
                remove_socket(&self.launch.socket);
                self.try_call(method, timeout, params).await
            }
            other => other,
        };

        match result {
            Ok(result) => {
                if let Some(daemon_job) = provisional_daemon_job(&result) {
                    debug!(method, daemon_job, "Remembering provisional result");
                    self.pending.push(daemon_job);
                }
                Ok(result)
            }
            Err(e) => {
                if e.is_transport() {
                    warn!(method, error = %e, "Daemon connection lost mid-call, not retrying");
                    self.client = None;
                }
                Err(e)
            }
        }
    }

    /// Await every remembered daemon job, then drop the connection.
    ///
    /// Returns `prior` if given; otherwise every failure seen while flushing
    /// is combined into [`ClientError::Aggregate`].
    pub async fn close(mut self, prior: Option<ClientError>) -> Result<(), ClientError> {
        let pending = std::mem::take(&mut self.pending);
        let timeout = self.close_timeout.clone();
        let mut failures = Vec::new();

        for daemon_job in pending {
            match self
                .call(pseudo::AWAIT_DAEMON_JOB, Some(&timeout), json!([daemon_job]))
                .await
            {
                Ok(results) => failures.extend(result_errors(&results)),
                Err(e) => failures.push(e),
            }
        }
        self.client = None;

        if let Some(prior) = prior {
            if !failures.is_empty() {
                warn!(count = failures.len(), "Outstanding operations failed during close");
            }
            return Err(prior);
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ClientError::Aggregate(failures))
        }
    }
}

/// Daemon job id of a provisional `{"pending": true, ...}` result.
fn provisional_daemon_job(result: &Value) -> Option<u64> {
    if result.get("pending") != Some(&Value::Bool(true)) {
        return None;
    }
    result.get("daemon_job_id").and_then(Value::as_u64)
}

/// Per-element errors from an `await_daemon_job` result.
fn result_errors(results: &Value) -> Vec<ClientError> {
    results
        .as_array()
        .map(|pairs| {
            pairs
                .iter()
                .filter_map(|pair| pair.get("error"))
                .filter(|error| !error.is_null())
                .map(|error| match serde_json::from_value::<RpcError>(error.clone()) {
                    Ok(rpc) => ClientError::Rpc(rpc),
                    Err(e) => ClientError::Decode(e),
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisional_detection() {
        assert_eq!(
            provisional_daemon_job(&json!({"pending": true, "call_id": 4, "daemon_job_id": 2})),
            Some(2)
        );
        assert_eq!(provisional_daemon_job(&json!({"pending": false, "daemon_job_id": 2})), None);
        assert_eq!(provisional_daemon_job(&json!(true)), None);
        assert_eq!(provisional_daemon_job(&json!([{"pending": true}])), None);
    }

    #[test]
    fn test_result_errors_skips_successes() {
        let results = json!([
            {"result": true, "error": null},
            {"result": null, "error": {"code": 2, "message": "No such dataset"}},
        ]);
        let errors = result_errors(&results);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].rpc().map(|e| e.code), Some(2));
    }
}
