//! Fan-out of one method over many parameter sets.
//!
//! A bulk call returns a daemon job id right away. Each element runs as an
//! ordinary call (conflict rules and job waits included) and the daemon job
//! collects their outcomes in submission order.

use super::jobs::split_outcome;
use super::Session;
use crate::completion::{Completion, Outcome};
use crate::error::CallError;
use nasctl_protocol::pseudo;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

fn bulk_params(params: Value) -> Result<(String, Vec<Value>), CallError> {
    let Value::Array(mut items) = params else {
        return Err(CallError::InvalidParams(
            "bulk_call expects [method, [params...]]".into(),
        ));
    };
    if items.len() != 2 {
        return Err(CallError::InvalidParams(
            "bulk_call expects [method, [params...]]".into(),
        ));
    }
    let list = items.pop().unwrap_or(Value::Null);
    let method = items.pop().unwrap_or(Value::Null);

    let Value::String(method) = method else {
        return Err(CallError::InvalidParams("bulk_call method must be a string".into()));
    };
    if pseudo::is_pseudo(&method) {
        return Err(CallError::InvalidParams(format!(
            "{} cannot be used inside bulk_call",
            method
        )));
    }
    let Value::Array(elements) = list else {
        return Err(CallError::InvalidParams("bulk_call params must be an array".into()));
    };
    // Each element is one call's positional params.
    let elements = elements
        .into_iter()
        .map(|e| match e {
            Value::Array(_) => e,
            other => Value::Array(vec![other]),
        })
        .collect();
    Ok((method, elements))
}

fn daemon_job_param(params: &Value) -> Result<u64, CallError> {
    let first = match params {
        Value::Array(items) => items.first(),
        other => Some(other),
    };
    first
        .and_then(Value::as_u64)
        .ok_or_else(|| CallError::InvalidParams("expected a daemon job id".into()))
}

impl Session {
    pub(super) fn register_daemon_job(&self, members: Vec<Arc<Completion<Value>>>) -> u64 {
        let mut tables = self.tables.lock();
        let id = tables.next_daemon_job;
        tables.next_daemon_job += 1;
        tables.daemon_jobs.insert(id, members);
        id
    }

    /// `bulk_call [method, [params...]]`
    pub(super) fn bulk_call(self: &Arc<Self>, params: Value) -> Outcome<Value> {
        let (method, elements) = bulk_params(params)?;
        let count = elements.len();
        let members = elements
            .into_iter()
            .map(|p| Ok(self.spawn_operation(method.clone(), p)?.outcome))
            .collect::<Result<Vec<_>, CallError>>()?;
        let id = self.register_daemon_job(members);
        info!(method = %method, count, daemon_job = id, "Started bulk call");
        Ok(json!(id))
    }

    /// `await_daemon_job [id]`: ordered `{result, error}` pairs. The daemon
    /// job is forgotten once fully awaited.
    pub(super) async fn await_daemon_job(
        &self,
        params: &Value,
        bound: Duration,
    ) -> Outcome<Value> {
        let id = daemon_job_param(params)?;
        let members = self
            .tables
            .lock()
            .daemon_jobs
            .get(&id)
            .cloned()
            .ok_or(CallError::UnknownDaemonJob(id))?;

        let deadline = Instant::now() + bound;
        let mut pairs = Vec::with_capacity(members.len());
        for member in &members {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(outcome) = member.await_or_timeout(remaining).await else {
                if self.is_closed() {
                    return Err(CallError::Interrupted);
                }
                return Err(CallError::Timeout {
                    method: format!("daemon job {}", id),
                    after: bound,
                });
            };
            let (result, error) = split_outcome(Some(&outcome));
            pairs.push(json!({ "result": result, "error": error }));
        }

        self.tables.lock().daemon_jobs.remove(&id);
        debug!(daemon_job = id, count = pairs.len(), "Daemon job collected");
        Ok(Value::Array(pairs))
    }

    /// `peek_daemon_job [id]`: per-element status without waiting.
    pub(super) fn peek_daemon_job(&self, params: &Value) -> Outcome<Value> {
        let id = daemon_job_param(params)?;
        let members = self
            .tables
            .lock()
            .daemon_jobs
            .get(&id)
            .cloned()
            .ok_or(CallError::UnknownDaemonJob(id))?;

        let results: Vec<Value> = members
            .iter()
            .map(|m| {
                let snapshot = m.peek();
                let (result, error) = split_outcome(snapshot.as_ref());
                json!({ "done": snapshot.is_some(), "result": result, "error": error })
            })
            .collect();
        let done = members.iter().all(|m| m.is_done());
        Ok(json!({ "id": id, "done": done, "results": results }))
    }
}
