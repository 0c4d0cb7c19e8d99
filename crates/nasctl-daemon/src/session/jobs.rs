//! Backend job tracking.
//!
//! Long-running backend operations answer with a job id and finish later.
//! Completion arrives as a `core.get_jobs` update, either for the job itself
//! or for a `core.job_wait` wrapper whose first argument names it.

use super::Session;
use crate::completion::{Completion, Outcome};
use crate::error::CallError;
use nasctl_protocol::backend::{JobState, JobUpdate, JOB_WAIT_METHOD};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Terminal updates kept for jobs nobody is waiting on yet.
const UNCLAIMED_CAPACITY: usize = 512;

/// Verbs that return plain integers (counts, ids) rather than job handles.
const READ_VERBS: &[&str] = &["query", "get_instance", "count"];

#[derive(Default)]
pub(super) struct JobTable {
    jobs: HashMap<i64, Arc<Completion<Value>>>,
    wait_requested: HashSet<i64>,
    /// Settled jobs nobody has claimed, oldest first
    unclaimed: VecDeque<i64>,
}

impl JobTable {
    /// Completion for `id`, creating it if needed. Claims any cached outcome.
    pub(super) fn track(&mut self, id: i64) -> Arc<Completion<Value>> {
        if let Some(pos) = self.unclaimed.iter().position(|j| *j == id) {
            self.unclaimed.remove(pos);
        }
        self.jobs
            .entry(id)
            .or_insert_with(|| Arc::new(Completion::new()))
            .clone()
    }

    /// Record a terminal outcome. Untracked jobs are cached for late waiters.
    pub(super) fn settle(&mut self, id: i64, outcome: Outcome<Value>) {
        if let Some(job) = self.jobs.get(&id) {
            job.reach(outcome);
            return;
        }
        let job = Completion::new();
        job.reach(outcome);
        self.jobs.insert(id, Arc::new(job));
        self.unclaimed.push_back(id);
        while self.unclaimed.len() > UNCLAIMED_CAPACITY {
            if let Some(evicted) = self.unclaimed.pop_front() {
                self.jobs.remove(&evicted);
            }
        }
    }

    /// Settle only if someone already tracks `id`.
    pub(super) fn settle_tracked(&mut self, id: i64, outcome: Outcome<Value>) {
        if let Some(job) = self.jobs.get(&id) {
            job.reach(outcome);
        }
    }

    /// Returns false if a wait was already requested for `id`.
    pub(super) fn mark_wait_requested(&mut self, id: i64) -> bool {
        self.wait_requested.insert(id)
    }

    pub(super) fn clear_wait_requested(&mut self, id: i64) {
        self.wait_requested.remove(&id);
    }

    /// Drop a settled job once its waiter has the outcome.
    pub(super) fn forget(&mut self, id: i64) {
        if self.jobs.get(&id).is_some_and(|j| j.is_done()) {
            self.jobs.remove(&id);
            self.wait_requested.remove(&id);
        }
    }

    pub(super) fn completions(&self) -> impl Iterator<Item = &Arc<Completion<Value>>> {
        self.jobs.values()
    }

    pub(super) fn drain(&mut self) -> Vec<Arc<Completion<Value>>> {
        self.unclaimed.clear();
        self.wait_requested.clear();
        self.jobs.drain().map(|(_, j)| j).collect()
    }

    pub(super) fn len(&self) -> usize {
        self.jobs.len()
    }
}

/// Job id started by `method`, if its result is one.
///
/// A bare integer result counts as a job handle unless the method is a read
/// (`query`, `get_instance`, `count`, `get_*`, `check*`) or a job wait.
pub(crate) fn spawned_job(method: &str, result: &Value) -> Option<i64> {
    if method == JOB_WAIT_METHOD {
        return None;
    }
    let Value::Number(n) = result else {
        return None;
    };
    let id = n.as_i64()?;
    let verb = method.rsplit('.').next().unwrap_or(method);
    if READ_VERBS.contains(&verb) || verb.starts_with("get_") || verb.starts_with("check") {
        return None;
    }
    Some(id)
}

/// First positional param as a job id.
pub(super) fn job_id_param(params: &Value) -> Result<i64, CallError> {
    let first = match params {
        Value::Array(items) => items.first(),
        other => Some(other),
    };
    first
        .and_then(Value::as_i64)
        .ok_or_else(|| CallError::InvalidParams("expected a job id".into()))
}

fn job_outcome(job_id: i64, update: &JobUpdate) -> Outcome<Value> {
    match update.state {
        JobState::Success => Ok(update.result.clone()),
        _ => Err(CallError::JobFailed {
            id: job_id,
            error: update
                .error
                .clone()
                .unwrap_or_else(|| format!("job ended in state {:?}", update.state)),
            exception: update.exception.clone(),
        }),
    }
}

impl Session {
    pub(super) fn track_job(&self, job_id: i64) -> Arc<Completion<Value>> {
        let mut tables = self.tables.lock();
        let job = tables.jobs.track(job_id);
        if let Some(failure) = &tables.failure {
            job.fail(failure.clone());
        }
        job
    }

    pub(super) fn forget_job(&self, job_id: i64) {
        self.tables.lock().jobs.forget(job_id);
    }

    pub(super) fn apply_job_update(&self, update: JobUpdate) {
        if !update.state.is_terminal() {
            trace!(job_id = update.id, state = ?update.state, "Job progress");
            return;
        }
        let mut tables = self.tables.lock();
        match update.inner_job_id() {
            Some(inner) => {
                debug!(wrapper = update.id, job_id = inner, state = ?update.state, "Job wait finished");
                tables.jobs.settle(inner, job_outcome(inner, &update));
                tables
                    .jobs
                    .settle_tracked(update.id, job_outcome(inner, &update));
            }
            None => {
                debug!(job_id = update.id, state = ?update.state, "Job finished");
                tables.jobs.settle(update.id, job_outcome(update.id, &update));
            }
        }
    }

    /// Ask the backend to wait on `job_id` so that a terminal update is
    /// emitted even for jobs that finished before we started tracking.
    /// Sent at most once per tracked job.
    pub(super) async fn request_job_wait(&self, job_id: i64) {
        let job = {
            let mut tables = self.tables.lock();
            if !tables.jobs.mark_wait_requested(job_id) {
                return;
            }
            tables.jobs.track(job_id)
        };
        if job.is_done() {
            return;
        }
        let call_id = self.next_id();
        if let Err(e) = self.send_call(call_id, JOB_WAIT_METHOD, &json!([job_id])).await {
            debug!(job_id, error = %e, "Job wait request failed");
            self.tables.lock().jobs.clear_wait_requested(job_id);
            job.fail(e);
        }
    }

    /// Transparent wait used when a call's result turns out to be a job id.
    pub(super) async fn wait_for_job(&self, job_id: i64) -> Outcome<Value> {
        let job = self.track_job(job_id);
        self.request_job_wait(job_id).await;
        let outcome = job.get().await;
        self.forget_job(job_id);
        outcome
    }

    fn spawn_job_wait(self: &Arc<Self>, job_id: i64) {
        let session = self.clone();
        tokio::spawn(async move { session.request_job_wait(job_id).await });
    }

    /// `await_external_job [job_id]`: wait for a job started elsewhere.
    pub(super) async fn await_external_job(
        self: &Arc<Self>,
        params: &Value,
        bound: Duration,
    ) -> Outcome<Value> {
        let job_id = job_id_param(params)?;
        let job = self.track_job(job_id);
        if !job.is_done() {
            self.spawn_job_wait(job_id);
        }
        match job.await_or_timeout(bound).await {
            Some(outcome) => {
                self.forget_job(job_id);
                outcome
            }
            None if self.is_closed() => Err(CallError::Interrupted),
            None => Err(CallError::Timeout {
                method: format!("job {}", job_id),
                after: bound,
            }),
        }
    }

    /// `peek_external_job [job_id]`: non-blocking status; starts tracking.
    pub(super) fn peek_external_job(self: &Arc<Self>, params: &Value) -> Outcome<Value> {
        let job_id = job_id_param(params)?;
        let job = self.track_job(job_id);
        let snapshot = job.peek();
        if snapshot.is_none() {
            self.spawn_job_wait(job_id);
        }
        let (result, error) = split_outcome(snapshot.as_ref());
        Ok(json!({
            "id": job_id,
            "done": snapshot.is_some(),
            "result": result,
            "error": error,
        }))
    }
}

/// `(result, error)` pair for JSON payloads.
pub(super) fn split_outcome(outcome: Option<&Outcome<Value>>) -> (Value, Value) {
    match outcome {
        Some(Ok(value)) => (value.clone(), Value::Null),
        Some(Err(e)) => (Value::Null, e.to_value()),
        None => (Value::Null, Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_result_of_mutation_is_a_job() {
        assert_eq!(spawned_job("pool.dataset.delete", &json!(42)), Some(42));
        assert_eq!(spawned_job("zfs.snapshot.rollback", &json!(7)), Some(7));
    }

    #[test]
    fn test_reads_and_non_integers_are_not_jobs() {
        assert_eq!(spawned_job("pool.dataset.query", &json!(3)), None);
        assert_eq!(spawned_job("pool.dataset.count", &json!(3)), None);
        assert_eq!(spawned_job("pool.dataset.get_instance", &json!(3)), None);
        assert_eq!(spawned_job("system.get_uptime", &json!(3)), None);
        assert_eq!(spawned_job("update.check_available", &json!(1)), None);
        assert_eq!(spawned_job("core.job_wait", &json!(3)), None);
        assert_eq!(spawned_job("pool.dataset.create", &json!({"id": 3})), None);
        assert_eq!(spawned_job("pool.dataset.create", &json!(1.5)), None);
    }

    #[test]
    fn test_job_id_param_accepts_array_or_scalar() {
        assert_eq!(job_id_param(&json!([17])).unwrap(), 17);
        assert_eq!(job_id_param(&json!(17)).unwrap(), 17);
        assert!(matches!(
            job_id_param(&json!(["x"])),
            Err(CallError::InvalidParams(_))
        ));
        assert!(job_id_param(&json!([])).is_err());
    }

    #[test]
    fn test_settled_job_is_claimable_later() {
        let mut table = JobTable::default();
        table.settle(5, Ok(json!("done")));
        let job = table.track(5);
        assert!(matches!(job.peek(), Some(Ok(v)) if v == json!("done")));
    }

    #[test]
    fn test_unclaimed_cache_is_bounded() {
        let mut table = JobTable::default();
        for id in 0..(UNCLAIMED_CAPACITY as i64 + 10) {
            table.settle(id, Ok(Value::Null));
        }
        assert_eq!(table.len(), UNCLAIMED_CAPACITY);
        assert!(!table.track(0).is_done());
        assert!(table.track(UNCLAIMED_CAPACITY as i64 + 9).is_done());
    }

    #[test]
    fn test_claimed_jobs_survive_eviction() {
        let mut table = JobTable::default();
        table.settle(1, Ok(json!(1)));
        let claimed = table.track(1);
        for id in 100..(100 + UNCLAIMED_CAPACITY as i64 + 5) {
            table.settle(id, Ok(Value::Null));
        }
        assert!(claimed.is_done());
        assert!(table.track(1).is_done());
    }

    #[test]
    fn test_failed_job_outcome_uses_waited_id() {
        let update = JobUpdate {
            id: 43,
            state: JobState::Aborted,
            method: Some(JOB_WAIT_METHOD.into()),
            arguments: vec![json!(42)],
            result: Value::Null,
            error: None,
            exception: None,
        };
        match job_outcome(42, &update) {
            Err(CallError::JobFailed { id, error, .. }) => {
                assert_eq!(id, 42);
                assert!(error.contains("Aborted"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
