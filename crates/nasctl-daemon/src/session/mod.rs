//! One authenticated backend connection multiplexed across many callers.
//!
//! Every outbound call gets a fresh id and a [`Completion`] in the call
//! table. A single receive loop owns the read side of the transport and
//! settles completions by response id or by job notification. Callers only
//! ever block on their own completion, never on the transport.
//!
//! Layers on top of plain request/response:
//! - [`jobs`]: results that name a backend job are awaited transparently
//! - [`conflict`]: mutations of the same dataset/snapshot are serialized
//! - [`bulk`]: one request fans out into many tracked calls

mod bulk;
mod conflict;
mod jobs;

pub use conflict::ConflictKey;

use crate::completion::{Completion, Outcome};
use crate::error::CallError;
use crate::transport::{Connector, MessageSink, MessageStream, Transport};
use chrono::{DateTime, Utc};
use conflict::PendingAction;
use jobs::JobTable;
use nasctl_protocol::backend::{
    positional_params, BackendRequest, Inbound, JOBS_COLLECTION, JOB_WAIT_METHOD, LOGIN_METHOD,
    SUBSCRIBE_METHOD,
};
use nasctl_protocol::{effective_timeout, pseudo, SessionKey, DEFAULT_CALL_TIMEOUT};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Tunables for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound for calls whose request carries no usable timeout
    pub default_timeout: Duration,
    /// How long a mutation waits for a conflicting in-flight mutation
    pub conflict_wait: Duration,
    /// How long a delete is awaited before a provisional handle is returned
    pub delete_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_CALL_TIMEOUT,
            conflict_wait: Duration::from_secs(15),
            delete_grace: Duration::from_millis(500),
        }
    }
}

/// Snapshot of a session for `daemon.status`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub server: String,
    pub opened_at: DateTime<Utc>,
    pub pending_calls: usize,
    pub operations: usize,
    pub tracked_jobs: usize,
    pub daemon_jobs: usize,
    pub pending_actions: usize,
}

/// A call that has been handed to its own task.
struct Operation {
    call_id: u64,
    outcome: Arc<Completion<Value>>,
    dispatch: Arc<Dispatch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    Queued,
    Sent,
    Abandoned,
}

/// Decides, once, whether a queued call goes out or is dropped because its
/// caller stopped waiting first.
struct Dispatch {
    state: Mutex<DispatchState>,
    abandoned: CancellationToken,
}

impl Dispatch {
    fn new() -> Self {
        Self {
            state: Mutex::new(DispatchState::Queued),
            abandoned: CancellationToken::new(),
        }
    }

    /// Claim the right to send. False once the caller has abandoned the call.
    fn open(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            DispatchState::Queued => {
                *state = DispatchState::Sent;
                true
            }
            DispatchState::Sent => true,
            DispatchState::Abandoned => false,
        }
    }

    /// Drop the call if it has not been sent yet. Returns true if it was
    /// dropped, false if the request already went out.
    fn abandon(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != DispatchState::Queued {
                return false;
            }
            *state = DispatchState::Abandoned;
        }
        self.abandoned.cancel();
        true
    }
}

#[derive(Default)]
struct Tables {
    /// Raw backend responses by call id
    calls: HashMap<u64, Arc<Completion<Value>>>,
    /// Final outcomes (after any job wait) of calls still running
    operations: HashMap<u64, Arc<Completion<Value>>>,
    jobs: JobTable,
    daemon_jobs: HashMap<u64, Vec<Arc<Completion<Value>>>>,
    next_daemon_job: u64,
    pending_actions: HashMap<ConflictKey, PendingAction>,
    /// Set once the session is torn down; new calls fail with it
    failure: Option<CallError>,
}

pub struct Session {
    key: SessionKey,
    config: SessionConfig,
    sink: Box<dyn MessageSink>,
    next_call_id: AtomicU64,
    tables: Mutex<Tables>,
    closed: CancellationToken,
    opened_at: DateTime<Utc>,
}

impl Session {
    /// Connect, log in and subscribe to job updates.
    pub async fn establish(
        key: SessionKey,
        connector: &dyn Connector,
        config: SessionConfig,
    ) -> Result<Arc<Self>, CallError> {
        let bound = config.default_timeout;
        let transport = match tokio::time::timeout(bound, connector.connect(&key)).await {
            Ok(transport) => transport?,
            Err(_) => {
                warn!(server = %key.server, ?bound, "Backend connect timed out");
                return Err(CallError::Connect {
                    server: key.server.clone(),
                    reason: format!("timed out after {:?}", bound),
                });
            }
        };
        let session = Self::start(key, transport, config);
        if let Err(e) = session.login().await {
            warn!(server = %session.key.server, error = %e, "Session login failed");
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    /// Wrap an already connected transport and start its receive loop.
    pub fn start(key: SessionKey, transport: Transport, config: SessionConfig) -> Arc<Self> {
        let session = Arc::new(Self {
            key,
            config,
            sink: transport.sink,
            next_call_id: AtomicU64::new(1),
            tables: Mutex::new(Tables {
                next_daemon_job: 1,
                ..Tables::default()
            }),
            closed: CancellationToken::new(),
            opened_at: Utc::now(),
        });
        tokio::spawn(session.clone().receive_loop(transport.stream));
        session
    }

    async fn login(&self) -> Result<(), CallError> {
        let bound = self.config.default_timeout;
        let accepted = self
            .request(LOGIN_METHOD, json!([self.key.api_key]), bound)
            .await?;
        if accepted != Value::Bool(true) {
            return Err(CallError::Auth {
                server: self.key.server.clone(),
            });
        }
        self.request(SUBSCRIBE_METHOD, json!([JOBS_COLLECTION]), bound)
            .await?;
        info!(server = %self.key.server, "Session authenticated");
        Ok(())
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session has been torn down for any reason.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Entry point for one request from the local socket.
    pub async fn call(
        self: &Arc<Self>,
        method: &str,
        timeout: Option<&str>,
        params: Value,
    ) -> Outcome<Value> {
        let bound = effective_timeout(timeout, self.config.default_timeout);
        match method {
            pseudo::BULK_CALL => self.bulk_call(params),
            pseudo::AWAIT_DAEMON_JOB => self.await_daemon_job(&params, bound).await,
            pseudo::PEEK_DAEMON_JOB => self.peek_daemon_job(&params),
            pseudo::AWAIT_EXTERNAL_JOB => self.await_external_job(&params, bound).await,
            pseudo::PEEK_EXTERNAL_JOB => self.peek_external_job(&params),
            _ => self.call_backend(method, params, bound).await,
        }
    }

    async fn call_backend(
        self: &Arc<Self>,
        method: &str,
        params: Value,
        bound: Duration,
    ) -> Outcome<Value> {
        let op = self.spawn_operation(method.to_string(), params)?;

        if conflict::is_delete(method) {
            let grace = self.config.delete_grace.min(bound);
            if let Some(outcome) = op.outcome.await_or_timeout(grace).await {
                return outcome;
            }
            let daemon_job = self.register_daemon_job(vec![op.outcome.clone()]);
            debug!(
                method,
                call_id = op.call_id,
                daemon_job,
                "Delete still running, returning provisional handle"
            );
            return Ok(json!({
                "pending": true,
                "call_id": op.call_id,
                "daemon_job_id": daemon_job,
            }));
        }

        match op.outcome.await_or_timeout(bound).await {
            Some(outcome) => outcome,
            None if self.is_closed() => Err(CallError::Interrupted),
            None if op.dispatch.abandon() => {
                warn!(method, call_id = op.call_id, ?bound, "Call timed out before it was sent");
                Err(CallError::Timeout {
                    method: method.to_string(),
                    after: bound,
                })
            }
            None => {
                let daemon_job = self.register_daemon_job(vec![op.outcome.clone()]);
                warn!(
                    method,
                    call_id = op.call_id,
                    daemon_job,
                    ?bound,
                    "Call timed out, keeping its result"
                );
                Err(CallError::TimeoutPending {
                    method: method.to_string(),
                    after: bound,
                    call_id: op.call_id,
                    daemon_job,
                })
            }
        }
    }

    /// Assign a call id and run the call in its own task so that it finishes
    /// (and releases any conflict record) even if the caller stops waiting.
    fn spawn_operation(
        self: &Arc<Self>,
        method: String,
        params: Value,
    ) -> Result<Operation, CallError> {
        let call_id = self.next_id();
        let outcome = Arc::new(Completion::new());
        {
            let mut tables = self.tables.lock();
            if let Some(failure) = &tables.failure {
                return Err(failure.clone());
            }
            tables.operations.insert(call_id, outcome.clone());
        }

        let dispatch = Arc::new(Dispatch::new());
        let session = self.clone();
        let task_outcome = outcome.clone();
        let task_dispatch = dispatch.clone();
        tokio::spawn(async move {
            session
                .run_operation(call_id, method, params, task_outcome, task_dispatch)
                .await;
        });

        Ok(Operation {
            call_id,
            outcome,
            dispatch,
        })
    }

    async fn run_operation(
        self: Arc<Self>,
        call_id: u64,
        method: String,
        params: Value,
        outcome: Arc<Completion<Value>>,
        dispatch: Arc<Dispatch>,
    ) {
        let params = positional_params(params);
        let signature = conflict::signature(&method, &params);
        let mut holds_slot = false;
        if let Some(key) = &signature {
            holds_slot = self
                .acquire_conflict_slot(key, call_id, &outcome, &dispatch.abandoned)
                .await;
        }

        // A call whose caller gave up while it was queued is never sent.
        let result = if (signature.is_none() || holds_slot) && dispatch.open() {
            let result = self.execute(call_id, &method, &params).await;
            if let Err(e) = &result {
                debug!(call_id, method = %method, error = %e, "Call failed");
            }
            result
        } else {
            debug!(call_id, method = %method, "Caller gave up before the call was sent");
            Err(CallError::Interrupted)
        };

        if let Some(key) = signature.as_ref().filter(|_| holds_slot) {
            self.release_conflict_slot(key, call_id);
        }
        self.tables.lock().operations.remove(&call_id);
        outcome.reach(result);
    }

    /// Send one call and resolve it to its terminal payload.
    async fn execute(&self, call_id: u64, method: &str, params: &Value) -> Outcome<Value> {
        if method == JOB_WAIT_METHOD {
            // The caller asked for the wait itself; don't wrap it a second time.
            let job_id = jobs::job_id_param(params)?;
            let job = self.track_job(job_id);
            self.tables.lock().jobs.mark_wait_requested(job_id);
            if let Err(e) = self.send_call(call_id, method, params).await {
                job.fail(e);
            }
            let outcome = job.get().await;
            self.forget_job(job_id);
            return outcome;
        }

        let result = self.send_call(call_id, method, params).await?;
        match jobs::spawned_job(method, &result) {
            Some(job_id) => {
                debug!(call_id, method, job_id, "Call started a job, awaiting it");
                self.wait_for_job(job_id).await
            }
            None => Ok(result),
        }
    }

    /// Register a raw completion, send the request and wait for the response.
    async fn send_call(&self, call_id: u64, method: &str, params: &Value) -> Outcome<Value> {
        let response = Arc::new(Completion::new());
        {
            let mut tables = self.tables.lock();
            if let Some(failure) = &tables.failure {
                return Err(failure.clone());
            }
            tables.calls.insert(call_id, response.clone());
        }

        let sent = match BackendRequest::new(call_id, method, params).encode() {
            Ok(text) => self.sink.send(text).await.map_err(CallError::from),
            Err(e) => Err(CallError::Encode(e.to_string())),
        };
        if let Err(e) = sent {
            self.tables.lock().calls.remove(&call_id);
            return Err(e);
        }
        trace!(call_id, method, "Sent backend call");

        response.get().await
    }

    /// Bounded call used during session setup.
    async fn request(&self, method: &str, params: Value, bound: Duration) -> Outcome<Value> {
        let call_id = self.next_id();
        match tokio::time::timeout(bound, self.send_call(call_id, method, &params)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CallError::Timeout {
                method: method.to_string(),
                after: bound,
            }),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_call_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn receive_loop(self: Arc<Self>, mut stream: Box<dyn MessageStream>) {
        let failure = loop {
            let next = tokio::select! {
                biased;
                _ = self.closed.cancelled() => break CallError::SessionClosed,
                next = stream.next_message() => next,
            };
            let text = match next {
                Ok(text) => text,
                Err(e) => {
                    warn!(server = %self.key.server, error = %e, "Backend transport failed");
                    break CallError::Transport(e);
                }
            };
            match Inbound::parse(&text) {
                Ok(Inbound::Response { id, outcome }) => {
                    self.complete_call(id, outcome.map_err(CallError::from))
                }
                Ok(Inbound::JobUpdate(update)) => self.apply_job_update(update),
                Ok(Inbound::Other) => trace!("Ignoring unsolicited backend message"),
                Err(e) => warn!(error = %e, "Dropping malformed backend message"),
            }
        };
        self.teardown(failure);
    }

    fn complete_call(&self, call_id: u64, outcome: Outcome<Value>) {
        let call = self.tables.lock().calls.remove(&call_id);
        match call {
            Some(call) => {
                call.reach(outcome);
            }
            None => debug!(call_id, "Response for unknown call id"),
        }
    }

    /// Fail every pending call and job with `failure` and mark the session
    /// closed. Only the first teardown has any effect.
    fn teardown(&self, failure: CallError) {
        let (calls, jobs) = {
            let mut tables = self.tables.lock();
            if tables.failure.is_some() {
                return;
            }
            tables.failure = Some(failure.clone());
            let calls: Vec<_> = tables.calls.drain().map(|(_, c)| c).collect();
            (calls, tables.jobs.drain())
        };
        info!(
            server = %self.key.server,
            calls = calls.len(),
            jobs = jobs.len(),
            reason = %failure,
            "Tearing down session"
        );
        for call in calls {
            call.fail(failure.clone());
        }
        for job in jobs {
            job.fail(failure.clone());
        }
        self.closed.cancel();
    }

    /// Close the session: waiters are interrupted, pending work fails with
    /// `SessionClosed`, and the transport is shut.
    pub async fn close(&self) {
        self.closed.cancel();
        {
            let tables = self.tables.lock();
            for op in tables.operations.values() {
                op.interrupt();
            }
            for job in tables.jobs.completions() {
                job.interrupt();
            }
            for members in tables.daemon_jobs.values() {
                for member in members {
                    member.interrupt();
                }
            }
        }
        self.teardown(CallError::SessionClosed);
        self.sink.close().await;
    }

    pub fn stats(&self) -> SessionStats {
        let tables = self.tables.lock();
        SessionStats {
            server: self.key.server.clone(),
            opened_at: self.opened_at,
            pending_calls: tables.calls.len(),
            operations: tables.operations.len(),
            tracked_jobs: tables.jobs.len(),
            daemon_jobs: tables.daemon_jobs.len(),
            pending_actions: tables.pending_actions.len(),
        }
    }
}
