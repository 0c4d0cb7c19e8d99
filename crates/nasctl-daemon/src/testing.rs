//! In-memory scripted backend for tests.
//!
//! [`MockBackend`] implements [`Connector`] over channels and speaks enough of
//! the appliance protocol to exercise sessions: API-key login, job
//! subscription, jobs that finish after a delay, and `core.job_wait`
//! wrappers. Everything else is answered by per-method handlers.

use crate::completion::{Completion, Outcome};
use crate::error::{CallError, TransportError};
use crate::transport::{Connector, MessageSink, MessageStream, Transport};
use async_trait::async_trait;
use nasctl_protocol::backend::{
    COLLECTION_UPDATE, JOBS_COLLECTION, JOB_WAIT_METHOD, LOGIN_METHOD, SUBSCRIBE_METHOD,
};
use nasctl_protocol::SessionKey;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type Handler = Arc<dyn Fn(&Value) -> MockReply + Send + Sync>;

/// How the mock answers one call.
#[derive(Debug, Clone)]
pub enum MockReply {
    Value(Value),
    Error {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    Delayed(Duration, Box<MockReply>),
    /// Answer with a fresh job id; the job finishes after `after`
    Job {
        after: Duration,
        outcome: Result<Value, String>,
    },
    /// Never answer
    Silent,
}

impl MockReply {
    pub fn value(value: Value) -> Self {
        MockReply::Value(value)
    }

    pub fn error(code: i64, message: impl Into<String>) -> Self {
        MockReply::Error {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn job(after: Duration, result: Value) -> Self {
        MockReply::Job {
            after,
            outcome: Ok(result),
        }
    }

    pub fn failed_job(after: Duration, error: impl Into<String>) -> Self {
        MockReply::Job {
            after,
            outcome: Err(error.into()),
        }
    }

    pub fn after(self, delay: Duration) -> Self {
        MockReply::Delayed(delay, Box::new(self))
    }
}

/// A request as the mock received it.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub id: u64,
    pub method: String,
    pub params: Value,
    pub at: Instant,
}

struct Connection {
    out: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

struct MockState {
    handlers: Mutex<HashMap<String, Handler>>,
    calls: Mutex<Vec<RecordedCall>>,
    logins: AtomicUsize,
    connects: AtomicUsize,
    connect_delay: Mutex<Duration>,
    refuse: AtomicBool,
    api_key: Mutex<Option<String>>,
    announce_jobs: AtomicBool,
    next_job: AtomicI64,
    jobs: Mutex<HashMap<i64, Arc<Completion<Value>>>>,
    connections: Mutex<Vec<Connection>>,
}

#[derive(Clone)]
pub struct MockBackend {
    state: Arc<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                handlers: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                logins: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                connect_delay: Mutex::new(Duration::ZERO),
                refuse: AtomicBool::new(false),
                api_key: Mutex::new(None),
                announce_jobs: AtomicBool::new(true),
                next_job: AtomicI64::new(100),
                jobs: Mutex::new(HashMap::new()),
                connections: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Only this API key logs in successfully.
    pub fn with_api_key(self, key: impl Into<String>) -> Self {
        *self.state.api_key.lock() = Some(key.into());
        self
    }

    pub fn on<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(&Value) -> MockReply + Send + Sync + 'static,
    {
        self.state
            .handlers
            .lock()
            .insert(method.into(), Arc::new(handler));
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock() = delay;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// When false, jobs finish silently and only `core.job_wait` wrappers
    /// report them.
    pub fn announce_jobs(&self, announce: bool) {
        self.state.announce_jobs.store(announce, Ordering::SeqCst);
    }

    pub fn login_count(&self) -> usize {
        self.state.logins.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == method)
            .collect()
    }

    /// Start a job as if some other client had, returning its id.
    pub fn start_job(&self, after: Duration, outcome: Result<Value, String>) -> i64 {
        self.state.start_job(after, outcome)
    }

    /// Drop every connection as a network failure would.
    pub fn kill_connections(&self) {
        for conn in self.state.connections.lock().drain(..) {
            conn.cancel.cancel();
        }
    }

    /// Send raw text to every connected session.
    pub fn push_raw(&self, text: impl Into<String>) {
        self.state.broadcast(text.into());
    }
}

impl MockState {
    fn broadcast(&self, text: String) {
        let mut connections = self.connections.lock();
        connections.retain(|c| !c.cancel.is_cancelled() && c.out.send(text.clone()).is_ok());
    }

    fn start_job(self: &Arc<Self>, after: Duration, outcome: Result<Value, String>) -> i64 {
        let job_id = self.next_job.fetch_add(1, Ordering::SeqCst);
        let job = Arc::new(Completion::new());
        self.jobs.lock().insert(job_id, job.clone());

        let state = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let outcome = outcome.map_err(|error| CallError::JobFailed {
                id: job_id,
                error,
                exception: None,
            });
            job.reach(outcome.clone());
            if state.announce_jobs.load(Ordering::SeqCst) {
                state.broadcast(job_update(job_id, "mock.job", json!([]), &outcome));
            }
        });
        job_id
    }

    fn handle(self: &Arc<Self>, text: &str, out: &mpsc::UnboundedSender<String>) {
        let Ok(req) = serde_json::from_str::<Value>(text) else {
            return;
        };
        let id = req.get("id").and_then(Value::as_u64).unwrap_or_default();
        let method = req
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = req.get("params").cloned().unwrap_or(Value::Null);
        self.calls.lock().push(RecordedCall {
            id,
            method: method.clone(),
            params: params.clone(),
            at: Instant::now(),
        });

        let state = self.clone();
        let out = out.clone();
        if method == JOB_WAIT_METHOD {
            tokio::spawn(async move { state.job_wait(id, params, out).await });
            return;
        }
        let reply = self.reply_for(&method, &params);
        tokio::spawn(async move { state.deliver(id, reply, out).await });
    }

    fn reply_for(&self, method: &str, params: &Value) -> MockReply {
        match method {
            LOGIN_METHOD => {
                self.logins.fetch_add(1, Ordering::SeqCst);
                let offered = params.get(0).and_then(Value::as_str);
                let accepted = match self.api_key.lock().as_deref() {
                    Some(expected) => offered == Some(expected),
                    None => true,
                };
                MockReply::Value(json!(accepted))
            }
            SUBSCRIBE_METHOD => MockReply::Value(json!("subscription-1")),
            _ => match self.handlers.lock().get(method).cloned() {
                Some(handler) => handler(params),
                None => MockReply::error(-32601, format!("Method {} not found", method)),
            },
        }
    }

    async fn deliver(self: Arc<Self>, id: u64, reply: MockReply, out: mpsc::UnboundedSender<String>) {
        let mut reply = reply;
        loop {
            match reply {
                MockReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
                MockReply::Value(value) => {
                    let _ = out.send(json!({"jsonrpc": "2.0", "id": id, "result": value}).to_string());
                    return;
                }
                MockReply::Error {
                    code,
                    message,
                    data,
                } => {
                    let mut error = json!({"code": code, "message": message});
                    if let Some(data) = data {
                        error["data"] = data;
                    }
                    let _ = out.send(json!({"jsonrpc": "2.0", "id": id, "error": error}).to_string());
                    return;
                }
                MockReply::Job { after, outcome } => {
                    let job_id = self.start_job(after, outcome);
                    let _ = out.send(json!({"jsonrpc": "2.0", "id": id, "result": job_id}).to_string());
                    return;
                }
                MockReply::Silent => return,
            }
        }
    }

    async fn job_wait(self: Arc<Self>, id: u64, params: Value, out: mpsc::UnboundedSender<String>) {
        let inner = params.get(0).and_then(Value::as_i64);
        let job = inner.and_then(|j| self.jobs.lock().get(&j).cloned());
        let (Some(inner), Some(job)) = (inner, job) else {
            let error = json!({"code": 22, "message": "Job not found", "data": {"reason": "no such job"}});
            let _ = out.send(json!({"jsonrpc": "2.0", "id": id, "error": error}).to_string());
            return;
        };

        let wrapper = self.next_job.fetch_add(1, Ordering::SeqCst);
        let _ = out.send(json!({"jsonrpc": "2.0", "id": id, "result": wrapper}).to_string());
        let outcome = job.get().await;
        let _ = out.send(job_update(wrapper, JOB_WAIT_METHOD, json!([inner]), &outcome));
    }
}

fn job_update(job_id: i64, method: &str, arguments: Value, outcome: &Outcome<Value>) -> String {
    let (state, result, error) = match outcome {
        Ok(value) => ("SUCCESS", value.clone(), Value::Null),
        Err(CallError::JobFailed { error, .. }) => ("FAILED", Value::Null, json!(error)),
        Err(e) => ("FAILED", Value::Null, json!(e.to_string())),
    };
    json!({
        "jsonrpc": "2.0",
        "method": COLLECTION_UPDATE,
        "params": {
            "msg": "changed",
            "collection": JOBS_COLLECTION,
            "id": job_id,
            "fields": {
                "id": job_id,
                "state": state,
                "method": method,
                "arguments": arguments,
                "result": result,
                "error": error,
            }
        }
    })
    .to_string()
}

#[async_trait]
impl Connector for MockBackend {
    async fn connect(&self, key: &SessionKey) -> Result<Transport, CallError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(CallError::Connect {
                server: key.server.clone(),
                reason: "connection refused".into(),
            });
        }

        let (to_backend, mut from_session) = mpsc::unbounded_channel::<String>();
        let (to_session, from_backend) = mpsc::unbounded_channel::<String>();
        let cancel = CancellationToken::new();
        self.state.connections.lock().push(Connection {
            out: to_session.clone(),
            cancel: cancel.clone(),
        });

        let state = self.state.clone();
        let serve_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = serve_cancel.cancelled() => break,
                    text = from_session.recv() => match text {
                        Some(text) => state.handle(&text, &to_session),
                        None => break,
                    },
                }
            }
        });

        Ok(Transport {
            sink: Box::new(ChannelSink {
                tx: Mutex::new(Some(to_backend)),
            }),
            stream: Box::new(ChannelStream {
                rx: from_backend,
                cancel,
            }),
        })
    }
}

struct ChannelSink {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        let tx = self.tx.lock();
        let tx = tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(text).map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        self.tx.lock().take();
    }
}

struct ChannelStream {
    rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
}

#[async_trait]
impl MessageStream for ChannelStream {
    async fn next_message(&mut self) -> Result<String, TransportError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::Io("connection reset".into())),
            text = self.rx.recv() => text.ok_or(TransportError::Closed),
        }
    }
}
