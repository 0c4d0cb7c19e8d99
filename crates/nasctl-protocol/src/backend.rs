//! Messages exchanged with the appliance's management API.
//!
//! Outbound calls are JSON-RPC 2.0 requests with positional params. Inbound
//! traffic is either a response correlated by numeric id or an unsolicited
//! `collection_update` notification; only `core.get_jobs` updates matter here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "2.0";

pub const LOGIN_METHOD: &str = "auth.login_with_api_key";
pub const SUBSCRIBE_METHOD: &str = "core.subscribe";
pub const JOB_WAIT_METHOD: &str = "core.job_wait";
pub const JOBS_COLLECTION: &str = "core.get_jobs";
pub const COLLECTION_UPDATE: &str = "collection_update";

#[derive(Debug, Clone, Serialize)]
pub struct BackendRequest<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: &'a Value,
    pub id: u64,
}

impl<'a> BackendRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: &'a Value) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION,
            method,
            params,
            id,
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Normalize call params to the positional form the backend expects.
pub fn positional_params(params: Value) -> Value {
    match params {
        Value::Null => Value::Array(Vec::new()),
        Value::Array(_) => params,
        other => Value::Array(vec![other]),
    }
}

/// Error object carried in a backend response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Waiting,
    Running,
    Success,
    Failed,
    Aborted,
    #[serde(other)]
    Unknown,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Success | JobState::Failed | JobState::Aborted)
    }
}

/// Job transition reported through `collection_update`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub id: i64,
    pub state: JobState,
    pub method: Option<String>,
    pub arguments: Vec<Value>,
    pub result: Value,
    pub error: Option<String>,
    pub exception: Option<Value>,
}

impl JobUpdate {
    /// Id of the job whose outcome this update settles.
    ///
    /// A `core.job_wait` wrapper reports the job it waits on in its first
    /// argument; that inner id is the one callers are waiting for.
    pub fn inner_job_id(&self) -> Option<i64> {
        if self.method.as_deref() == Some(JOB_WAIT_METHOD) {
            self.arguments.first().and_then(Value::as_i64)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response {
        id: u64,
        outcome: Result<Value, BackendError>,
    },
    JobUpdate(JobUpdate),
    /// Anything else: other collections, pings, responses with foreign ids
    Other,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<BackendError>,
}

#[derive(Deserialize)]
struct CollectionUpdate {
    #[serde(default)]
    collection: Option<String>,
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    fields: Option<Value>,
}

#[derive(Deserialize)]
struct JobFields {
    #[serde(default)]
    id: Option<i64>,
    state: JobState,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    exception: Option<Value>,
}

impl Inbound {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let raw: RawMessage = serde_json::from_str(text)?;

        if raw.method.as_deref() == Some(COLLECTION_UPDATE) {
            let Some(params) = raw.params else {
                return Ok(Inbound::Other);
            };
            let update: CollectionUpdate = serde_json::from_value(params)?;
            if update
                .collection
                .as_deref()
                .is_some_and(|c| c != JOBS_COLLECTION)
            {
                return Ok(Inbound::Other);
            }
            let Some(fields) = update.fields else {
                return Ok(Inbound::Other);
            };
            let fields: JobFields = serde_json::from_value(fields)?;
            let Some(id) = update.id.or(fields.id) else {
                return Ok(Inbound::Other);
            };
            return Ok(Inbound::JobUpdate(JobUpdate {
                id,
                state: fields.state,
                method: fields.method,
                arguments: fields.arguments,
                result: fields.result,
                error: fields.error,
                exception: fields.exception,
            }));
        }

        let Some(id) = raw.id.as_ref().and_then(Value::as_u64) else {
            return Ok(Inbound::Other);
        };
        let outcome = match raw.error {
            Some(err) => Err(err),
            None => Ok(raw.result.unwrap_or(Value::Null)),
        };
        Ok(Inbound::Response { id, outcome })
    }
}
