//! Serialization of conflicting mutations.
//!
//! Two mutating calls against the same dataset or snapshot would race inside
//! the backend, so the second waits for the first. The record of the running
//! call is keyed by namespace and object only; verbs never matter.

use super::Session;
use crate::completion::Completion;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SERIALIZED_NAMESPACES: &[&str] = &[
    "pool.dataset",
    "pool.snapshot",
    "zfs.dataset",
    "zfs.snapshot",
    "filesystem",
];

const MUTATING_VERBS: &[&str] = &[
    "create",
    "update",
    "delete",
    "destroy",
    "rename",
    "promote",
    "rollback",
    "clone",
    "hold",
    "release",
    "set_quota",
    "lock",
    "unlock",
    "setperm",
    "setacl",
    "chown",
    "mkdir",
    "put",
];

const DELETE_VERBS: &[&str] = &["delete", "destroy"];

/// Identity of the object a mutation touches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConflictKey {
    pub namespace: String,
    pub object: String,
}

/// In-flight mutation holding a [`ConflictKey`].
pub(super) struct PendingAction {
    pub call_id: u64,
    pub outcome: Arc<Completion<Value>>,
}

/// `pool.dataset.create` -> `("pool.dataset", "create")`
fn split_method(method: &str) -> Option<(&str, &str)> {
    method.rsplit_once('.')
}

fn serialized_verb(method: &str) -> Option<(&str, &str)> {
    let (namespace, verb) = split_method(method)?;
    (SERIALIZED_NAMESPACES.contains(&namespace) && MUTATING_VERBS.contains(&verb))
        .then_some((namespace, verb))
}

/// Whether `method` deletes something in a serialized namespace.
pub fn is_delete(method: &str) -> bool {
    serialized_verb(method).is_some_and(|(_, verb)| DELETE_VERBS.contains(&verb))
}

/// Conflict key for a call, or `None` if it needs no serialization.
pub fn signature(method: &str, params: &Value) -> Option<ConflictKey> {
    let (namespace, _) = serialized_verb(method)?;
    let first = match params {
        Value::Array(items) => items.first()?,
        other => other,
    };
    Some(ConflictKey {
        namespace: namespace.to_string(),
        object: object_identity(first)?,
    })
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Snapshot creation names the snapshot as `dataset@name`; everything else
/// identifies its target by id, name or path.
fn object_identity(param: &Value) -> Option<String> {
    if let Some(s) = scalar(param) {
        return Some(s);
    }
    let Value::Object(map) = param else {
        return None;
    };
    if let (Some(dataset), Some(name)) = (
        map.get("dataset").and_then(Value::as_str),
        map.get("name").and_then(Value::as_str),
    ) {
        return Some(format!("{}@{}", dataset, name));
    }
    ["id", "name", "path"]
        .iter()
        .find_map(|field| map.get(*field).and_then(scalar))
}

impl Session {
    /// Wait until no other live mutation holds `key`, then record this call
    /// as the holder. Check and insert happen under one lock.
    ///
    /// After `conflict_wait` the newcomer takes the record anyway. Returns
    /// false, without taking the record, if `abandoned` fires first.
    pub(super) async fn acquire_conflict_slot(
        &self,
        key: &ConflictKey,
        call_id: u64,
        outcome: &Arc<Completion<Value>>,
        abandoned: &CancellationToken,
    ) -> bool {
        let deadline = Instant::now() + self.config.conflict_wait;
        loop {
            let holder = {
                let mut tables = self.tables.lock();
                match tables.pending_actions.get(key) {
                    Some(p) if p.call_id != call_id && !p.outcome.is_done() => {
                        Some((p.call_id, p.outcome.clone()))
                    }
                    _ => {
                        tables.pending_actions.insert(
                            key.clone(),
                            PendingAction {
                                call_id,
                                outcome: outcome.clone(),
                            },
                        );
                        None
                    }
                }
            };
            let Some((holder_id, holder_outcome)) = holder else {
                return true;
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            debug!(
                call_id,
                holder = holder_id,
                object = %key.object,
                "Waiting for conflicting call"
            );
            let settled = tokio::select! {
                settled = holder_outcome.await_or_timeout(remaining) => settled.is_some(),
                _ = abandoned.cancelled() => return false,
            };
            if !settled {
                if self.is_closed() {
                    return true;
                }
                warn!(
                    call_id,
                    holder = holder_id,
                    object = %key.object,
                    "Conflicting call still running, proceeding anyway"
                );
                self.tables.lock().pending_actions.insert(
                    key.clone(),
                    PendingAction {
                        call_id,
                        outcome: outcome.clone(),
                    },
                );
                return true;
            }
        }
    }

    /// Remove the record for `key` if this call still owns it.
    pub(super) fn release_conflict_slot(&self, key: &ConflictKey, call_id: u64) {
        let mut tables = self.tables.lock();
        if tables
            .pending_actions
            .get(key)
            .is_some_and(|p| p.call_id == call_id)
        {
            tables.pending_actions.remove(key);
        }
    }
}
