//! Process-wide session cache.
//!
//! One live [`Session`] per [`SessionKey`]. Concurrent first requests for a
//! key share a single creation attempt; a failed attempt is forgotten so the
//! next request may try again.

use crate::completion::Completion;
use crate::error::CallError;
use crate::session::{Session, SessionConfig, SessionStats};
use crate::transport::Connector;
use nasctl_protocol::SessionKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

type Slot = Arc<Completion<Arc<Session>>>;

pub struct SessionRegistry {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    sessions: Mutex<HashMap<SessionKey, Slot>>,
    closing: AtomicBool,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            connector,
            config,
            sessions: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
        })
    }

    /// Cached session for `key`, creating it if needed.
    pub async fn get_or_create(self: &Arc<Self>, key: &SessionKey) -> Result<Arc<Session>, CallError> {
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return Err(CallError::SessionClosed);
            }

            let (slot, creator) = {
                let mut sessions = self.sessions.lock();
                match sessions.get(key) {
                    Some(slot) => (slot.clone(), false),
                    None => {
                        let slot: Slot = Arc::new(Completion::new());
                        sessions.insert(key.clone(), slot.clone());
                        (slot, true)
                    }
                }
            };

            if creator {
                self.spawn_creation(key.clone(), slot.clone());
            }

            let session = slot.get().await?;
            if !session.is_closed() {
                return Ok(session);
            }
            // Closed but not yet evicted; drop it and start over.
            self.remove_slot(key, &slot);
        }
    }

    /// Establish in a separate task so a caller giving up cannot abandon the
    /// attempt other callers are waiting on.
    fn spawn_creation(self: &Arc<Self>, key: SessionKey, slot: Slot) {
        let registry = self.clone();
        tokio::spawn(async move {
            debug!(server = %key.server, "Creating session");
            match Session::establish(
                key.clone(),
                registry.connector.as_ref(),
                registry.config.clone(),
            )
            .await
            {
                Ok(session) => {
                    registry.watch_session(key, slot.clone(), session.clone());
                    slot.complete(session);
                }
                Err(e) => {
                    warn!(server = %key.server, error = %e, "Session creation failed");
                    registry.remove_slot(&key, &slot);
                    slot.fail(e);
                }
            }
        });
    }

    /// Evict the session from the cache once it closes.
    fn watch_session(self: &Arc<Self>, key: SessionKey, slot: Slot, session: Arc<Session>) {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            session.closed().await;
            if let Some(registry) = registry.upgrade() {
                debug!(server = %key.server, "Evicting closed session");
                registry.remove_slot(&key, &slot);
            }
        });
    }

    /// Remove the entry for `key` only if it is still `slot`.
    fn remove_slot(&self, key: &SessionKey, slot: &Slot) {
        let mut sessions = self.sessions.lock();
        if sessions.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            sessions.remove(key);
        }
    }

    fn live_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .values()
            .filter_map(|slot| slot.peek().and_then(Result::ok))
            .collect()
    }

    pub fn status(&self) -> Vec<SessionStats> {
        self.live_sessions().iter().map(|s| s.stats()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every live session and refuse new ones.
    pub async fn close_all(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let sessions = self.live_sessions();
        info!(count = sessions.len(), "Closing sessions");
        for session in sessions {
            session.close().await;
        }
        self.sessions.lock().clear();
    }
}
