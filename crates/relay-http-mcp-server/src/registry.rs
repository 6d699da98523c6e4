//! Session registry
//!
//! Maps each open SSE connection's session id to the sending half of its
//! upstream queue. Entries exist only while the connection is open. The lock
//! is synchronous and is never held across an await: callers clone the sink
//! out and release the lock before sending.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::engine::UpstreamItem;
use crate::handoff::HandoffSender;

/// Sending half of a session's upstream queue
pub type UpstreamSink = HandoffSender<UpstreamItem>;

/// Live session id → upstream sink map, shared by all request tasks
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sinks: Arc<RwLock<HashMap<String, UpstreamSink>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink, returning the one it replaced
    pub fn insert(&self, session_id: impl Into<String>, sink: UpstreamSink) -> Option<UpstreamSink> {
        let session_id = session_id.into();
        debug!("Registering session {}", session_id);
        self.sinks.write().insert(session_id, sink)
    }

    /// Clone of the sink registered for `session_id`
    pub fn sink(&self, session_id: &str) -> Option<UpstreamSink> {
        self.sinks.read().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<UpstreamSink> {
        self.sinks.write().remove(session_id)
    }

    /// Remove the entry only if it still points at `sink`
    ///
    /// A connection tearing down must not remove an entry that a newer
    /// connection registered under the same id.
    pub fn remove_if_same(&self, session_id: &str, sink: &UpstreamSink) -> bool {
        let mut sinks = self.sinks.write();
        match sinks.get(session_id) {
            Some(current) if current.same_channel(sink) => {
                sinks.remove(session_id);
                debug!("Unregistered session {}", session_id);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sinks.read().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.read().is_empty()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sinks.read().keys().cloned().collect()
    }
}
