//! In-Memory Session Store Implementation
//!
//! Credentials and sessions live in one map pair behind a single
//! `Arc<RwLock<>>`, so every operation sees a consistent view of both.
//! Suitable for:
//! - Development and testing
//! - Single-instance deployments where losing sessions on restart is fine

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    CredentialRecord, DEFAULT_MAX_SESSIONS_PER_CREDENTIAL, SessionRecord, SessionStore,
    SessionStoreError, mask_credential, now_millis,
};

/// Configuration for the in-memory session store
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// Maximum live sessions per credential (at least 1)
    pub max_sessions_per_credential: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_credential: DEFAULT_MAX_SESSIONS_PER_CREDENTIAL,
        }
    }
}

/// Error type for in-memory store operations
#[derive(Debug, thiserror::Error)]
pub enum InMemoryError {
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),
    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),
}

#[derive(Debug, Clone)]
struct StoredSession {
    record: SessionRecord,
    /// Insertion order, breaks LRU ties
    seq: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    credentials: HashMap<String, CredentialRecord>,
    sessions: HashMap<String, StoredSession>,
    next_seq: u64,
}

impl StoreState {
    fn touch_credential(&mut self, credential: &str, now: u64) -> CredentialRecord {
        let record = self
            .credentials
            .entry(credential.to_string())
            .and_modify(|record| record.last_used_at = now)
            .or_insert_with(|| {
                info!("Registering new credential: {}", mask_credential(credential));
                CredentialRecord {
                    credential: credential.to_string(),
                    created_at: now,
                    last_used_at: now,
                }
            });
        record.clone()
    }

    fn sessions_of<'a>(&'a self, credential: &'a str) -> impl Iterator<Item = &'a StoredSession> {
        self.sessions
            .values()
            .filter(move |stored| stored.record.credential == credential)
    }

    fn lru_victim(&self, credential: &str) -> Option<String> {
        self.sessions_of(credential)
            .min_by_key(|stored| (stored.record.last_accessed_at, stored.seq))
            .map(|stored| stored.record.session_id.clone())
    }
}

/// In-memory credential-keyed session store
#[derive(Debug, Clone)]
pub struct InMemorySessionStore {
    state: Arc<RwLock<StoreState>>,
    config: InMemoryConfig,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySessionStore {
    /// Create new in-memory session store with default configuration
    pub fn new() -> Self {
        Self::with_config(InMemoryConfig::default())
    }

    /// Create new in-memory session store with custom configuration
    pub fn with_config(config: InMemoryConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            config: InMemoryConfig {
                max_sessions_per_credential: config.max_sessions_per_credential.max(1),
            },
        }
    }

    /// Number of known credentials
    pub async fn credential_count(&self) -> usize {
        self.state.read().await.credentials.len()
    }
}

fn require_credential(credential: &str) -> Result<(), InMemoryError> {
    if credential.is_empty() {
        return Err(InMemoryError::InvalidCredential(
            "credential must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    type Error = SessionStoreError;

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }

    fn max_sessions_per_credential(&self) -> usize {
        self.config.max_sessions_per_credential
    }

    async fn get_or_create_credential(
        &self,
        credential: &str,
    ) -> Result<CredentialRecord, Self::Error> {
        require_credential(credential)?;
        let mut state = self.state.write().await;
        Ok(state.touch_credential(credential, now_millis()))
    }

    async fn delete_credential(&self, credential: &str) -> Result<bool, Self::Error> {
        let mut state = self.state.write().await;
        if state.credentials.remove(credential).is_none() {
            return Ok(false);
        }

        let before = state.sessions.len();
        state
            .sessions
            .retain(|_, stored| stored.record.credential != credential);
        debug!(
            "Deleted credential {} and {} session(s)",
            mask_credential(credential),
            before - state.sessions.len()
        );
        Ok(true)
    }

    async fn create_session(
        &self,
        credential: &str,
        session_id: &str,
    ) -> Result<SessionRecord, Self::Error> {
        require_credential(credential)?;
        if session_id.is_empty() {
            return Err(InMemoryError::InvalidSessionId(session_id.to_string()).into());
        }

        let mut state = self.state.write().await;
        let now = now_millis();
        state.touch_credential(credential, now);

        if let Some(existing) = state.sessions.get_mut(session_id) {
            warn!(
                "Session {} already exists, re-associating with credential {}",
                session_id,
                mask_credential(credential)
            );
            existing.record.credential = credential.to_string();
            existing.record.last_accessed_at = now;
            return Ok(existing.record.clone());
        }

        let cap = self.config.max_sessions_per_credential;
        while state.sessions_of(credential).count() >= cap {
            let Some(victim) = state.lru_victim(credential) else {
                break;
            };
            state.sessions.remove(&victim);
            info!(
                "Credential {} reached {} sessions, evicted least recently used session {}",
                mask_credential(credential),
                cap,
                victim
            );
        }

        let record = SessionRecord {
            session_id: session_id.to_string(),
            credential: credential.to_string(),
            created_at: now,
            last_accessed_at: now,
        };
        let seq = state.next_seq;
        state.next_seq += 1;
        state.sessions.insert(
            session_id.to_string(),
            StoredSession {
                record: record.clone(),
                seq,
            },
        );

        debug!("Created session: {}", session_id);
        Ok(record)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, Self::Error> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .get(session_id)
            .map(|stored| stored.record.clone()))
    }

    async fn get_credential_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<String>, Self::Error> {
        let mut state = self.state.write().await;
        let now = now_millis();

        let Some(stored) = state.sessions.get_mut(session_id) else {
            return Ok(None);
        };
        stored.record.last_accessed_at = now;
        let credential = stored.record.credential.clone();

        if let Some(record) = state.credentials.get_mut(&credential) {
            record.last_used_at = now;
        }
        Ok(Some(credential))
    }

    async fn list_sessions_by_credential(
        &self,
        credential: &str,
    ) -> Result<Vec<SessionRecord>, Self::Error> {
        let state = self.state.read().await;
        let mut sessions: Vec<&StoredSession> = state.sessions_of(credential).collect();
        sessions.sort_by(|a, b| {
            (b.record.last_accessed_at, b.seq).cmp(&(a.record.last_accessed_at, a.seq))
        });
        Ok(sessions
            .into_iter()
            .map(|stored| stored.record.clone())
            .collect())
    }

    async fn update_access_time(&self, session_id: &str) -> Result<bool, Self::Error> {
        Ok(self.get_credential_by_session(session_id).await?.is_some())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, Self::Error> {
        let mut state = self.state.write().await;
        Ok(state.sessions.remove(session_id).is_some())
    }

    async fn session_count(&self) -> Result<usize, Self::Error> {
        Ok(self.state.read().await.sessions.len())
    }
}
