//! Session Store Trait and Records
//!
//! A session store persists which credential opened which session. It is the
//! authority on the per-credential session cap: creating a session for a
//! credential that already holds the maximum number of sessions evicts the
//! least recently accessed one first.
//!
//! Backends:
//! - InMemory: development, tests, single-process deployments
//! - SQLite: single-instance deployments that survive restarts

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default number of live sessions a single credential may hold
pub const DEFAULT_MAX_SESSIONS_PER_CREDENTIAL: usize = 5;

/// Current time as Unix millis
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Generate a fresh session id: 128 random bits as 32 lowercase hex chars
pub fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Whether `candidate` has the shape of a generated session id
pub fn is_valid_session_id(candidate: &str) -> bool {
    candidate.len() == 32
        && candidate
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Mask a credential for display: first and last four characters kept,
/// anything shorter than eight characters hidden entirely
pub fn mask_credential(credential: &str) -> String {
    let chars: Vec<char> = credential.chars().collect();
    if chars.len() < 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 8), tail)
}

/// A persisted session and the credential it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub credential: String,
    /// Creation timestamp (Unix millis)
    pub created_at: u64,
    /// Last access timestamp (Unix millis), drives LRU eviction
    pub last_accessed_at: u64,
}

/// A credential seen by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub credential: String,
    pub created_at: u64,
    pub last_used_at: u64,
}

/// Core trait for session store backends
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Error type for store operations
    type Error: std::error::Error + Send + Sync + 'static;

    /// Get the backend name for logging and debugging
    fn backend_name(&self) -> &'static str;

    /// Maximum live sessions per credential enforced by `create_session`
    fn max_sessions_per_credential(&self) -> usize;

    // ============================================================================
    // Credentials
    // ============================================================================

    /// Fetch the credential record, creating it on first sight; an existing
    /// record has its `last_used_at` refreshed
    async fn get_or_create_credential(&self, credential: &str)
    -> Result<CredentialRecord, Self::Error>;

    /// Delete a credential and, with it, every session it owns
    async fn delete_credential(&self, credential: &str) -> Result<bool, Self::Error>;

    // ============================================================================
    // Sessions
    // ============================================================================

    /// Associate `session_id` with `credential`
    ///
    /// An existing record with the same id is re-pointed at `credential` and
    /// touched. Otherwise, while the credential holds `max_sessions_per_credential`
    /// or more sessions, the least recently accessed one is deleted (ties go
    /// to the oldest insert) before the new record is inserted.
    ///
    /// Eviction and insert are separate writes; a crash in between leaves the
    /// credential below its cap, never above it.
    async fn create_session(
        &self,
        credential: &str,
        session_id: &str,
    ) -> Result<SessionRecord, Self::Error>;

    /// Look up a session without touching it
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, Self::Error>;

    /// Resolve the credential owning `session_id`
    ///
    /// A hit refreshes both the session's and the credential's access time.
    async fn get_credential_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<String>, Self::Error>;

    /// All sessions of a credential, most recently accessed first
    async fn list_sessions_by_credential(
        &self,
        credential: &str,
    ) -> Result<Vec<SessionRecord>, Self::Error>;

    /// Refresh a session's access time; `false` if it does not exist
    async fn update_access_time(&self, session_id: &str) -> Result<bool, Self::Error>;

    /// Delete a session; `false` if it did not exist
    async fn delete_session(&self, session_id: &str) -> Result<bool, Self::Error>;

    /// Total number of stored sessions
    async fn session_count(&self) -> Result<usize, Self::Error>;
}

/// Convenience type alias for store results
pub type SessionStoreResult<T> = std::result::Result<T, SessionStoreError>;

/// Errors surfaced by any session store backend
#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Invalid session data: {0}")]
    InvalidData(String),

    #[error("Generic storage error: {0}")]
    Generic(String),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for SessionStoreError {
    fn from(err: sqlx::Error) -> Self {
        SessionStoreError::DatabaseError(err.to_string())
    }
}

impl From<crate::in_memory::InMemoryError> for SessionStoreError {
    fn from(err: crate::in_memory::InMemoryError) -> Self {
        match err {
            crate::in_memory::InMemoryError::InvalidCredential(reason) => {
                SessionStoreError::InvalidData(reason)
            }
            crate::in_memory::InMemoryError::InvalidSessionId(id) => {
                SessionStoreError::InvalidData(format!("invalid session id: {}", id))
            }
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<crate::sqlite::SqliteError> for SessionStoreError {
    fn from(err: crate::sqlite::SqliteError) -> Self {
        match err {
            crate::sqlite::SqliteError::Database(e) => SessionStoreError::DatabaseError(e.to_string()),
            crate::sqlite::SqliteError::Connection(e) => SessionStoreError::ConnectionError(e),
            crate::sqlite::SqliteError::Migration(e) => SessionStoreError::MigrationError(e),
            crate::sqlite::SqliteError::InvalidData(e) => SessionStoreError::InvalidData(e),
        }
    }
}

/// Type-erased session store shared across connection handlers
pub type BoxedSessionStore = dyn SessionStore<Error = SessionStoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_id_shape() {
        let id = new_session_id();
        assert_eq!(id.len(), 32);
        assert!(is_valid_session_id(&id));
        assert_ne!(id, new_session_id());
    }

    #[test]
    fn test_session_id_validation() {
        assert!(is_valid_session_id("0123456789abcdef0123456789abcdef"));
        assert!(!is_valid_session_id("0123456789ABCDEF0123456789ABCDEF"));
        assert!(!is_valid_session_id("0123456789abcdef"));
        assert!(!is_valid_session_id("0123456789abcdef0123456789abcdeg"));
        assert!(!is_valid_session_id(""));
    }

    #[test]
    fn test_mask_credential() {
        assert_eq!(mask_credential("sa_tools_abcd1234"), "sa_t*********1234");
        assert_eq!(mask_credential("abcdefgh"), "abcdefgh");
        assert_eq!(mask_credential("abcdefg"), "***");
        assert_eq!(mask_credential(""), "***");
    }
}
