//! # Credential-Keyed Session Storage
//!
//! **Persisted session-to-credential association for Relay MCP servers.**
//!
//! Provides the [`SessionStore`] trait with an in-memory backend and an
//! optional SQLite backend. Every backend enforces the same policy: a
//! credential holds at most `max_sessions_per_credential` sessions, and the
//! least recently accessed session is evicted to make room for a new one.
//!
//! ## Installation
//!
//! ```toml
//! [dependencies]
//! relay-mcp-session-storage = "0.1"
//!
//! # SQLite persistence
//! relay-mcp-session-storage = { version = "0.1", features = ["sqlite"] }
//! ```

// Core trait and types
mod traits;
/// Core session store trait, records and helpers
pub use traits::*;

// Implementations
pub mod in_memory;
pub mod prelude;

#[cfg(feature = "sqlite")]
pub mod sqlite;

// Re-export for convenience
/// In-memory session store for development and testing
pub use in_memory::{InMemoryConfig, InMemoryError, InMemorySessionStore};

#[cfg(feature = "sqlite")]
/// SQLite-backed session store for file-based persistence
pub use sqlite::{SqliteConfig, SqliteError, SqliteSessionStore};

/// Create a default in-memory session store
pub fn create_default_store() -> InMemorySessionStore {
    InMemorySessionStore::new()
}

/// Create an in-memory session store with a custom session cap
pub fn create_memory_store(config: InMemoryConfig) -> InMemorySessionStore {
    InMemorySessionStore::with_config(config)
}

/// Create a SQLite session store with custom database path and pool settings
#[cfg(feature = "sqlite")]
pub async fn create_sqlite_store(config: SqliteConfig) -> Result<SqliteSessionStore, SqliteError> {
    SqliteSessionStore::with_config(config).await
}
