//! # Session Storage Prelude
//!
//! ```rust
//! use relay_mcp_session_storage::prelude::*;
//! ```

// Core trait and types
pub use crate::traits::{
    BoxedSessionStore, CredentialRecord, SessionRecord, SessionStore, SessionStoreError,
    SessionStoreResult,
};

// In-memory implementation (always available)
pub use crate::in_memory::{InMemoryConfig, InMemoryError, InMemorySessionStore};

#[cfg(feature = "sqlite")]
pub use crate::sqlite::{SqliteConfig, SqliteError, SqliteSessionStore};

// Convenience functions
pub use crate::{create_default_store, create_memory_store};

#[cfg(feature = "sqlite")]
pub use crate::create_sqlite_store;
