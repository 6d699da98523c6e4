//! SQLite Session Store Implementation
//!
//! Persistent backend for single-instance deployments. Two tables:
//! `credentials` owns `sessions` through a foreign key with
//! `ON DELETE CASCADE`. Most operations are self-contained statements
//! against the pool; session creation runs as one `BEGIN IMMEDIATE`
//! transaction so concurrent creates cannot overshoot the cap.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    CredentialRecord, DEFAULT_MAX_SESSIONS_PER_CREDENTIAL, SessionRecord, SessionStore,
    SessionStoreError, mask_credential, now_millis,
};

/// SQLite-specific error types
#[derive(Error, Debug)]
pub enum SqliteError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Configuration for SQLite session storage
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database file path, or `:memory:`
    pub database_path: PathBuf,
    /// Maximum number of database connections in the pool
    pub max_connections: u32,
    /// Connection acquire timeout in seconds
    pub connection_timeout_secs: u64,
    /// Maximum live sessions per credential (at least 1)
    pub max_sessions_per_credential: usize,
    /// Allow table creation if tables don't exist
    pub create_tables_if_missing: bool,
    /// Create database file if it doesn't exist
    pub create_database_if_missing: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("sessions.db"),
            max_connections: 10,
            connection_timeout_secs: 30,
            max_sessions_per_credential: DEFAULT_MAX_SESSIONS_PER_CREDENTIAL,
            create_tables_if_missing: true,
            create_database_if_missing: true,
        }
    }
}

impl SqliteConfig {
    /// Build a config from a `sqlite:` URL
    ///
    /// `sqlite:///./sessions.db` and `sqlite://sessions.db` name relative
    /// files, `sqlite:////var/lib/sessions.db` an absolute one. A value
    /// without the scheme is taken as a plain path.
    pub fn from_database_url(url: &str) -> Self {
        let path = url
            .strip_prefix("sqlite:///")
            .or_else(|| url.strip_prefix("sqlite://"))
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);

        Self {
            database_path: PathBuf::from(path),
            ..Self::default()
        }
    }

    /// Whether the database lives only as long as its connection
    pub fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == ":memory:"
    }
}

/// SQLite-backed credential-keyed session store
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
    config: SqliteConfig,
}

impl SqliteSessionStore {
    /// Create new SQLite session store with default configuration
    pub async fn new() -> Result<Self, SqliteError> {
        Self::with_config(SqliteConfig::default()).await
    }

    /// Create SQLite session store with custom configuration
    pub async fn with_config(mut config: SqliteConfig) -> Result<Self, SqliteError> {
        info!("Initializing SQLite session store at {:?}", config.database_path);
        config.max_sessions_per_credential = config.max_sessions_per_credential.max(1);

        // Ensure parent directory exists
        if !config.is_in_memory() {
            if let Some(parent) = config.database_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SqliteError::Connection(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        let connect_options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(config.create_database_if_missing)
            .busy_timeout(Duration::from_secs(config.connection_timeout_secs))
            .foreign_keys(true);

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(config.connection_timeout_secs));
        if config.is_in_memory() {
            // Every connection to :memory: is its own database
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options.connect_with(connect_options).await?;
        let store = Self { pool, config };

        if store.config.create_tables_if_missing {
            store.migrate().await?;
        }

        info!("SQLite session store initialized successfully");
        Ok(store)
    }

    /// Run database schema migrations
    async fn migrate(&self) -> Result<(), SqliteError> {
        debug!("Running database migrations");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                credential TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL,
                last_used_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                credential_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                last_accessed_at INTEGER NOT NULL,
                FOREIGN KEY (credential_id) REFERENCES credentials (id) ON DELETE CASCADE
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_sessions_credential_id ON sessions (credential_id)",
            "CREATE INDEX IF NOT EXISTS idx_sessions_last_accessed_at ON sessions (last_accessed_at)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| SqliteError::Migration(e.to_string()))?;
        }

        debug!("Database migrations completed");
        Ok(())
    }

    /// Insert or refresh a credential, returning its row id and record
    async fn upsert_credential(
        conn: &mut SqliteConnection,
        credential: &str,
        now: u64,
    ) -> Result<(i64, CredentialRecord), SqliteError> {
        if credential.is_empty() {
            return Err(SqliteError::InvalidData(
                "credential must not be empty".to_string(),
            ));
        }

        let row = sqlx::query(
            r#"
            INSERT INTO credentials (credential, created_at, last_used_at)
            VALUES (?, ?, ?)
            ON CONFLICT (credential) DO UPDATE SET last_used_at = excluded.last_used_at
            RETURNING id, credential, created_at, last_used_at
            "#,
        )
        .bind(credential)
        .bind(now as i64)
        .bind(now as i64)
        .fetch_one(&mut *conn)
        .await?;

        let record = CredentialRecord {
            credential: row.try_get("credential")?,
            created_at: row.try_get::<i64, _>("created_at")? as u64,
            last_used_at: row.try_get::<i64, _>("last_used_at")? as u64,
        };
        Ok((row.try_get("id")?, record))
    }

    /// Touch a session and its credential, returning the credential
    async fn touch_session(&self, session_id: &str, now: u64) -> Result<Option<String>, SqliteError> {
        let Some(row) = sqlx::query(
            "UPDATE sessions SET last_accessed_at = ? WHERE session_id = ? RETURNING credential_id",
        )
        .bind(now as i64)
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };
        let credential_id: i64 = row.try_get("credential_id")?;

        let credential = sqlx::query(
            "UPDATE credentials SET last_used_at = ? WHERE id = ? RETURNING credential",
        )
        .bind(now as i64)
        .bind(credential_id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row.try_get::<String, _>("credential"))
        .transpose()?;

        Ok(credential)
    }

    /// Body of `create_session`; runs inside the caller's write transaction
    async fn create_session_locked(
        &self,
        conn: &mut SqliteConnection,
        credential: &str,
        session_id: &str,
    ) -> Result<SessionRecord, SqliteError> {
        let now = now_millis();
        let (credential_id, _) = Self::upsert_credential(conn, credential, now).await?;

        let existing = sqlx::query(
            r#"
            UPDATE sessions SET credential_id = ?, last_accessed_at = ?
            WHERE session_id = ?
            RETURNING created_at
            "#,
        )
        .bind(credential_id)
        .bind(now as i64)
        .bind(session_id)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(row) = existing {
            warn!(
                "Session {} already exists, re-associating with credential {}",
                session_id,
                mask_credential(credential)
            );
            return Ok(SessionRecord {
                session_id: session_id.to_string(),
                credential: credential.to_string(),
                created_at: row.try_get::<i64, _>("created_at")? as u64,
                last_accessed_at: now,
            });
        }

        self.evict_to_cap(conn, credential, credential_id).await?;

        sqlx::query(
            "INSERT INTO sessions (session_id, credential_id, created_at, last_accessed_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(credential_id)
        .bind(now as i64)
        .bind(now as i64)
        .execute(&mut *conn)
        .await?;

        Ok(SessionRecord {
            session_id: session_id.to_string(),
            credential: credential.to_string(),
            created_at: now,
            last_accessed_at: now,
        })
    }

    async fn evict_to_cap(
        &self,
        conn: &mut SqliteConnection,
        credential: &str,
        credential_id: i64,
    ) -> Result<(), SqliteError> {
        let cap = self.config.max_sessions_per_credential as i64;

        loop {
            let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM sessions WHERE credential_id = ?")
                .bind(credential_id)
                .fetch_one(&mut *conn)
                .await?
                .try_get("count")?;
            if count < cap {
                return Ok(());
            }

            let victim = sqlx::query(
                r#"
                SELECT session_id FROM sessions
                WHERE credential_id = ?
                ORDER BY last_accessed_at ASC, rowid ASC
                LIMIT 1
                "#,
            )
            .bind(credential_id)
            .fetch_optional(&mut *conn)
            .await?;
            let Some(victim) = victim else {
                return Ok(());
            };
            let victim: String = victim.try_get("session_id")?;

            sqlx::query("DELETE FROM sessions WHERE session_id = ?")
                .bind(&victim)
                .execute(&mut *conn)
                .await?;
            info!(
                "Credential {} reached {} sessions, evicted least recently used session {}",
                mask_credential(credential),
                cap,
                victim
            );
        }
    }
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRecord, sqlx::Error> {
    Ok(SessionRecord {
        session_id: row.try_get("session_id")?,
        credential: row.try_get("credential")?,
        created_at: row.try_get::<i64, _>("created_at")? as u64,
        last_accessed_at: row.try_get::<i64, _>("last_accessed_at")? as u64,
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    type Error = SessionStoreError;

    fn backend_name(&self) -> &'static str {
        "SQLite"
    }

    fn max_sessions_per_credential(&self) -> usize {
        self.config.max_sessions_per_credential
    }

    async fn get_or_create_credential(
        &self,
        credential: &str,
    ) -> Result<CredentialRecord, Self::Error> {
        let mut conn = self.pool.acquire().await?;
        let (_, record) = Self::upsert_credential(&mut conn, credential, now_millis()).await?;
        Ok(record)
    }

    async fn delete_credential(&self, credential: &str) -> Result<bool, Self::Error> {
        let result = sqlx::query("DELETE FROM credentials WHERE credential = ?")
            .bind(credential)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_session(
        &self,
        credential: &str,
        session_id: &str,
    ) -> Result<SessionRecord, Self::Error> {
        if session_id.is_empty() {
            return Err(SqliteError::InvalidData("session id must not be empty".to_string()).into());
        }

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await?;

        match self.create_session_locked(&mut conn, credential, session_id).await {
            Ok(record) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await?;
                debug!("Created session: {}", session_id);
                Ok(record)
            }
            Err(e) => {
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    warn!("Rollback after failed session create: {}", rollback);
                }
                Err(e.into())
            }
        }
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, Self::Error> {
        let row = sqlx::query(
            r#"
            SELECT s.session_id, c.credential, s.created_at, s.last_accessed_at
            FROM sessions s JOIN credentials c ON c.id = s.credential_id
            WHERE s.session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(session_from_row).transpose()?)
    }

    async fn get_credential_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<String>, Self::Error> {
        Ok(self.touch_session(session_id, now_millis()).await?)
    }

    async fn list_sessions_by_credential(
        &self,
        credential: &str,
    ) -> Result<Vec<SessionRecord>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT s.session_id, c.credential, s.created_at, s.last_accessed_at
            FROM sessions s JOIN credentials c ON c.id = s.credential_id
            WHERE c.credential = ?
            ORDER BY s.last_accessed_at DESC, s.rowid DESC
            "#,
        )
        .bind(credential)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(session_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn update_access_time(&self, session_id: &str) -> Result<bool, Self::Error> {
        Ok(self.touch_session(session_id, now_millis()).await?.is_some())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, Self::Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn session_count(&self) -> Result<usize, Self::Error> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM sessions")
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const KEY: &str = "sa_tools_abcd1234";

    async fn create_test_store() -> SqliteSessionStore {
        let config = SqliteConfig {
            database_path: ":memory:".into(),
            ..SqliteConfig::default()
        };
        SqliteSessionStore::with_config(config).await.unwrap()
    }

    async fn tick() {
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    #[test]
    fn test_database_url_parsing() {
        assert_eq!(
            SqliteConfig::from_database_url("sqlite:///./sessions.db").database_path,
            PathBuf::from("./sessions.db")
        );
        assert_eq!(
            SqliteConfig::from_database_url("sqlite:////var/lib/relay/sessions.db").database_path,
            PathBuf::from("/var/lib/relay/sessions.db")
        );
        assert_eq!(
            SqliteConfig::from_database_url("sqlite::memory:").database_path,
            PathBuf::from(":memory:")
        );
        assert_eq!(
            SqliteConfig::from_database_url("data/sessions.db").database_path,
            PathBuf::from("data/sessions.db")
        );
        assert!(SqliteConfig::from_database_url("sqlite::memory:").is_in_memory());
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store = create_test_store().await;

        let created = store.create_session(KEY, "s1").await.unwrap();
        let retrieved = store.get_session("s1").await.unwrap();
        assert_eq!(retrieved, Some(created));

        assert!(store.delete_session("s1").await.unwrap());
        assert!(!store.delete_session("s1").await.unwrap());
        assert!(store.get_session("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sixth_session_evicts_least_recently_used() {
        let store = create_test_store().await;
        for i in 1..=5 {
            store.create_session(KEY, &format!("s{}", i)).await.unwrap();
            tick().await;
        }
        assert!(store.update_access_time("s1").await.unwrap());
        tick().await;

        store.create_session(KEY, "s6").await.unwrap();

        let ids: Vec<String> = store
            .list_sessions_by_credential(KEY)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids, vec!["s6", "s1", "s5", "s4", "s3"]);
        assert_eq!(store.session_count().await.unwrap(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_respect_cap_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteSessionStore::with_config(SqliteConfig {
            database_path: dir.path().join("sessions.db"),
            max_connections: 4,
            ..SqliteConfig::default()
        })
        .await
        .unwrap();

        let handles: Vec<_> = (0..12)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.create_session(KEY, &format!("c{}", i)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let sessions = store.list_sessions_by_credential(KEY).await.unwrap();
        assert_eq!(sessions.len(), DEFAULT_MAX_SESSIONS_PER_CREDENTIAL);
        assert_eq!(store.session_count().await.unwrap(), DEFAULT_MAX_SESSIONS_PER_CREDENTIAL);
    }

    #[tokio::test]
    async fn test_reassociation_keeps_single_record() {
        let store = create_test_store().await;
        store.create_session("key_old_0000", "s1").await.unwrap();
        let moved = store.create_session("key_new_0000", "s1").await.unwrap();

        assert_eq!(moved.credential, "key_new_0000");
        assert_eq!(store.session_count().await.unwrap(), 1);
        assert_eq!(
            store.get_credential_by_session("s1").await.unwrap(),
            Some("key_new_0000".to_string())
        );
    }

    #[tokio::test]
    async fn test_credential_lookup_touches_records() {
        let store = create_test_store().await;
        let created = store.create_session(KEY, "s1").await.unwrap();
        let before = store.get_or_create_credential(KEY).await.unwrap();
        tick().await;

        assert_eq!(
            store.get_credential_by_session("s1").await.unwrap(),
            Some(KEY.to_string())
        );
        assert_eq!(store.get_credential_by_session("missing").await.unwrap(), None);

        let session = store.get_session("s1").await.unwrap().unwrap();
        assert!(session.last_accessed_at > created.last_accessed_at);

        let after = store.get_or_create_credential(KEY).await.unwrap();
        assert_eq!(after.created_at, before.created_at);
        assert!(after.last_used_at > before.last_used_at);
    }

    #[tokio::test]
    async fn test_delete_credential_cascades_to_sessions() {
        let store = create_test_store().await;
        store.create_session(KEY, "s1").await.unwrap();
        store.create_session(KEY, "s2").await.unwrap();
        store.create_session("other_key_00", "s3").await.unwrap();

        assert!(store.delete_credential(KEY).await.unwrap());
        assert!(!store.delete_credential(KEY).await.unwrap());

        assert_eq!(store.session_count().await.unwrap(), 1);
        assert!(store.get_session("s1").await.unwrap().is_none());
        assert!(store.get_session("s3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_empty_credential_writes_nothing() {
        let store = create_test_store().await;
        let err = store.create_session("", "s1").await.unwrap_err();
        assert!(matches!(err, SessionStoreError::InvalidData(_)));
        assert_eq!(store.session_count().await.unwrap(), 0);
    }
}
