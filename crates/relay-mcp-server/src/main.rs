//! # Relay MCP Server
//!
//! Serves the session tool engine over HTTP+SSE. Every option can come from
//! the command line or the environment, and a `.env` file is read first.
//!
//! ## Usage
//! ```bash
//! # In-memory sessions, default account service
//! cargo run --package relay-mcp-server
//!
//! # SQLite sessions on a custom port
//! DATABASE_URL=sqlite:///./sessions.db PORT=8010 cargo run --package relay-mcp-server
//! ```
//!
//! **SSE connection:**
//! ```bash
//! curl -N http://127.0.0.1:8000/sa_tools_abcd1234/sse
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay_http_mcp_server::verifier::{DEFAULT_API_URL, DEFAULT_KEY_PREFIX};
use relay_http_mcp_server::{HttpCredentialVerifier, HttpMcpServer, VerifierConfig};
use relay_mcp_server::SessionToolEngine;
use relay_mcp_session_storage::{BoxedSessionStore, InMemoryConfig, InMemorySessionStore};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 8000)]
    port: u16,

    /// Account service base URL used to verify API keys
    #[arg(long, env = "API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Prefix every API key must carry
    #[arg(long, env = "API_KEY_PREFIX", default_value = DEFAULT_KEY_PREFIX)]
    api_key_prefix: String,

    /// Session database, e.g. `sqlite:///./sessions.db`; in-memory when unset
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Sessions kept per API key before the least recently used is evicted
    #[arg(long, env = "MAX_SESSIONS_PER_KEY", default_value_t = 5)]
    max_sessions_per_key: usize,

    /// Path accepting client messages
    #[arg(long, env = "MESSAGES_PATH", default_value = "/messages")]
    messages_path: String,

    /// Seconds between SSE keep-alive comments; 0 disables them
    #[arg(long, env = "KEEPALIVE_SECS", default_value_t = 30)]
    keepalive_secs: u64,

    /// Timeout in seconds for API key verification
    #[arg(long, env = "VERIFY_TIMEOUT_SECS", default_value_t = 10)]
    verify_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let bind_address = SocketAddr::new(args.host, args.port);

    let store = build_store(&args).await?;
    let verifier = HttpCredentialVerifier::new(VerifierConfig {
        api_url: args.api_url.clone(),
        key_prefix: args.api_key_prefix.clone(),
        timeout: Duration::from_secs(args.verify_timeout_secs),
    })
    .context("invalid API key verifier configuration")?;

    info!("Verifying API keys against {}", verifier.endpoint());

    let server = HttpMcpServer::builder_with_store(store)
        .bind_address(bind_address)
        .messages_path(args.messages_path.clone())
        .keepalive_interval(Duration::from_secs(args.keepalive_secs))
        .verifier(Arc::new(verifier))
        .engine(Arc::new(SessionToolEngine::new()))
        .build()?;

    info!("Relay MCP server starting on http://{}", bind_address);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

async fn build_store(args: &Args) -> Result<Arc<BoxedSessionStore>> {
    match args.database_url.as_deref() {
        #[cfg(feature = "sqlite")]
        Some(url) => {
            use relay_mcp_session_storage::{SqliteConfig, SqliteSessionStore};

            let config = SqliteConfig {
                max_sessions_per_credential: args.max_sessions_per_key,
                ..SqliteConfig::from_database_url(url)
            };
            info!("Using SQLite session storage at {}", config.database_path.display());
            let store = SqliteSessionStore::with_config(config)
                .await
                .context("failed to open SQLite session storage")?;
            let store: Arc<BoxedSessionStore> = Arc::new(store);
            Ok(store)
        }
        #[cfg(not(feature = "sqlite"))]
        Some(_) => {
            warn!("DATABASE_URL is set but SQLite support is not compiled in; using in-memory storage");
            Ok(memory_store(args.max_sessions_per_key))
        }
        None => {
            info!("Using in-memory session storage");
            Ok(memory_store(args.max_sessions_per_key))
        }
    }
}

fn memory_store(max_sessions_per_credential: usize) -> Arc<BoxedSessionStore> {
    if max_sessions_per_credential == 0 {
        warn!("MAX_SESSIONS_PER_KEY of 0 is raised to 1");
    }
    Arc::new(InMemorySessionStore::with_config(InMemoryConfig {
        max_sessions_per_credential,
    }))
}
