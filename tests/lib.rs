//! Shared helpers for end-to-end tests
//!
//! [`TestServer`] runs a real server on a loopback port; [`SseClient`] holds
//! one SSE session open and posts messages into it.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use relay_http_mcp_server::{
    HttpMcpServer, HttpMcpServerBuilder, PrefixCredentialVerifier, SseEvent, SseEventParser,
};
use relay_mcp_server::SessionToolEngine;

/// Credential accepted by the default test verifier
pub const TEST_KEY: &str = "sa_tools_abcd1234";

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A server listening on 127.0.0.1 with an OS-assigned port
pub struct TestServer {
    addr: SocketAddr,
    server: HttpMcpServer,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Start with the session tool engine, a prefix-only verifier and a
    /// short keep-alive, so disconnects surface quickly
    pub async fn start_default() -> Result<Self> {
        Self::start(
            HttpMcpServer::builder()
                .verifier(Arc::new(PrefixCredentialVerifier::default()))
                .keepalive_interval(Duration::from_millis(100)),
        )
        .await
    }

    /// Start from a builder; the session tool engine is supplied
    pub async fn start(builder: HttpMcpServerBuilder) -> Result<Self> {
        init_tracing();

        let server = builder.engine(Arc::new(SessionToolEngine::new())).build()?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let running = server.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = running.run_with_listener(listener).await {
                debug!("Test server stopped: {}", e);
            }
        });

        Ok(Self {
            addr,
            server,
            handle,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn server(&self) -> &HttpMcpServer {
        &self.server
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// An open SSE session
pub struct SseClient {
    response: reqwest::Response,
    parser: SseEventParser,
    pending: VecDeque<SseEvent>,
    http: reqwest::Client,
    message_url: String,
    session_id: String,
}

impl SseClient {
    /// Open `GET /{credential_path}/sse` and read the endpoint frame
    pub async fn connect(server: &TestServer, credential_path: &str) -> Result<Self> {
        let http = reqwest::Client::new();
        let response = http
            .get(server.url(&format!("/{}/sse", credential_path)))
            .send()
            .await?;
        if response.status() != reqwest::StatusCode::OK {
            bail!("SSE open failed with status {}", response.status());
        }

        let mut client = Self {
            response,
            parser: SseEventParser::new(),
            pending: VecDeque::new(),
            http,
            message_url: String::new(),
            session_id: String::new(),
        };

        let endpoint = client.next_event().await?;
        if endpoint.event.as_deref() != Some("endpoint") {
            bail!("first SSE event was {:?}, not endpoint", endpoint.event);
        }
        client.session_id = endpoint
            .data
            .split_once("session_id=")
            .map(|(_, id)| id.to_string())
            .ok_or_else(|| anyhow!("endpoint without session_id: {}", endpoint.data))?;
        client.message_url = server.url(&endpoint.data);
        Ok(client)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn message_url(&self) -> &str {
        &self.message_url
    }

    pub async fn next_event(&mut self) -> Result<SseEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            let chunk = timeout(EVENT_TIMEOUT, self.response.chunk())
                .await
                .context("timed out waiting for SSE event")??
                .ok_or_else(|| anyhow!("SSE stream ended"))?;
            self.pending.extend(self.parser.feed(&chunk));
        }
    }

    /// Next `message` event, parsed as JSON
    pub async fn next_message(&mut self) -> Result<Value> {
        let event = self.next_event().await?;
        if event.event.as_deref() != Some("message") {
            bail!("expected message event, got {:?}", event.event);
        }
        Ok(serde_json::from_str(&event.data)?)
    }

    /// POST a raw body to this session's message endpoint
    pub async fn post_raw(&self, body: impl Into<reqwest::Body>) -> Result<reqwest::Response> {
        Ok(self
            .http
            .post(&self.message_url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await?)
    }

    pub async fn post(&self, message: &Value) -> Result<reqwest::Response> {
        self.post_raw(message.to_string()).await
    }

    /// POST a request and wait for its reply on the stream
    pub async fn request(&mut self, message: &Value) -> Result<Value> {
        let response = self.post(message).await?;
        if response.status() != reqwest::StatusCode::ACCEPTED {
            bail!("POST rejected with status {}", response.status());
        }
        self.next_message().await
    }
}
