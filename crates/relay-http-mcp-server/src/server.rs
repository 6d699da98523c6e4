//! HTTP+SSE MCP server
//!
//! Routes:
//! - `GET /{credential}/sse` opens a session stream
//! - `POST {messages_path}?session_id=…` delivers one client message
//! - `GET /` reports service status
//! - `OPTIONS *` answers CORS preflight when CORS is enabled

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited, StreamBody};
use hyper::body::Frame;
use hyper::header::{CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use relay_mcp_session_storage::{
    BoxedSessionStore, DEFAULT_MAX_SESSIONS_PER_CREDENTIAL, InMemoryConfig, InMemorySessionStore,
};

use crate::channel_manager::{ChannelConfig, SseChannelManager, SseStream};
use crate::engine::ProtocolEngine;
use crate::registry::SessionRegistry;
use crate::verifier::{CredentialVerifier, HttpCredentialVerifier, VerifierConfig};
use crate::{CorsLayer, HttpMcpError, Result, TransportError};

/// Response body used by every route
pub type HttpBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Configuration for the HTTP MCP server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_address: SocketAddr,
    /// Path accepting client messages
    pub messages_path: String,
    /// Enable CORS
    pub enable_cors: bool,
    /// Maximum request body size
    pub max_body_size: usize,
    /// Keep-alive comment interval on SSE streams; zero disables
    pub keepalive_interval: Duration,
    /// Session cap for the default in-memory store
    pub max_sessions_per_credential: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8000)),
            messages_path: "/messages".to_string(),
            enable_cors: true,
            max_body_size: 1024 * 1024, // 1MB
            keepalive_interval: Duration::from_secs(30),
            max_sessions_per_credential: DEFAULT_MAX_SESSIONS_PER_CREDENTIAL,
        }
    }
}

/// Builder for the HTTP MCP server
pub struct HttpMcpServerBuilder {
    config: ServerConfig,
    store: Option<Arc<BoxedSessionStore>>,
    verifier: Option<Arc<dyn CredentialVerifier>>,
    engine: Option<Arc<dyn ProtocolEngine>>,
    registry: Option<SessionRegistry>,
}

impl HttpMcpServerBuilder {
    /// Create a new builder with in-memory storage (zero-configuration)
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            store: None,
            verifier: None,
            engine: None,
            registry: None,
        }
    }

    /// Create a new builder with specific session storage
    pub fn with_store(store: Arc<BoxedSessionStore>) -> Self {
        Self::new().session_store(store)
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the bind address
    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.config.bind_address = addr;
        self
    }

    /// Set the message endpoint path
    pub fn messages_path(mut self, path: impl Into<String>) -> Self {
        self.config.messages_path = path.into();
        self
    }

    /// Enable or disable CORS
    pub fn cors(mut self, enable: bool) -> Self {
        self.config.enable_cors = enable;
        self
    }

    /// Set maximum request body size
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.config.max_body_size = size;
        self
    }

    /// Set the SSE keep-alive interval; zero disables keep-alives
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Session cap used when no store is supplied
    pub fn max_sessions_per_credential(mut self, max: usize) -> Self {
        self.config.max_sessions_per_credential = max;
        self
    }

    pub fn session_store(mut self, store: Arc<BoxedSessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn CredentialVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn ProtocolEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Share an existing registry instead of creating one
    pub fn registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the HTTP MCP server
    pub fn build(self) -> Result<HttpMcpServer> {
        let mut config = self.config;
        config.messages_path = normalize_messages_path(&config.messages_path)?;

        let engine = self
            .engine
            .ok_or_else(|| HttpMcpError::InvalidConfig("a protocol engine is required".to_string()))?;

        let store: Arc<BoxedSessionStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemorySessionStore::with_config(InMemoryConfig {
                max_sessions_per_credential: config.max_sessions_per_credential,
            })),
        };

        let verifier: Arc<dyn CredentialVerifier> = match self.verifier {
            Some(verifier) => verifier,
            None => Arc::new(HttpCredentialVerifier::new(VerifierConfig::default())?),
        };

        let channels = SseChannelManager::new(
            self.registry.unwrap_or_default(),
            store,
            ChannelConfig {
                messages_path: config.messages_path.clone(),
                keepalive_interval: config.keepalive_interval,
            },
        );

        Ok(HttpMcpServer {
            config,
            channels,
            verifier,
            engine,
        })
    }
}

impl Default for HttpMcpServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_messages_path(path: &str) -> Result<String> {
    let trimmed = path.trim_end_matches('/');
    if !path.starts_with('/') || trimmed.is_empty() {
        return Err(HttpMcpError::InvalidConfig(format!(
            "messages path must start with '/' and name a resource: {:?}",
            path
        )));
    }
    Ok(trimmed.to_string())
}

/// HTTP MCP Server
#[derive(Clone)]
pub struct HttpMcpServer {
    config: ServerConfig,
    channels: SseChannelManager,
    verifier: Arc<dyn CredentialVerifier>,
    engine: Arc<dyn ProtocolEngine>,
}

impl HttpMcpServer {
    /// Create a new builder with default in-memory storage
    pub fn builder() -> HttpMcpServerBuilder {
        HttpMcpServerBuilder::new()
    }

    /// Create a new builder with specific session storage
    pub fn builder_with_store(store: Arc<BoxedSessionStore>) -> HttpMcpServerBuilder {
        HttpMcpServerBuilder::with_store(store)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn channels(&self) -> &SseChannelManager {
        &self.channels
    }

    /// Bind the configured address and serve until an accept error
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_address).await?;
        self.run_with_listener(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!("HTTP MCP server listening on {}", local_addr);
        info!("SSE endpoint available at: /{{credential}}/sse");
        info!("Message endpoint available at: {}", self.config.messages_path);
        info!("Session storage: {}", self.channels.store().backend_name());

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            debug!("New connection from {}", peer_addr);

            let server = self.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| handle_request(req, server.clone()));

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    // Client disconnects mid-stream are routine for SSE
                    let err_str = err.to_string();
                    if err_str.contains("connection closed before message completed") {
                        debug!("Client disconnected (normal): {}", err);
                    } else {
                        error!("Error serving connection: {}", err);
                    }
                }
            });
        }
    }

    /// Get server statistics
    pub async fn get_stats(&self) -> ServerStats {
        let store = self.channels.store();
        ServerStats {
            open_sessions: self.channels.registry().len(),
            stored_sessions: store.session_count().await.unwrap_or(0),
            storage_type: store.backend_name().to_string(),
        }
    }

    async fn handle_sse(&self, path: &str) -> std::result::Result<Response<HttpBody>, TransportError> {
        let credential = credential_from_sse_path(path)?;

        if !self.verifier.verify(&credential).await {
            warn!("Rejected SSE connection: credential failed verification");
            return Err(TransportError::Auth("invalid credential".to_string()));
        }

        let stream = self.channels.connect(&credential, Arc::clone(&self.engine));
        Ok(sse_response(stream))
    }

    async fn handle_message(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<HttpBody>, TransportError> {
        let session_id = req.uri().query().and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "session_id")
                .map(|(_, value)| value.into_owned())
        });

        let limit = self.config.max_body_size;
        let declared_length = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        if declared_length.is_some_and(|length| length > limit) {
            return Err(TransportError::PayloadTooLarge { limit });
        }

        let body = read_body(req.into_body(), limit).await?;

        self.channels.deliver(session_id.as_deref(), body).await?;
        Ok(text_response(StatusCode::ACCEPTED, "Accepted"))
    }

    fn service_info(&self) -> Response<HttpBody> {
        let info = json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "status": "running",
            "storage": self.channels.store().backend_name(),
            "open_sessions": self.channels.registry().len(),
        });
        finish(
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "application/json"),
            full_body(info.to_string()),
        )
    }
}

/// Percent-decoded credential from `/{credential}/sse`
///
/// The credential may itself contain `/`.
pub fn credential_from_sse_path(path: &str) -> std::result::Result<String, TransportError> {
    let raw = path
        .strip_suffix("/sse")
        .map(|prefix| prefix.strip_prefix('/').unwrap_or(prefix))
        .unwrap_or("");

    let credential = urlencoding::decode(raw)
        .map_err(|_| TransportError::Auth("credential is not valid UTF-8".to_string()))?;
    if credential.is_empty() {
        return Err(TransportError::Auth("no credential supplied".to_string()));
    }
    Ok(credential.into_owned())
}

fn is_messages_path(path: &str, messages_path: &str) -> bool {
    path.strip_suffix('/').unwrap_or(path) == messages_path
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    server: HttpMcpServer,
) -> std::result::Result<Response<HttpBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("Handling {} {}", method, path);

    let result = if method == Method::OPTIONS && server.config.enable_cors {
        Ok(finish(
            Response::builder().status(StatusCode::NO_CONTENT),
            empty_body(),
        ))
    } else if path == "/" {
        match method {
            Method::GET => Ok(server.service_info()),
            _ => Ok(method_not_allowed()),
        }
    } else if is_messages_path(&path, &server.config.messages_path) {
        match method {
            Method::POST => server.handle_message(req).await,
            _ => Ok(method_not_allowed()),
        }
    } else if path.ends_with("/sse") {
        match method {
            Method::GET => server.handle_sse(&path).await,
            _ => Ok(method_not_allowed()),
        }
    } else {
        Ok(text_response(StatusCode::NOT_FOUND, "Not Found"))
    };

    let mut response = result.unwrap_or_else(|err| {
        match &err {
            TransportError::Internal(_) => error!("{} {} failed: {}", method, path, err),
            _ => debug!("{} {} rejected: {}", method, path, err),
        }
        text_response(err.status_code(), &err.public_message())
    });

    // Apply CORS if enabled
    if server.config.enable_cors {
        CorsLayer::apply_cors_headers(response.headers_mut());
    }
    Ok(response)
}

fn sse_response(stream: SseStream) -> Response<HttpBody> {
    debug!("Streaming SSE for session {}", stream.session_id());
    let frames = stream.map(|frame| Ok::<_, hyper::Error>(Frame::data(frame.into_bytes())));

    finish(
        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .header(CONNECTION, "keep-alive"),
        StreamBody::new(frames).boxed_unsync(),
    )
}

/// Collect a request body, capped at `limit` bytes
async fn read_body<B>(body: B, limit: usize) -> std::result::Result<Bytes, TransportError>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
            Err(TransportError::PayloadTooLarge { limit })
        }
        Err(err) => {
            warn!("Failed to read body: {}", err);
            Err(TransportError::BadRequest("Failed to read body".to_string()))
        }
    }
}

fn full_body(text: impl Into<Bytes>) -> HttpBody {
    Full::new(text.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn empty_body() -> HttpBody {
    full_body(Bytes::new())
}

fn text_response(status: StatusCode, text: &str) -> Response<HttpBody> {
    finish(
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8"),
        full_body(text.to_string()),
    )
}

fn method_not_allowed() -> Response<HttpBody> {
    text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
}

fn finish(builder: http::response::Builder, body: HttpBody) -> Response<HttpBody> {
    builder.body(body).unwrap_or_else(|err| {
        error!("Failed to build response: {}", err);
        let mut response = Response::new(full_body("Internal Server Error"));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    /// Sessions with an open SSE stream
    pub open_sessions: usize,
    /// Sessions known to the store
    pub stored_sessions: usize,
    pub storage_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_credential_from_sse_path() {
        assert_eq!(
            credential_from_sse_path("/sa_tools_abcd1234/sse").unwrap(),
            "sa_tools_abcd1234"
        );
        assert_eq!(
            credential_from_sse_path("/sa_tools_a%2Fb/sse").unwrap(),
            "sa_tools_a/b"
        );
        assert_eq!(
            credential_from_sse_path("/team/sa_tools_x/sse").unwrap(),
            "team/sa_tools_x"
        );
        assert!(matches!(
            credential_from_sse_path("/sse"),
            Err(TransportError::Auth(_))
        ));
        assert!(matches!(
            credential_from_sse_path("/%FF/sse"),
            Err(TransportError::Auth(_))
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_body_read_failure_hides_cause() {
        let body = StreamBody::new(futures::stream::iter(vec![
            Ok(Frame::data(Bytes::from_static(b"{\"jsonrpc\""))),
            Err(std::io::Error::other("connection reset by peer")),
        ]));

        match read_body(body, 1024).await {
            Err(err @ TransportError::BadRequest(_)) => {
                assert_eq!(err.public_message(), "Failed to read body");
            }
            other => panic!("expected BadRequest, got {:?}", other),
        }
        assert!(logs_contain("connection reset by peer"));
    }

    #[tokio::test]
    async fn test_body_over_limit_is_payload_too_large() {
        let body = Full::new(Bytes::from(vec![b'x'; 64]));
        assert!(matches!(
            read_body(body, 16).await,
            Err(TransportError::PayloadTooLarge { limit: 16 })
        ));
    }

    #[test]
    fn test_messages_path_normalization() {
        assert_eq!(normalize_messages_path("/messages/").unwrap(), "/messages");
        assert_eq!(normalize_messages_path("/messages").unwrap(), "/messages");
        assert!(normalize_messages_path("messages").is_err());
        assert!(normalize_messages_path("/").is_err());
    }

    #[test]
    fn test_messages_path_matching() {
        assert!(is_messages_path("/messages", "/messages"));
        assert!(is_messages_path("/messages/", "/messages"));
        assert!(!is_messages_path("/messages/x", "/messages"));
    }
}
