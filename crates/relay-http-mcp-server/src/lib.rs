//! # HTTP+SSE MCP Session Transport
//!
//! This crate carries MCP traffic over the two-channel HTTP+SSE transport:
//! a long-lived `GET /{credential}/sse` stream for server→client messages and
//! short `POST /messages?session_id=…` requests for client→server messages.
//!
//! ## Features
//! - Zero-capacity handoff queues between the wire and the protocol engine
//! - Session registry with scoped cleanup on every disconnect path
//! - Session identity and credential injected into every upstream message
//! - Credential verification before a session is opened
//! - Per-credential session cap enforced through the session store
//! - CORS support for browser-based clients

pub mod channel_manager;
pub mod cors;
pub mod engine;
pub mod handoff;
pub mod registry;
pub mod server;
pub mod sse;
pub mod verifier;

#[cfg(test)]
mod tests;

// Re-export main types
pub use channel_manager::{ChannelConfig, SessionGuard, SseChannelManager, SseSession, SseStream};
pub use cors::CorsLayer;
pub use engine::{DownstreamItem, ProtocolEngine, SessionContext, UpstreamItem};
pub use handoff::{HandoffError, HandoffReceiver, HandoffSender};
pub use registry::{SessionRegistry, UpstreamSink};
pub use server::{HttpMcpServer, HttpMcpServerBuilder, ServerConfig, ServerStats};
pub use sse::{SseEvent, SseEventParser, SseFrame};
pub use verifier::{
    CredentialVerifier, HttpCredentialVerifier, PrefixCredentialVerifier, VerifierConfig,
    VerifierError,
};

// Re-export foundational types
pub use relay_mcp_json_rpc::{InboundEnvelope, MalformedMessage};
pub use relay_mcp_session_storage::{BoxedSessionStore, SessionStore, SessionStoreError};

use hyper::StatusCode;

/// Result type for HTTP MCP operations
pub type Result<T> = std::result::Result<T, HttpMcpError>;

/// HTTP MCP specific errors
#[derive(Debug, thiserror::Error)]
pub enum HttpMcpError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Verifier error: {0}")]
    Verifier(#[from] VerifierError),

    #[error("Session store error: {0}")]
    Store(#[from] SessionStoreError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Per-request transport failures, each mapped to one HTTP status
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Unauthorized: {0}")]
    Auth(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Could not find session for ID: {0}")]
    NotFound(String),

    #[error(transparent)]
    MalformedMessage(#[from] MalformedMessage),

    #[error("Payload too large: limit is {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransportError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TransportError::Auth(_) => StatusCode::UNAUTHORIZED,
            TransportError::BadRequest(_) | TransportError::MalformedMessage(_) => {
                StatusCode::BAD_REQUEST
            }
            TransportError::NotFound(_) => StatusCode::NOT_FOUND,
            TransportError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            TransportError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short response body text, without internal detail
    pub fn public_message(&self) -> String {
        match self {
            TransportError::Auth(_) => "Unauthorized".to_string(),
            TransportError::BadRequest(reason) => reason.clone(),
            TransportError::NotFound(_) => "Could not find session".to_string(),
            TransportError::MalformedMessage(_) => "Could not parse message".to_string(),
            TransportError::PayloadTooLarge { .. } => "Request body too large".to_string(),
            TransportError::Internal(_) => "Internal Server Error".to_string(),
        }
    }
}
