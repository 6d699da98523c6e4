//! # JSON-RPC 2.0 Envelopes for Relay MCP
//!
//! Transport-agnostic message types shared by the SSE transport and the
//! protocol engine behind it.
//!
//! ## Features
//! - Strict request/notification envelopes with unknown members preserved
//! - Tolerant fallback to a raw JSON tree for anything else that parses
//! - Session metadata injection into `params._meta` (fill-if-absent)
//! - Response and error objects with the standard error codes

pub mod envelope;
pub mod error;
pub mod response;
pub mod types;

// Re-export main types
pub use envelope::{
    inject, InboundEnvelope, JsonRpcEnvelope, JsonRpcParams, MalformedMessage, SessionMeta,
    CREDENTIAL_KEY, META_KEY, SESSION_ID_KEY,
};
pub use error::{JsonRpcError, JsonRpcErrorCode, JsonRpcErrorObject};
pub use response::{JsonRpcMessage, JsonRpcResponse};
pub use types::{JsonRpcVersion, RequestId};

/// JSON-RPC 2.0 version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}
