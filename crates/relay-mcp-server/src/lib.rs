//! # Relay MCP Server
//!
//! A minimal MCP protocol engine for the HTTP+SSE transport. It answers the
//! lifecycle methods and serves one tool, `get_current_sessions`, which
//! reports the session identity the transport injected into the request.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relay_http_mcp_server::{HttpMcpServer, PrefixCredentialVerifier};
//! use relay_mcp_server::SessionToolEngine;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = HttpMcpServer::builder()
//!     .verifier(Arc::new(PrefixCredentialVerifier::default()))
//!     .engine(Arc::new(SessionToolEngine::new()))
//!     .build()?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use relay_http_mcp_server::{
    DownstreamItem, HandoffReceiver, HandoffSender, ProtocolEngine, SessionContext, UpstreamItem,
};
use relay_mcp_json_rpc::{
    CREDENTIAL_KEY, JsonRpcError, JsonRpcErrorCode, JsonRpcErrorObject, JsonRpcMessage,
    JsonRpcResponse, META_KEY, RequestId, SESSION_ID_KEY,
};
use relay_mcp_session_storage::mask_credential;

/// MCP revision that defined the HTTP+SSE transport
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Name of the built-in session report tool
pub const GET_CURRENT_SESSIONS: &str = "get_current_sessions";

/// Serves `initialize`, `ping`, `tools/list` and `tools/call`
#[derive(Debug, Clone)]
pub struct SessionToolEngine {
    name: String,
    version: String,
}

impl Default for SessionToolEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionToolEngine {
    pub fn new() -> Self {
        Self::with_info(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }

    /// Report a custom name and version in `serverInfo`
    pub fn with_info(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Reply to one upstream item; `None` when nothing is owed
    pub fn handle(&self, item: UpstreamItem) -> Option<Value> {
        let envelope = match item {
            Ok(envelope) => envelope,
            Err(malformed) => {
                warn!("Replying parse error: {}", malformed.reason);
                return Some(JsonRpcMessage::from(JsonRpcError::parse_error(malformed.reason)).into_value());
            }
        };

        match envelope.to_value() {
            Value::Array(batch) => {
                let replies: Vec<Value> = batch
                    .iter()
                    .filter_map(|message| self.respond(message))
                    .map(JsonRpcMessage::into_value)
                    .collect();
                (!replies.is_empty()).then_some(Value::Array(replies))
            }
            message => self.respond(&message).map(JsonRpcMessage::into_value),
        }
    }

    fn respond(&self, message: &Value) -> Option<JsonRpcMessage> {
        // Client replies to server requests carry no method and get no answer
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            debug!("No reply owed for a client response");
            return None;
        };
        let Some(id) = message.get("id") else {
            debug!("No reply owed for notification {}", method);
            return None;
        };
        let Ok(id) = serde_json::from_value::<RequestId>(id.clone()) else {
            warn!("Request {} carries an unusable id: {}", method, id);
            return Some(
                JsonRpcError::new(
                    None,
                    JsonRpcErrorObject::new(
                        JsonRpcErrorCode::InvalidRequest,
                        Some("Request id must be a string or a number".to_string()),
                        None,
                    ),
                )
                .into(),
            );
        };

        let params = message.get("params");
        let result = match method {
            "initialize" => self.initialize(),
            "ping" => json!({}),
            "tools/list" => json!({ "tools": [get_current_sessions_tool()] }),
            "tools/call" => match call_tool(params) {
                Ok(result) => result,
                Err(message) => return Some(JsonRpcError::invalid_params(id, &message).into()),
            },
            other => {
                debug!("Method not found: {}", other);
                return Some(JsonRpcError::method_not_found(id, other).into());
            }
        };
        Some(JsonRpcResponse::success(id, result).into())
    }

    fn initialize(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": { "name": self.name, "version": self.version },
        })
    }
}

#[async_trait]
impl ProtocolEngine for SessionToolEngine {
    async fn run(
        &self,
        context: SessionContext,
        mut read: HandoffReceiver<UpstreamItem>,
        write: HandoffSender<DownstreamItem>,
    ) {
        info!(
            "Session tool engine serving {} for {}",
            context.session_id,
            mask_credential(&context.credential)
        );

        while let Some(item) = read.recv().await {
            let Some(reply) = self.handle(item) else {
                continue;
            };
            if write.send(reply).await.is_err() {
                debug!("Stream for session {} closed, stopping engine", context.session_id);
                break;
            }
        }
    }
}

fn get_current_sessions_tool() -> Value {
    json!({
        "name": GET_CURRENT_SESSIONS,
        "description": "Report the session id and masked API key of the current connection",
        "inputSchema": { "type": "object", "properties": {} },
    })
}

fn call_tool(params: Option<&Value>) -> Result<Value, String> {
    let name = params
        .and_then(|params| params.get("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| "Missing tool name".to_string())?;

    match name {
        GET_CURRENT_SESSIONS => Ok(json!({
            "content": [{ "type": "text", "text": session_report(params) }],
            "isError": false,
        })),
        other => Err(format!("Unknown tool: {}", other)),
    }
}

fn session_report(params: Option<&Value>) -> String {
    let Some(meta) = params.and_then(|params| params.get(META_KEY)) else {
        return "Session information unavailable: request carried no metadata".to_string();
    };

    let session_id = meta.get(SESSION_ID_KEY).and_then(Value::as_str).unwrap_or("None");
    let api_key = match meta.get(CREDENTIAL_KEY).and_then(Value::as_str) {
        Some(key) if !key.is_empty() => mask_credential(key),
        _ => "None".to_string(),
    };
    format!("Session ID: {}\nAPI key: {}", session_id, api_key)
}
