//! Protocol engine seam
//!
//! The transport does not interpret JSON-RPC beyond metadata injection. Each
//! SSE connection hands an engine the receiving end of its upstream queue and
//! the sending end of its downstream queue; the engine runs until the
//! upstream queue ends or the connection is cancelled.

use async_trait::async_trait;
use serde_json::Value;

use relay_mcp_json_rpc::{InboundEnvelope, MalformedMessage};

use crate::handoff::{HandoffReceiver, HandoffSender};

/// What the engine reads: a mutated envelope, or the body that failed to parse
pub type UpstreamItem = Result<InboundEnvelope, MalformedMessage>;

/// What the engine writes: any JSON-RPC message
pub type DownstreamItem = Value;

/// Identity of the connection an engine serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: String,
    pub credential: String,
}

#[async_trait]
pub trait ProtocolEngine: Send + Sync + 'static {
    /// Serve one session until `read` ends
    async fn run(
        &self,
        context: SessionContext,
        read: HandoffReceiver<UpstreamItem>,
        write: HandoffSender<DownstreamItem>,
    );
}
