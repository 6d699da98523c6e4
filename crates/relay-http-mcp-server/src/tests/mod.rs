//! Test modules for relay-http-mcp-server
//!
//! Channel-level tests drive [`SseChannelManager`](crate::SseChannelManager)
//! directly; server tests go through real HTTP on a loopback port.


use async_trait::async_trait;
use serde_json::json;

use crate::engine::{DownstreamItem, ProtocolEngine, SessionContext, UpstreamItem};
use crate::handoff::{HandoffReceiver, HandoffSender};

pub(crate) const KEY: &str = "sa_tools_abcd1234";

/// Writes every upstream item back downstream, wrapped
pub(crate) struct EchoEngine;

#[async_trait]
impl ProtocolEngine for EchoEngine {
    async fn run(
        &self,
        _context: SessionContext,
        mut read: HandoffReceiver<UpstreamItem>,
        write: HandoffSender<DownstreamItem>,
    ) {
        while let Some(item) = read.recv().await {
            let reply = match item {
                Ok(envelope) => json!({ "echo": envelope.to_value() }),
                Err(malformed) => json!({ "malformed": malformed.reason }),
            };
            if write.send(reply).await.is_err() {
                break;
            }
        }
    }
}
