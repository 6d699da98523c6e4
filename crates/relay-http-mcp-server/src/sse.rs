//! Server-Sent Events framing

use bytes::Bytes;
use serde_json::Value;

/// Event name of the endpoint advertisement
pub const ENDPOINT_EVENT: &str = "endpoint";
/// Event name of relayed JSON-RPC messages
pub const MESSAGE_EVENT: &str = "message";

/// One frame on a session's SSE stream
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// POST URL for this session, sent once, first
    Endpoint(String),
    /// A message written by the protocol engine
    Message(Value),
    /// Comment frame keeping idle connections open
    KeepAlive,
}

impl SseFrame {
    /// Format as SSE wire text
    pub fn format(&self) -> String {
        match self {
            SseFrame::Endpoint(url) => format!("event: {}\ndata: {}\n\n", ENDPOINT_EVENT, url),
            SseFrame::Message(data) => {
                // Compact JSON never contains a raw newline
                format!(
                    "event: {}\ndata: {}\n\n",
                    MESSAGE_EVENT,
                    serde_json::to_string(data).unwrap_or_else(|_| "null".to_string())
                )
            }
            SseFrame::KeepAlive => ": keepalive\n\n".to_string(),
        }
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.format())
    }
}

/// A dispatched SSE event as a client sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser for consumers of the stream
///
/// Feed it chunks as they arrive; complete events come out, partial ones
/// stay buffered. Comment lines are dropped.
#[derive(Debug, Default)]
pub struct SseEventParser {
    buffer: String,
}

impl SseEventParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();

            let mut event = None;
            let mut data: Vec<&str> = Vec::new();
            for line in block.lines() {
                if line.starts_with(':') {
                    continue;
                }
                let (field, value) = line.split_once(':').unwrap_or((line, ""));
                let value = value.strip_prefix(' ').unwrap_or(value);
                match field {
                    "event" => event = Some(value.to_string()),
                    "data" => data.push(value),
                    _ => {}
                }
            }

            if !data.is_empty() {
                events.push(SseEvent {
                    event,
                    data: data.join("\n"),
                });
            }
        }
        events
    }
}
