//! Inbound JSON-RPC envelopes and session metadata injection
//!
//! Every upstream body is parsed twice over, at most: first strictly into
//! [`JsonRpcEnvelope`], and when that fails (unexpected nesting, type
//! mismatches, responses without a `method`) into a plain JSON tree. Both
//! shapes carry the session identity into `params._meta` the same way:
//! missing fields are filled in, caller-supplied values are left alone.
//! Only a body that is not JSON at all is rejected.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::types::{JsonRpcVersion, RequestId};

/// Key of the metadata object inside `params`
pub const META_KEY: &str = "_meta";
/// Metadata key carrying the session id
pub const SESSION_ID_KEY: &str = "session_id";
/// Metadata key carrying the caller's credential
pub const CREDENTIAL_KEY: &str = "api_key";

/// Session metadata carried in `params._meta`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "api_key", default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    /// Caller metadata such as `progressToken`, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionMeta {
    pub fn new(session_id: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            credential: Some(credential.into()),
            extra: Map::new(),
        }
    }

    /// Fill `session_id` and `api_key` when unset; never overwrite
    pub fn fill(&mut self, session_id: &str, credential: &str) {
        if self.session_id.is_none() {
            self.session_id = Some(session_id.to_string());
        }
        if self.credential.is_none() {
            self.credential = Some(credential.to_string());
        }
    }
}

/// Named request parameters with an optional `_meta` object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcParams {
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<SessionMeta>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JsonRpcParams {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

// An explicit `null` cannot be told apart from an absent member once read
// into an `Option`, so it fails the strict shape and travels as `Raw`.
fn non_null<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// A JSON-RPC request or notification in its strict shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcEnvelope {
    #[serde(rename = "jsonrpc")]
    pub version: JsonRpcVersion,
    #[serde(default, deserialize_with = "non_null", skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, deserialize_with = "non_null", skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonRpcParams>,
    /// Unrecognised top-level members, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JsonRpcEnvelope {
    pub fn new(id: Option<RequestId>, method: impl Into<String>, params: Option<JsonRpcParams>) -> Self {
        Self {
            version: JsonRpcVersion::V2_0,
            id,
            method: method.into(),
            params,
            extra: Map::new(),
        }
    }

    /// Notifications carry no id and expect no reply
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn meta(&self) -> Option<&SessionMeta> {
        self.params.as_ref()?.meta.as_ref()
    }

    /// Inject session identity into `params._meta`; envelopes without params
    /// are left untouched
    pub fn inject_session(&mut self, session_id: &str, credential: &str) {
        if let Some(params) = self.params.as_mut() {
            params
                .meta
                .get_or_insert_with(SessionMeta::default)
                .fill(session_id, credential);
        }
    }
}

/// An upstream message as seen by the protocol engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InboundEnvelope {
    /// Parsed against the strict schema
    Strict(JsonRpcEnvelope),
    /// Valid JSON that did not fit the strict schema
    Raw(Value),
}

impl InboundEnvelope {
    /// Parse a raw body, strict shape first
    pub fn parse(raw: &[u8]) -> Result<Self, MalformedMessage> {
        match serde_json::from_slice::<JsonRpcEnvelope>(raw) {
            Ok(envelope) => Ok(Self::Strict(envelope)),
            Err(strict_err) => {
                debug!("Strict envelope parse failed, using raw tree: {}", strict_err);
                serde_json::from_slice::<Value>(raw)
                    .map(Self::Raw)
                    .map_err(|err| MalformedMessage::new(Bytes::copy_from_slice(raw), err.to_string()))
            }
        }
    }

    /// Inject session identity, filling only unset fields
    pub fn inject_session(&mut self, session_id: &str, credential: &str) {
        match self {
            Self::Strict(envelope) => envelope.inject_session(session_id, credential),
            Self::Raw(Value::Array(batch)) => {
                for item in batch.iter_mut() {
                    inject_into_tree(item, session_id, credential);
                }
            }
            Self::Raw(tree) => inject_into_tree(tree, session_id, credential),
        }
    }

    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Strict(_))
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Strict(envelope) => Some(envelope.method.as_str()),
            Self::Raw(tree) => tree.get("method").and_then(Value::as_str),
        }
    }

    /// `params._meta` as a JSON tree, whichever shape the envelope has
    pub fn meta_value(&self) -> Option<Value> {
        match self {
            Self::Strict(envelope) => envelope
                .meta()
                .and_then(|meta| serde_json::to_value(meta).ok()),
            Self::Raw(tree) => tree.get("params")?.get(META_KEY).cloned(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Strict(envelope) => serde_json::to_value(envelope).unwrap_or(Value::Null),
            Self::Raw(tree) => tree.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn inject_into_tree(tree: &mut Value, session_id: &str, credential: &str) {
    let Some(params) = tree.get_mut("params").and_then(Value::as_object_mut) else {
        return;
    };

    let meta = params
        .entry(META_KEY)
        .or_insert_with(|| Value::Object(Map::new()));
    if !meta.is_object() {
        *meta = Value::Object(Map::new());
    }

    if let Some(meta) = meta.as_object_mut() {
        fill_string(meta, SESSION_ID_KEY, session_id);
        fill_string(meta, CREDENTIAL_KEY, credential);
    }
}

// A non-string value under one of our keys cannot be a session id or a
// credential, so it counts as unset.
fn fill_string(meta: &mut Map<String, Value>, key: &str, value: &str) {
    if !matches!(meta.get(key), Some(Value::String(_))) {
        meta.insert(key.to_string(), Value::String(value.to_string()));
    }
}

/// A body that is not JSON at all
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Could not parse message: {reason}")]
pub struct MalformedMessage {
    /// The body exactly as received
    pub raw: Bytes,
    pub reason: String,
}

impl MalformedMessage {
    pub fn new(raw: Bytes, reason: impl Into<String>) -> Self {
        Self {
            raw,
            reason: reason.into(),
        }
    }
}

/// Parse `raw_body` and inject `session_id`/`credential` into its metadata
pub fn inject(
    raw_body: &[u8],
    session_id: &str,
    credential: &str,
) -> Result<InboundEnvelope, MalformedMessage> {
    let mut envelope = InboundEnvelope::parse(raw_body)?;
    envelope.inject_session(session_id, credential);
    Ok(envelope)
}
