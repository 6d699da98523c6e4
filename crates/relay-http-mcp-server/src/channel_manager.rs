//! SSE Channel Manager
//!
//! Owns the life of every SSE session:
//! - `open` allocates a session id and its two handoff queues, registers the
//!   upstream sink and persists the session for its credential
//! - the returned [`SseStream`] emits the endpoint frame, then relays
//!   whatever the protocol engine writes, with keep-alive comments between
//! - `deliver` routes one POST body into the session's upstream queue
//!
//! Each session runs inside one cancellation scope. Dropping the stream (the
//! client went away) cancels the engine task; the engine finishing ends the
//! stream. Either way the registry entry is removed by [`SessionGuard`].

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_mcp_json_rpc::inject;
use relay_mcp_session_storage::{
    BoxedSessionStore, is_valid_session_id, mask_credential, new_session_id,
};

use crate::TransportError;
use crate::engine::{DownstreamItem, ProtocolEngine, SessionContext, UpstreamItem};
use crate::handoff::{self, HandoffError, HandoffReceiver, HandoffSender};
use crate::registry::{SessionRegistry, UpstreamSink};
use crate::sse::SseFrame;

/// Configuration for session channels
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Path advertised in the endpoint frame
    pub messages_path: String,
    /// Interval between keep-alive comments; zero disables them
    pub keepalive_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            messages_path: "/messages".to_string(),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// Removes the registry entry and cancels the session scope when dropped
pub struct SessionGuard {
    registry: SessionRegistry,
    session_id: String,
    sink: UpstreamSink,
    scope: CancellationToken,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove_if_same(&self.session_id, &self.sink);
        self.scope.cancel();
        info!("SSE session {} closed", self.session_id);
    }
}

/// The downstream half of a session as an SSE frame stream
pub struct SseStream {
    session_id: String,
    scope: CancellationToken,
    inner: Pin<Box<dyn Stream<Item = SseFrame> + Send>>,
}

impl SseStream {
    /// Get the session ID this stream belongs to
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Cancellation scope shared by everything serving this session
    pub fn scope(&self) -> CancellationToken {
        self.scope.clone()
    }
}

impl Stream for SseStream {
    type Item = SseFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for SseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseStream")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// A freshly opened session
#[derive(Debug)]
pub struct SseSession {
    pub session_id: String,
    /// Upstream messages, for the protocol engine
    pub read: HandoffReceiver<UpstreamItem>,
    /// Downstream messages, from the protocol engine
    pub write: HandoffSender<DownstreamItem>,
    pub stream: SseStream,
}

/// Opens SSE sessions and routes POST bodies into them
#[derive(Clone)]
pub struct SseChannelManager {
    registry: SessionRegistry,
    store: Arc<BoxedSessionStore>,
    config: ChannelConfig,
}

impl SseChannelManager {
    pub fn new(registry: SessionRegistry, store: Arc<BoxedSessionStore>, config: ChannelConfig) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<BoxedSessionStore> {
        &self.store
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Endpoint URL advertised to the client of `session_id`
    pub fn endpoint_url(&self, session_id: &str) -> String {
        format!("{}?session_id={}", self.config.messages_path, session_id)
    }

    /// Open a session: register it, persist it for `credential`, and build
    /// its SSE stream
    pub fn open(&self, credential: Option<&str>) -> SseSession {
        let session_id = new_session_id();
        let (upstream_tx, upstream_rx) = handoff::channel::<UpstreamItem>();
        let (downstream_tx, mut downstream_rx) = handoff::channel::<DownstreamItem>();

        self.registry.insert(session_id.clone(), upstream_tx.clone());

        let scope = CancellationToken::new();
        let guard = SessionGuard {
            registry: self.registry.clone(),
            session_id: session_id.clone(),
            sink: upstream_tx,
            scope: scope.clone(),
        };

        let persisted = credential
            .filter(|credential| !credential.is_empty())
            .map(|credential| self.persist(credential.to_string(), session_id.clone()));

        info!(
            "SSE session {} opened for credential {}",
            session_id,
            credential.map(mask_credential).unwrap_or_else(|| "<none>".to_string())
        );

        let endpoint = self.endpoint_url(&session_id);
        let keepalive_interval = self.config.keepalive_interval;
        let stream_scope = scope.clone();
        let stream_session_id = session_id.clone();

        let frames = async_stream::stream! {
            let _guard = guard;

            // The first POST must find the session in the store
            if let Some(persisted) = persisted {
                let _ = persisted.await;
            }

            debug!("Sending endpoint event for session {}: {}", stream_session_id, endpoint);
            yield SseFrame::Endpoint(endpoint);

            let mut keepalive = keepalive_timer(keepalive_interval);
            loop {
                let next = tokio::select! {
                    _ = stream_scope.cancelled() => None,
                    message = downstream_rx.recv() => message.map(SseFrame::Message),
                    _ = keepalive_tick(&mut keepalive) => Some(SseFrame::KeepAlive),
                };
                match next {
                    Some(frame) => {
                        yield frame;
                    }
                    None => break,
                }
            }

            debug!("SSE relay for session {} finished", stream_session_id);
        };

        SseSession {
            session_id: session_id.clone(),
            read: upstream_rx,
            write: downstream_tx,
            stream: SseStream {
                session_id,
                scope,
                inner: Box::pin(frames),
            },
        }
    }

    /// Open a session and run `engine` on it inside the session scope
    pub fn connect(&self, credential: &str, engine: Arc<dyn ProtocolEngine>) -> SseStream {
        let SseSession {
            session_id,
            read,
            write,
            stream,
        } = self.open(Some(credential));

        let scope = stream.scope();
        let context = SessionContext {
            session_id,
            credential: credential.to_string(),
        };

        tokio::spawn(async move {
            let session_id = context.session_id.clone();
            tokio::select! {
                _ = scope.cancelled() => {
                    debug!("Engine for session {} cancelled", session_id);
                }
                _ = engine.run(context, read, write) => {
                    debug!("Engine for session {} finished", session_id);
                }
            }
            scope.cancel();
        });

        stream
    }

    /// Route one POST body into the session's upstream queue
    ///
    /// Waits until the engine has taken the message. A body that is not JSON
    /// is still forwarded, as an error value, before the call fails with
    /// [`TransportError::MalformedMessage`].
    pub async fn deliver(&self, session_id: Option<&str>, raw_body: Bytes) -> Result<(), TransportError> {
        let Some(session_id) = session_id else {
            warn!("Received message without session_id");
            return Err(TransportError::BadRequest("session_id is required".to_string()));
        };
        let session_id = session_id.to_ascii_lowercase();
        if !is_valid_session_id(&session_id) {
            warn!("Received invalid session ID: {}", session_id);
            return Err(TransportError::BadRequest("Invalid session ID".to_string()));
        }

        let Some(sink) = self.registry.sink(&session_id) else {
            warn!("Could not find session for ID: {}", session_id);
            return Err(TransportError::NotFound(session_id));
        };

        let credential = match self.store.get_credential_by_session(&session_id).await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                debug!("No stored credential for session {}", session_id);
                String::new()
            }
            Err(e) => {
                warn!("Credential lookup for session {} failed: {}", session_id, e);
                String::new()
            }
        };

        match inject(&raw_body, &session_id, &credential) {
            Ok(envelope) => {
                debug!(
                    "Delivering {} to session {}",
                    envelope.method().unwrap_or("<response>"),
                    session_id
                );
                push(&sink, &session_id, Ok(envelope)).await
            }
            Err(malformed) => {
                warn!("Failed to parse message for session {}: {}", session_id, malformed);
                push(&sink, &session_id, Err(malformed.clone())).await?;
                Err(TransportError::MalformedMessage(malformed))
            }
        }
    }

    fn persist(&self, credential: String, session_id: String) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            match store.create_session(&credential, &session_id).await {
                Ok(_) => debug!("Persisted session {}", session_id),
                Err(e) => warn!("Failed to persist session {}: {}", session_id, e),
            }
        })
    }
}

async fn push(sink: &UpstreamSink, session_id: &str, item: UpstreamItem) -> Result<(), TransportError> {
    sink.send(item)
        .await
        .map_err(|err| handoff_failure(session_id, err))
}

pub(crate) fn handoff_failure<T>(session_id: &str, err: HandoffError<T>) -> TransportError {
    match err {
        HandoffError::Closed(_) => {
            warn!("Session {} closed before its message was taken", session_id);
            TransportError::NotFound(session_id.to_string())
        }
        HandoffError::Lost => {
            error!("Message for session {} was lost in handoff", session_id);
            TransportError::Internal(format!("message for session {} lost in handoff", session_id))
        }
    }
}

fn keepalive_timer(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn keepalive_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
