//! # Stream Relay
//!
//! Owns one upstream exchange per client request: connects, forwards every answer
//! fragment to the client channel as soon as it arrives, and applies the
//! conversation-continuity retry.
//!
//! The retry happens only while the session is CONNECTING, i.e. before anything
//! reached the client, so a client always sees one coherent answer from one
//! upstream conversation. The overall deadline covers connect, retry and streaming.

use super::backend::{BackendError, ConversationBackend, ConversationRequest, UpstreamEvent, UpstreamStream};
use super::events::ClientEvent;
use super::session::{SessionReport, SessionState, StreamSession};
use crate::core::error::{GatewayError, GatewayResult};
use crate::observability::metrics as gateway_metrics;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How long a terminal error event may wait for channel capacity
const ERROR_DELIVERY_GRACE: Duration = Duration::from_secs(1);

/// Relays upstream answers to clients
pub struct StreamRelay {
    backend: Arc<dyn ConversationBackend>,
    deadline: Duration,
    channel_capacity: usize,
}

impl StreamRelay {
    pub fn new(backend: Arc<dyn ConversationBackend>, deadline: Duration, channel_capacity: usize) -> Self {
        Self {
            backend,
            deadline,
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Spawn a session and return the client side of its channel.
    ///
    /// Dropping the returned stream is treated as a client disconnect.
    pub fn open(self: &Arc<Self>, request: ConversationRequest) -> (ReceiverStream<ClientEvent>, JoinHandle<SessionReport>) {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let relay = self.clone();
        let handle = tokio::spawn(async move { relay.relay(request, tx).await });
        (ReceiverStream::new(rx), handle)
    }

    /// Run one session to completion, writing client events to `tx`
    pub async fn relay(&self, request: ConversationRequest, tx: mpsc::Sender<ClientEvent>) -> SessionReport {
        let mut session = StreamSession::new(request.conversation().map(str::to_string));
        let span = info_span!(
            "relay_session",
            session_id = %session.id(),
            conversation_id = ?session.requested_conversation_id(),
        );

        async move {
            let deadline = Instant::now() + self.deadline;
            let outcome = match timeout_at(deadline, self.drive(&mut session, request, &tx)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(GatewayError::UpstreamTimeout {
                    timeout_ms: self.deadline.as_millis() as u64,
                }),
            };

            match outcome {
                Ok(()) => {
                    gateway_metrics::record_relay_session("done");
                    info!(
                        conversation_id = ?session.conversation_id(),
                        chunks = session.chunks_forwarded(),
                        retries = session.retries_used(),
                        "Relay session completed"
                    );
                    session.report(None)
                }
                Err(err) => {
                    session.fail();
                    gateway_metrics::record_relay_session(err.error_code().as_str());

                    match &err {
                        GatewayError::ClientDisconnected => {
                            debug!(chunks = session.chunks_forwarded(), "Client disconnected, upstream call aborted");
                        }
                        GatewayError::Internal { .. } => {
                            error!(error = %err, "Relay session failed on a state machine violation");
                            Self::deliver_error(&tx, &err).await;
                        }
                        _ => {
                            warn!(error = %err, code = %err.error_code(), "Relay session failed");
                            Self::deliver_error(&tx, &err).await;
                        }
                    }

                    session.report(Some(err))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn deliver_error(tx: &mpsc::Sender<ClientEvent>, err: &GatewayError) {
        match timeout(ERROR_DELIVERY_GRACE, tx.send(ClientEvent::error(err))).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!("Client gone before the error event could be delivered"),
            Err(_) => warn!("Client did not accept the error event in time"),
        }
    }

    async fn drive(
        &self,
        session: &mut StreamSession,
        mut request: ConversationRequest,
        tx: &mpsc::Sender<ClientEvent>,
    ) -> GatewayResult<()> {
        session.transition(SessionState::Connecting)?;

        let mut upstream = loop {
            let connected = tokio::select! {
                biased;
                _ = tx.closed() => return Err(GatewayError::ClientDisconnected),
                connected = self.backend.start_or_continue(request.clone()) => connected,
            };

            let mut upstream = match connected {
                Ok(upstream) => upstream,
                Err(err) => {
                    if self.retry_if_allowed(session, &mut request, &err)? {
                        continue;
                    }
                    return Err(Self::connect_error(session, err));
                }
            };

            // Still CONNECTING until something can be forwarded: "not found" may come
            // as the first item, or after empty fragments that never reach the client
            let first = loop {
                match Self::next_item(&mut upstream, tx).await? {
                    Some(Ok(UpstreamEvent::Fragment(answer))) if answer.is_empty() => continue,
                    other => break other,
                }
            };
            match first {
                Some(Ok(event)) => {
                    session.transition(SessionState::Streaming)?;
                    if self.forward(session, event, tx).await? {
                        return Ok(());
                    }
                    break upstream;
                }
                Some(Err(err)) => {
                    drop(upstream);
                    if self.retry_if_allowed(session, &mut request, &err)? {
                        continue;
                    }
                    return Err(Self::connect_error(session, err));
                }
                None => return Err(GatewayError::stream("upstream closed the stream before sending any data")),
            }
        };

        loop {
            match Self::next_item(&mut upstream, tx).await? {
                Some(Ok(event)) => {
                    if self.forward(session, event, tx).await? {
                        return Ok(());
                    }
                }
                Some(Err(err)) => return Err(Self::streaming_error(err)),
                None => return Err(GatewayError::stream("upstream stream ended without a message end event")),
            }
        }
    }

    /// Next upstream item, or `ClientDisconnected` if the client went away first
    async fn next_item(
        upstream: &mut UpstreamStream,
        tx: &mpsc::Sender<ClientEvent>,
    ) -> GatewayResult<Option<Result<UpstreamEvent, BackendError>>> {
        tokio::select! {
            biased;
            _ = tx.closed() => Err(GatewayError::ClientDisconnected),
            item = upstream.next() => Ok(item),
        }
    }

    /// Start over with a new conversation if `err` is the unknown-conversation signal
    /// and the session may still retry.
    fn retry_if_allowed(
        &self,
        session: &mut StreamSession,
        request: &mut ConversationRequest,
        err: &BackendError,
    ) -> GatewayResult<bool> {
        if !matches!(err, BackendError::ConversationNotFound { .. })
            || request.conversation().is_none()
            || !session.can_retry()
        {
            return Ok(false);
        }

        session.begin_retry()?;
        gateway_metrics::record_conversation_retry();
        info!(
            stale_conversation_id = ?request.conversation_id,
            "Conversation unknown upstream, starting a new conversation"
        );
        request.conversation_id = None;
        session.transition(SessionState::Connecting)?;
        Ok(true)
    }

    fn connect_error(session: &StreamSession, err: BackendError) -> GatewayError {
        match err {
            BackendError::ConversationNotFound { conversation_id } => GatewayError::UpstreamRejectedConversation {
                conversation_id: session
                    .requested_conversation_id()
                    .map(str::to_string)
                    .unwrap_or(conversation_id),
            },
            other => other.into(),
        }
    }

    /// After content was forwarded every failure is a stream failure, except timeouts
    fn streaming_error(err: BackendError) -> GatewayError {
        match err {
            BackendError::Timeout { elapsed_ms } => GatewayError::UpstreamTimeout { timeout_ms: elapsed_ms },
            BackendError::Stream { message } => GatewayError::UpstreamStream { message },
            other => GatewayError::stream(other.to_string()),
        }
    }

    /// Forward one event; returns `true` once the terminal event was delivered
    async fn forward(
        &self,
        session: &mut StreamSession,
        event: UpstreamEvent,
        tx: &mpsc::Sender<ClientEvent>,
    ) -> GatewayResult<bool> {
        match event {
            UpstreamEvent::Fragment(answer) => {
                if answer.is_empty() {
                    return Ok(false);
                }
                let bytes = answer.len();
                tx.send(ClientEvent::Message { answer })
                    .await
                    .map_err(|_| GatewayError::ClientDisconnected)?;
                session.record_chunk(bytes);
                gateway_metrics::record_chunk_forwarded(bytes);
                Ok(false)
            }
            UpstreamEvent::MessageEnd { conversation_id } => {
                session.resolve_conversation(conversation_id.clone());
                tx.send(ClientEvent::MessageEnd { conversation_id })
                    .await
                    .map_err(|_| GatewayError::ClientDisconnected)?;
                session.transition(SessionState::Done)?;
                Ok(true)
            }
        }
    }
}
