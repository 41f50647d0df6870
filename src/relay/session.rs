//! Relay session state machine.
//!
//! ```text
//! INIT -> CONNECTING -> STREAMING -> DONE
//!             |   ^
//!             v   |          (at most once, before any chunk)
//!           RETRYING
//!
//! any non-terminal state -> FAILED
//! ```

use crate::core::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::error;
use uuid::Uuid;

/// Upper bound of conversation-continuity retries per session
pub const MAX_CONVERSATION_RETRIES: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Init,
    Connecting,
    Retrying,
    Streaming,
    Done,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Connecting => "CONNECTING",
            Self::Retrying => "RETRYING",
            Self::Streaming => "STREAMING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Init, Connecting) => true,
            (Connecting, Streaming) | (Connecting, Retrying) => true,
            (Retrying, Connecting) => true,
            (Streaming, Done) => true,
            (current, Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request relay bookkeeping
#[derive(Debug)]
pub struct StreamSession {
    id: Uuid,
    requested_conversation_id: Option<String>,
    conversation_id: Option<String>,
    state: SessionState,
    retries_used: u8,
    chunks_forwarded: u64,
    bytes_forwarded: u64,
    started_at: Instant,
}

impl StreamSession {
    pub fn new(conversation_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            requested_conversation_id: conversation_id.clone(),
            conversation_id,
            state: SessionState::Init,
            retries_used: 0,
            chunks_forwarded: 0,
            bytes_forwarded: 0,
            started_at: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn retries_used(&self) -> u8 {
        self.retries_used
    }

    pub fn chunks_forwarded(&self) -> u64 {
        self.chunks_forwarded
    }

    /// Conversation id the client supplied
    pub fn requested_conversation_id(&self) -> Option<&str> {
        self.requested_conversation_id.as_deref()
    }

    /// Conversation id currently in use, `None` once a retry started a new one
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Move to `next`, rejecting transitions the state machine does not allow
    pub fn transition(&mut self, next: SessionState) -> GatewayResult<()> {
        if !self.state.can_transition_to(next) {
            error!(
                session_id = %self.id,
                from = %self.state,
                to = %next,
                "Illegal relay state transition"
            );
            return Err(GatewayError::internal(format!(
                "illegal relay state transition {} -> {}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Whether a conversation-continuity retry is still allowed
    pub fn can_retry(&self) -> bool {
        self.state == SessionState::Connecting
            && self.retries_used < MAX_CONVERSATION_RETRIES
            && self.chunks_forwarded == 0
    }

    /// CONNECTING -> RETRYING, dropping the conversation id
    pub fn begin_retry(&mut self) -> GatewayResult<()> {
        if !self.can_retry() {
            error!(
                session_id = %self.id,
                state = %self.state,
                retries_used = self.retries_used,
                chunks_forwarded = self.chunks_forwarded,
                "Conversation retry attempted when not allowed"
            );
            return Err(GatewayError::internal("conversation retry attempted when not allowed"));
        }
        self.transition(SessionState::Retrying)?;
        self.retries_used += 1;
        self.conversation_id = None;
        Ok(())
    }

    pub fn record_chunk(&mut self, bytes: usize) {
        self.chunks_forwarded += 1;
        self.bytes_forwarded += bytes as u64;
    }

    pub fn resolve_conversation(&mut self, conversation_id: String) {
        self.conversation_id = Some(conversation_id);
    }

    /// Move to FAILED unless the session already ended
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Failed;
        }
    }

    pub fn report(&self, error: Option<GatewayError>) -> SessionReport {
        SessionReport {
            session_id: self.id,
            state: self.state,
            conversation_id: self.conversation_id.clone(),
            retries_used: self.retries_used,
            chunks_forwarded: self.chunks_forwarded,
            bytes_forwarded: self.bytes_forwarded,
            duration: self.started_at.elapsed(),
            error,
        }
    }
}

/// Outcome of one relay session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub state: SessionState,
    /// Resolved conversation id on success
    pub conversation_id: Option<String>,
    pub retries_used: u8,
    pub chunks_forwarded: u64,
    pub bytes_forwarded: u64,
    pub duration: Duration,
    pub error: Option<GatewayError>,
}
