//! Port to the upstream conversational AI provider.

use crate::core::error::GatewayError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One chat turn sent upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRequest {
    pub query: String,

    /// End-user identifier forwarded to the provider
    pub user: String,

    /// Conversation to continue; `None` starts a new one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,

    /// Provider-specific inputs, passed through untouched
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
}

impl ConversationRequest {
    pub fn new(query: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            user: user.into(),
            conversation_id: None,
            inputs: serde_json::Map::new(),
        }
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// The conversation id, treating an empty string as absent
    pub fn conversation(&self) -> Option<&str> {
        self.conversation_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// An item of the upstream answer stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// Incremental answer text
    Fragment(String),

    /// Logical end of the message, with the resolved conversation id
    MessageEnd { conversation_id: String },
}

/// Failures reported by a [`ConversationBackend`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The supplied conversation id is unknown upstream
    #[error("Conversation not found upstream: {conversation_id}")]
    ConversationNotFound { conversation_id: String },

    /// Connection refused, DNS failure and the like
    #[error("Upstream unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("Upstream timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The provider answered with an error status
    #[error("Upstream rejected the request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Transport or protocol failure while reading the stream
    #[error("Upstream stream error: {message}")]
    Stream { message: String },
}

impl From<BackendError> for GatewayError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::ConversationNotFound { conversation_id } => {
                GatewayError::UpstreamRejectedConversation { conversation_id }
            }
            BackendError::Unreachable { reason } => GatewayError::UpstreamUnreachable { reason },
            BackendError::Timeout { elapsed_ms } => GatewayError::UpstreamTimeout { timeout_ms: elapsed_ms },
            BackendError::Rejected { status, message } => GatewayError::UpstreamStatus { status, message },
            BackendError::Stream { message } => GatewayError::UpstreamStream { message },
        }
    }
}

pub type UpstreamStream = BoxStream<'static, Result<UpstreamEvent, BackendError>>;

/// Starts or continues a conversation and streams the answer.
///
/// Dropping the returned stream must abort the upstream call.
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    async fn start_or_continue(&self, request: ConversationRequest) -> Result<UpstreamStream, BackendError>;
}
