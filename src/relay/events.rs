//! Events delivered to the client of a relay session.

use crate::core::error::{ErrorCode, GatewayError};
use serde::{Deserialize, Serialize};

/// One discrete event of the client stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Content fragment
    Message { answer: String },

    /// Terminal event carrying the resolved conversation id
    MessageEnd { conversation_id: String },

    /// Terminal failure, distinguishable from content
    Error { code: ErrorCode, message: String },
}

impl ClientEvent {
    pub fn error(err: &GatewayError) -> Self {
        Self::Error {
            code: err.error_code(),
            message: err.to_string(),
        }
    }

    /// SSE event name
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::MessageEnd { .. } => "message_end",
            Self::Error { .. } => "error",
        }
    }

    /// SSE data payload
    pub fn data(&self) -> serde_json::Value {
        match self {
            Self::Message { answer } => serde_json::json!({ "answer": answer }),
            Self::MessageEnd { conversation_id } => serde_json::json!({ "conversation_id": conversation_id }),
            Self::Error { code, message } => serde_json::json!({ "code": code, "message": message }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Message { .. })
    }
}
