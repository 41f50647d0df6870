//! # Error Handling Module
//!
//! This module provides error handling for the AI gateway using the `thiserror` crate.
//! It defines every failure the gateway layer can observe, the machine-readable code
//! each one is reported under on the client stream, and the HTTP status used by the
//! non-streaming endpoints.
//!
//! ## Error Categories
//!
//! - **Transient upstream** (timeouts, connection resets): surfaced to the client as a
//!   retryable error, never retried automatically beyond the single conversation retry
//! - **Upstream semantic rejection** (unknown conversation): recovered locally by the
//!   relay with one fresh-conversation retry
//! - **Cache/store unavailability**: never surfaced; see [`crate::caching::NonCritical`]
//! - **Client disconnect**: not an error for reporting purposes, silent cleanup
//! - **Contract violations**: state-machine bugs, logged loudly as `Internal`
//!
//! ## The `?` Operator
//!
//! Every fallible gateway operation returns [`GatewayResult<T>`], so errors from
//! lower layers propagate with `?` once a `From` conversion exists:
//! ```rust,ignore
//! async fn load(path: &str) -> GatewayResult<GatewayConfig> {
//!     let content = tokio::fs::read_to_string(path).await?; // io::Error -> GatewayError
//!     let config = serde_yaml::from_str(&content)?;          // serde_yaml::Error -> GatewayError
//!     Ok(config)
//! }
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error types for the AI gateway
///
/// `Clone` is required: a single failed computation in the request deduplicator is
/// delivered to every caller that joined it.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Connection refused, DNS failure or any other failure to reach the upstream
    #[error("Upstream unreachable: {reason}")]
    UpstreamUnreachable { reason: String },

    /// The overall deadline of an upstream call elapsed
    #[error("Upstream timeout after {timeout_ms}ms")]
    UpstreamTimeout { timeout_ms: u64 },

    /// The upstream does not know the supplied conversation identifier
    #[error("Upstream rejected conversation: {conversation_id}")]
    UpstreamRejectedConversation { conversation_id: String },

    /// The upstream stream failed after it had started
    #[error("Upstream stream error: {message}")]
    UpstreamStream { message: String },

    /// The upstream answered the call with an error status
    #[error("Upstream returned status {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    /// The client went away while a session was running
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Request validation errors (missing query, malformed body, etc.)
    #[error("Request validation failed: {field} - {reason}")]
    RequestValidation { field: String, reason: String },

    /// Cache layer failures that were allowed to propagate
    #[error("Cache error: {message}")]
    Cache { message: String },

    /// Internal server errors for unexpected failures and contract violations
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, sockets, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },
}

/// Machine-readable error codes carried by client-facing error events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UpstreamUnreachable,
    UpstreamTimeout,
    UpstreamRejectedConversation,
    UpstreamStreamError,
    UpstreamError,
    ClientDisconnected,
    InvalidRequest,
    ConfigurationError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpstreamUnreachable => "upstream_unreachable",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamRejectedConversation => "upstream_rejected_conversation",
            Self::UpstreamStreamError => "upstream_stream_error",
            Self::UpstreamError => "upstream_error",
            Self::ClientDisconnected => "client_disconnected",
            Self::InvalidRequest => "invalid_request",
            Self::ConfigurationError => "configuration_error",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an unreachable-upstream error
    pub fn unreachable<S: Into<String>>(reason: S) -> Self {
        Self::UpstreamUnreachable {
            reason: reason.into(),
        }
    }

    /// Create a mid-stream upstream error
    pub fn stream<S: Into<String>>(message: S) -> Self {
        Self::UpstreamStream {
            message: message.into(),
        }
    }

    /// Create a validation error for a named request field
    pub fn validation<F: Into<String>, S: Into<String>>(field: F, reason: S) -> Self {
        Self::RequestValidation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// The code this error is reported under on the client stream
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Configuration { .. } => ErrorCode::ConfigurationError,
            Self::UpstreamUnreachable { .. } => ErrorCode::UpstreamUnreachable,
            Self::UpstreamTimeout { .. } => ErrorCode::UpstreamTimeout,
            Self::UpstreamRejectedConversation { .. } => ErrorCode::UpstreamRejectedConversation,
            Self::UpstreamStream { .. } => ErrorCode::UpstreamStreamError,
            Self::UpstreamStatus { .. } => ErrorCode::UpstreamError,
            Self::ClientDisconnected => ErrorCode::ClientDisconnected,
            Self::RequestValidation { .. } | Self::Json { .. } => ErrorCode::InvalidRequest,
            Self::Cache { .. } | Self::Internal { .. } | Self::Io { .. } | Self::Yaml { .. } => {
                ErrorCode::InternalError
            }
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UpstreamUnreachable { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamRejectedConversation { .. } => StatusCode::NOT_FOUND,
            Self::UpstreamStream { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamStatus { .. } => StatusCode::BAD_GATEWAY,
            // nginx convention for "client closed request"
            Self::ClientDisconnected => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::RequestValidation { .. } => StatusCode::BAD_REQUEST,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Cache { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if the caller may retry the whole request
    ///
    /// The relay itself never retries these; the single conversation retry is
    /// governed by the session state machine.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnreachable { .. }
                | Self::UpstreamTimeout { .. }
                | Self::UpstreamStream { .. }
                | Self::Io { .. }
        )
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

/// Convert errors into structured JSON responses for the non-streaming endpoints
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": self.error_code().as_str(),
                "message": self.to_string(),
                "retryable": self.is_retryable(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            GatewayError::unreachable("connection refused").error_code().as_str(),
            "upstream_unreachable"
        );
        assert_eq!(
            GatewayError::UpstreamTimeout { timeout_ms: 100 }.error_code().as_str(),
            "upstream_timeout"
        );
        assert_eq!(
            GatewayError::UpstreamRejectedConversation {
                conversation_id: "c1".to_string()
            }
            .error_code()
            .as_str(),
            "upstream_rejected_conversation"
        );
        assert_eq!(GatewayError::stream("reset").error_code().as_str(), "upstream_stream_error");
        assert_eq!(GatewayError::ClientDisconnected.error_code().as_str(), "client_disconnected");
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::UpstreamTimeout { timeout_ms: 5000 }.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::validation("query", "must not be empty").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(GatewayError::ClientDisconnected.status_code().as_u16(), 499);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(GatewayError::unreachable("dns").is_retryable());
        assert!(GatewayError::UpstreamTimeout { timeout_ms: 5000 }.is_retryable());
        assert!(!GatewayError::internal("bug").is_retryable());
        assert!(!GatewayError::UpstreamRejectedConversation {
            conversation_id: "c1".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_error_code_serializes_snake_case() {
        let value = serde_json::to_value(ErrorCode::UpstreamStreamError).unwrap();
        assert_eq!(value, serde_json::json!("upstream_stream_error"));
    }
}
