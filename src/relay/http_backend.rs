//! HTTP adapter for providers speaking the chat-messages streaming protocol.
//!
//! `POST {base_url}/chat-messages` with `response_mode: "streaming"` answers with
//! server-sent events whose `data:` lines are JSON objects tagged by `event`:
//! `message`/`agent_message` carry an `answer` fragment, `message_end` carries the
//! resolved `conversation_id`, and `error` reports a failure mid-stream. Other
//! events (`ping`, workflow progress, ...) are ignored.

use super::backend::{BackendError, ConversationBackend, ConversationRequest, UpstreamEvent, UpstreamStream};
use crate::core::config::UpstreamConfig;
use crate::core::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use serde_json::{json, Value};
use std::io;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

/// Longest SSE line accepted from the provider
const MAX_LINE_LENGTH: usize = 1024 * 1024;

pub struct HttpConversationBackend {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    connect_timeout_ms: u64,
}

impl HttpConversationBackend {
    pub fn new(config: &UpstreamConfig) -> GatewayResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| GatewayError::config(format!("Failed to build upstream HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat-messages", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            connect_timeout_ms: config.connect_timeout.as_millis() as u64,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn send_error(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout {
                elapsed_ms: self.connect_timeout_ms,
            }
        } else {
            BackendError::Unreachable {
                reason: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl ConversationBackend for HttpConversationBackend {
    async fn start_or_continue(&self, request: ConversationRequest) -> Result<UpstreamStream, BackendError> {
        let requested = request.conversation().map(str::to_string);
        let body = json!({
            "query": request.query,
            "user": request.user,
            "conversation_id": requested.as_deref().unwrap_or(""),
            "inputs": request.inputs,
            "response_mode": "streaming",
        });

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(header::ACCEPT, "text/event-stream")
            .json(&body);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        debug!(endpoint = %self.endpoint, conversation_id = ?requested, "Calling upstream");
        let response = builder.send().await.map_err(|e| self.send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text, requested.as_deref()));
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e)));
        let lines = FramedRead::new(
            StreamReader::new(bytes),
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        );

        let events = lines.filter_map(move |line| {
            let event = parse_line(line, requested.as_deref());
            async move { event }
        });

        Ok(events.boxed())
    }
}

/// Map an error status to a backend error.
///
/// Only a 404 naming the conversation, on a call that supplied one, counts as the
/// unknown-conversation signal; any other 404 is an ordinary rejection.
fn classify_status(status: StatusCode, body: &str, requested: Option<&str>) -> BackendError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let code = parsed["code"].as_str().unwrap_or_default();
    let message = parsed["message"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string());

    if status == StatusCode::NOT_FOUND {
        if let Some(conversation_id) = requested {
            if names_missing_conversation(code, &message) {
                return BackendError::ConversationNotFound {
                    conversation_id: conversation_id.to_string(),
                };
            }
        }
    }

    warn!(status = status.as_u16(), code, "Upstream rejected the request");
    BackendError::Rejected {
        status: status.as_u16(),
        message,
    }
}

fn names_missing_conversation(code: &str, message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    code == "conversation_not_exists" || (code == "not_found" && message.contains("conversation")) || message.contains("conversation not exist")
}

/// Turn one SSE line into an upstream event; `None` for lines carrying nothing relevant
fn parse_line(
    line: Result<String, LinesCodecError>,
    requested: Option<&str>,
) -> Option<Result<UpstreamEvent, BackendError>> {
    let line = match line {
        Ok(line) => line,
        Err(e) => {
            return Some(Err(BackendError::Stream {
                message: e.to_string(),
            }))
        }
    };

    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            return Some(Err(BackendError::Stream {
                message: format!("invalid event payload: {}", e),
            }))
        }
    };

    match value["event"].as_str()? {
        "message" | "agent_message" => {
            let answer = value["answer"].as_str().unwrap_or_default();
            (!answer.is_empty()).then(|| Ok(UpstreamEvent::Fragment(answer.to_string())))
        }
        "message_end" => Some(match value["conversation_id"].as_str() {
            Some(conversation_id) if !conversation_id.is_empty() => Ok(UpstreamEvent::MessageEnd {
                conversation_id: conversation_id.to_string(),
            }),
            _ => Err(BackendError::Stream {
                message: "message_end without conversation_id".to_string(),
            }),
        }),
        "error" => {
            let code = value["code"].as_str().unwrap_or_default();
            let message = value["message"].as_str().unwrap_or("upstream error");
            Some(Err(match requested {
                Some(conversation_id) if names_missing_conversation(code, message) => {
                    BackendError::ConversationNotFound {
                        conversation_id: conversation_id.to_string(),
                    }
                }
                _ => BackendError::Stream {
                    message: format!("{}: {}", code, message),
                },
            }))
        }
        _ => None,
    }
}
