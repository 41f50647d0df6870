//! # Stream Relay Module
//!
//! Relays a conversational AI answer from the upstream provider to the client as a
//! live stream of discrete events.
//!
//! ## Components
//! - [`ConversationBackend`]: port to the provider, implemented over HTTP by
//!   [`HttpConversationBackend`]
//! - [`StreamSession`]: per-request state machine with the one-shot conversation retry
//! - [`StreamRelay`]: owns the upstream call and forwards fragments as they arrive
//! - [`ClientEvent`]: what the client receives (`message`, `message_end`, `error`)
//!
//! Dropping the client side of a relay channel aborts the upstream call.

pub mod backend;
pub mod events;
pub mod http_backend;
pub mod session;
pub mod stream_relay;

pub use backend::{BackendError, ConversationBackend, ConversationRequest, UpstreamEvent, UpstreamStream};
pub use events::ClientEvent;
pub use http_backend::HttpConversationBackend;
pub use session::{SessionReport, SessionState, StreamSession, MAX_CONVERSATION_RETRIES};
pub use stream_relay::StreamRelay;
