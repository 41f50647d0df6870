//! # AI Gateway Library - Core Library Crate
//!
//! The real-time AI-gateway layer of a record-management backend. It relays a
//! conversational AI provider's incrementally generated answer to the client as a
//! live event stream, collapses concurrent identical reads into one computation,
//! and keeps a short-lived read cache that is invalidated when a write commits.
//!
//! ## Layout
//! - [`core`]: errors and configuration
//! - [`caching`]: cache tiers, keys, request deduplication, invalidation
//! - [`relay`]: the streaming relay state machine and the upstream adapter
//! - [`gateway`]: the facade request handlers call and its HTTP surface
//! - [`observability`]: logging and metrics

/// Error types and configuration shared by every other module
pub mod core;

/// Read cache, request deduplication and write-driven invalidation
pub mod caching;

/// Upstream conversation relay with the one-shot conversation retry
pub mod relay;

/// Gateway facade and HTTP server
pub mod gateway;

/// Structured logging and Prometheus metrics
pub mod observability;

// Re-export commonly used types so users can write `use ai_gateway::GatewayError`

/// Main error type used throughout the gateway
pub use core::error::{ErrorCode, GatewayError, GatewayResult};

/// Main configuration structure for the gateway
pub use core::config::GatewayConfig;

/// The entry point for request handlers
pub use gateway::{ChatStream, GatewayFacade, GatewayServer};

pub use caching::{CacheKey, CacheManager, CacheInvalidator, RequestDeduplicator};
pub use relay::{ClientEvent, ConversationBackend, ConversationRequest, StreamRelay};
