//! # Caching System Module
//!
//! This module provides the short-lived read cache of the gateway layer, the request
//! deduplicator that collapses concurrent identical computations, and the invalidator
//! that evicts cache entries when a write is committed.
//!
//! ## Features
//! - Multi-level caching (in-memory + optional Redis) with per-entry TTL
//! - Prefix deletion so a whole family of keys can be evicted per owner
//! - Single-flight request deduplication keyed by the same fingerprints as the cache
//! - Rule-driven, synchronous invalidation on write events
//! - Admin endpoints for cache management
//!
//! ## Failure Policy
//! Populating and invalidating the cache are *non-critical side effects*: they must
//! never fail the request that triggered them. Every such call goes through
//! [`NonCritical::non_critical`], which logs the failure and discards it, so the
//! gateway degrades to "always fetch fresh" instead of serving stale data or failing.
//!
//! ## Usage Example
//! ```rust,ignore
//! let cache_manager = CacheManager::new(CacheConfig::default()).await?;
//! let key = CacheKey::new("daily_orders", "owner-7", "2024-05-01");
//! cache_manager.set(key.as_str(), b"[...]", Duration::from_secs(30)).await?;
//! cache_manager.delete_by_prefix(&CacheKey::owner_prefix("daily_orders", "owner-7")).await?;
//! ```

pub mod admin;
pub mod cache_manager;
pub mod deduplication;
pub mod invalidation;
pub mod key_generator;
pub mod stores;

pub use admin::{CacheAdminRouter, CacheAdminState};
pub use cache_manager::{CacheConfig, CacheManager, CacheStats, InMemoryTierConfig, RedisTierConfig};
pub use deduplication::{DedupStats, RequestDeduplicator};
pub use invalidation::{
    CacheInvalidator, InvalidationEvent, InvalidationReport, InvalidationRule, InvalidationRuleConfig,
    InvalidationTarget, TargetTemplate,
};
pub use key_generator::{fingerprint, CacheKey};
pub use stores::{CacheEntry, CacheStore, CacheStoreStats, InMemoryCache, RedisCache};

use crate::core::error::GatewayError;
use crate::observability::metrics as gateway_metrics;
use tracing::warn;

/// Cache operation result
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache store error: {message}")]
    Store { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Invalid cache key: {message}")]
    InvalidKey { message: String },

    #[error("Cache configuration error: {message}")]
    Configuration { message: String },

    #[error("Cache operation timeout")]
    Timeout,

    #[error("Cache not available")]
    Unavailable,
}

impl From<CacheError> for GatewayError {
    fn from(err: CacheError) -> Self {
        GatewayError::Cache {
            message: err.to_string(),
        }
    }
}

/// Marks a cache operation as a non-critical side effect of the current request.
///
/// Failures are logged, counted and turned into `None`; they never reach the
/// primary request path.
pub trait NonCritical<T> {
    fn non_critical(self, operation: &'static str, key: &str) -> Option<T>;
}

impl<T> NonCritical<T> for CacheResult<T> {
    fn non_critical(self, operation: &'static str, key: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    operation,
                    key,
                    error = %e,
                    "Cache operation failed, continuing without cache"
                );
                gateway_metrics::record_cache_failure(operation);
                None
            }
        }
    }
}
