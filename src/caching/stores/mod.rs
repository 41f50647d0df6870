//! # Cache Stores Module
//!
//! This module provides the cache store implementations: a process-local in-memory
//! store and a Redis-backed store shared between gateway instances.

pub mod memory;
pub mod redis_store;

pub use memory::{InMemoryCache, InMemoryCacheConfig};
pub use redis_store::{RedisCache, RedisCacheConfig};

use super::CacheResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Cache entry with metadata
///
/// An entry is readable only while `now < stored_at + ttl`. A `ttl` of `None`
/// means the entry does not expire within the process lifetime.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached value
    pub value: Vec<u8>,

    /// When the entry was stored
    pub stored_at: Instant,

    /// Time to live, `None` for non-expiring entries
    pub ttl: Option<Duration>,

    /// Number of times this entry has been read
    pub access_count: u64,

    /// Last read (or write) instant, used for LRU eviction
    pub last_accessed: Instant,

    /// Approximate size of the entry in bytes
    pub size: usize,
}

impl CacheEntry {
    /// Create a new cache entry
    pub fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        let size = value.len() + std::mem::size_of::<Self>();

        Self {
            value,
            stored_at: now,
            ttl,
            access_count: 0,
            last_accessed: now,
            size,
        }
    }

    /// Check if the entry is expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Check expiry against a given instant
    pub fn is_expired_at(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now >= self.stored_at + ttl,
            None => false,
        }
    }

    /// Mark the entry as accessed
    pub fn mark_accessed(&mut self) {
        self.access_count += 1;
        self.last_accessed = Instant::now();
    }

    /// Time since the entry was stored
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.stored_at)
    }

    /// Time until expiration, `None` for non-expiring entries
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.ttl
            .map(|ttl| (self.stored_at + ttl).saturating_duration_since(Instant::now()))
    }
}

/// Trait for cache store implementations
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short name used in logs and stats
    fn name(&self) -> &'static str;

    /// Get a value from the cache; expired entries are absent
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Get a value together with its remaining time to live
    async fn get_with_ttl(&self, key: &str) -> CacheResult<Option<(Vec<u8>, Option<Duration>)>>;

    /// Set a value, overwriting any existing entry. `None` means no expiry.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()>;

    /// Delete a value from the cache. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Delete every entry whose key starts with `prefix`, returning how many were removed
    async fn delete_by_prefix(&self, prefix: &str) -> CacheResult<usize>;

    /// Check if an unexpired entry exists
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Clear all entries from the cache
    async fn clear(&self) -> CacheResult<()>;

    /// Get cache statistics
    async fn stats(&self) -> CacheResult<CacheStoreStats>;

    /// Perform health check
    async fn health_check(&self) -> CacheResult<bool>;
}

/// Cache store statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStoreStats {
    /// Number of entries
    pub entries: usize,

    /// Total memory usage in bytes
    pub memory_usage: usize,

    /// Number of hits
    pub hits: u64,

    /// Number of misses
    pub misses: u64,

    /// Number of evictions
    pub evictions: u64,

    /// Number of expired entries cleaned up
    pub expired_cleanups: u64,
}
