//! # Redis Cache Store
//!
//! This module provides a Redis-based cache store so several gateway instances can
//! share one read cache. Every operation is bounded by `operation_timeout`: an
//! unavailable Redis must slow a request down by at most that much.

use super::{CacheStore, CacheStoreStats};
use crate::caching::{CacheError, CacheResult};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, RedisResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Redis cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisCacheConfig {
    /// Redis connection URL
    pub url: String,

    /// Key prefix for all cache entries
    pub key_prefix: String,

    /// Upper bound for a single Redis round trip
    pub operation_timeout: Duration,

    /// Maximum number of retries of a failed operation
    pub max_retries: u32,

    /// Delay between retries
    pub retry_delay: Duration,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "gateway:cache:".to_string(),
            operation_timeout: Duration::from_millis(250),
            max_retries: 1,
            retry_delay: Duration::from_millis(50),
        }
    }
}

/// Redis cache implementation
pub struct RedisCache {
    config: RedisCacheConfig,

    /// Reconnects on its own; cheap to clone per operation
    connection_manager: ConnectionManager,

    hits: AtomicU64,
    misses: AtomicU64,
    connection_errors: AtomicU64,
    timeouts: AtomicU64,
}

/// Escape Redis glob metacharacters so a literal prefix can be used in `SCAN MATCH`
fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl RedisCache {
    /// Create a new Redis cache
    pub async fn new(config: RedisCacheConfig) -> CacheResult<Self> {
        let client = Client::open(config.url.as_str())?;

        let connection_manager =
            match tokio::time::timeout(config.operation_timeout * 4, ConnectionManager::new(client)).await {
                Ok(result) => result?,
                Err(_) => return Err(CacheError::Timeout),
            };

        info!("Redis cache connected to {}", config.url);

        Ok(Self {
            config,
            connection_manager,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        })
    }

    /// Get the full cache key with prefix
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Execute a Redis operation with timeout and retry
    async fn execute_with_retry<F, Fut, T>(&self, operation: F) -> CacheResult<T>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let mut retries = 0;

        loop {
            let conn = self.connection_manager.clone();

            let error = match tokio::time::timeout(self.config.operation_timeout, operation(conn)).await {
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(e)) => {
                    self.connection_errors.fetch_add(1, Ordering::Relaxed);
                    CacheError::Redis(e)
                }
                Err(_) => {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    CacheError::Timeout
                }
            };

            if retries >= self.config.max_retries {
                return Err(error);
            }

            retries += 1;
            warn!("Redis operation failed (attempt {}): {}", retries, error);
            tokio::time::sleep(self.config.retry_delay * retries).await;
        }
    }

    /// Collect every key matching a glob pattern with SCAN
    async fn scan_keys(&self, pattern: String) -> CacheResult<Vec<String>> {
        self.execute_with_retry(|mut conn| {
            let pattern = pattern.clone();
            async move {
                let mut cursor: u64 = 0;
                let mut all_keys = Vec::new();

                loop {
                    let (new_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(1000)
                        .query_async(&mut conn)
                        .await?;

                    all_keys.extend(keys);

                    if new_cursor == 0 {
                        break;
                    }
                    cursor = new_cursor;
                }

                Ok(all_keys)
            }
        })
        .await
    }

    async fn delete_keys(&self, keys: Vec<String>) -> CacheResult<usize> {
        let mut deleted = 0usize;
        for chunk in keys.chunks(500) {
            let chunk = chunk.to_vec();
            let count: i64 = self
                .execute_with_retry(|mut conn| {
                    let chunk = chunk.clone();
                    async move { redis::cmd("DEL").arg(&chunk).query_async(&mut conn).await }
                })
                .await?;
            deleted += count.max(0) as usize;
        }
        Ok(deleted)
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(self.get_with_ttl(key).await?.map(|(value, _)| value))
    }

    async fn get_with_ttl(&self, key: &str) -> CacheResult<Option<(Vec<u8>, Option<Duration>)>> {
        let full_key = self.full_key(key);

        let result: CacheResult<(Option<Vec<u8>>, i64)> = self
            .execute_with_retry(|mut conn| {
                let full_key = full_key.clone();
                async move {
                    redis::pipe()
                        .cmd("GET")
                        .arg(&full_key)
                        .cmd("PTTL")
                        .arg(&full_key)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await;

        match result {
            Ok((Some(value), pttl)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Redis cache hit for key: {}", key);
                // PTTL: -1 means no expiry
                let ttl = (pttl >= 0).then(|| Duration::from_millis(pttl as u64));
                Ok(Some((value, ttl)))
            }
            Ok((None, _)) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Redis cache miss for key: {}", key);
                Ok(None)
            }
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()> {
        let full_key = self.full_key(key);
        let value = value.to_vec();
        // Redis rejects PX 0; a zero TTL entry would be absent anyway
        let ttl_ms = ttl.map(|ttl| ttl.as_millis().max(1) as u64);

        self.execute_with_retry(|mut conn| {
            let full_key = full_key.clone();
            let value = value.clone();
            async move {
                let mut cmd = redis::cmd("SET");
                cmd.arg(&full_key).arg(&value);
                if let Some(ms) = ttl_ms {
                    cmd.arg("PX").arg(ms);
                }
                cmd.query_async::<_, ()>(&mut conn).await
            }
        })
        .await?;

        debug!("Set Redis cache key: {} with TTL: {:?}", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let deleted = self.delete_keys(vec![self.full_key(key)]).await?;
        if deleted > 0 {
            debug!("Deleted Redis cache key: {}", key);
        }
        Ok(deleted > 0)
    }

    async fn delete_by_prefix(&self, prefix: &str) -> CacheResult<usize> {
        let pattern = format!("{}*", escape_glob(&self.full_key(prefix)));
        let keys = self.scan_keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let deleted = self.delete_keys(keys).await?;
        debug!("Deleted {} Redis cache keys with prefix: {}", deleted, prefix);
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let full_key = self.full_key(key);

        let count: i64 = self
            .execute_with_retry(|mut conn| {
                let full_key = full_key.clone();
                async move { redis::cmd("EXISTS").arg(&full_key).query_async(&mut conn).await }
            })
            .await?;

        Ok(count > 0)
    }

    async fn clear(&self) -> CacheResult<()> {
        let pattern = format!("{}*", escape_glob(&self.config.key_prefix));
        let keys = self.scan_keys(pattern).await?;

        if !keys.is_empty() {
            let deleted = self.delete_keys(keys).await?;
            info!("Cleared {} keys from Redis cache", deleted);
        }

        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStoreStats> {
        let info: String = self
            .execute_with_retry(|mut conn| async move {
                redis::cmd("INFO").arg("memory").query_async(&mut conn).await
            })
            .await
            .unwrap_or_default();

        let memory_usage = info
            .lines()
            .find(|line| line.starts_with("used_memory:"))
            .and_then(|line| line.split(':').nth(1))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);

        let pattern = format!("{}*", escape_glob(&self.config.key_prefix));
        let entries = self.scan_keys(pattern).await.map(|keys| keys.len()).unwrap_or(0);

        Ok(CacheStoreStats {
            entries,
            memory_usage,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: 0,        // Redis handles eviction internally
            expired_cleanups: 0, // Redis handles TTL cleanup internally
        })
    }

    async fn health_check(&self) -> CacheResult<bool> {
        let result: CacheResult<String> = self
            .execute_with_retry(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
            .await;

        match result {
            Ok(response) => Ok(response == "PONG"),
            Err(_) => Ok(false),
        }
    }
}
