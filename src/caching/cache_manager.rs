//! # Cache Manager
//!
//! The cache manager coordinates between different cache levels (in-memory and Redis)
//! and provides a unified interface for caching operations.
//!
//! A failing tier never takes the other one down: reads fall through to the next
//! tier, writes and deletes are attempted on every tier and report a combined error.

use super::stores::{InMemoryCacheConfig, RedisCacheConfig};
use super::{CacheError, CacheResult, CacheStore, CacheStoreStats, InMemoryCache, NonCritical, RedisCache};
use crate::observability::metrics as gateway_metrics;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL used when the caller has no better value; kept short on purpose,
    /// freshness comes from write-event invalidation
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Treat a TTL of zero as "never expires" instead of "do not cache"
    pub zero_ttl_never_expires: bool,

    /// Maximum cache key length
    pub max_key_length: usize,

    /// In-memory tier (L1)
    pub in_memory: InMemoryTierConfig,

    /// Redis tier (L2)
    pub redis: RedisTierConfig,

    /// Enable cache statistics
    pub enable_stats: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryTierConfig {
    pub enabled: bool,

    /// Maximum number of entries
    pub max_entries: usize,

    /// Cleanup interval for expired entries
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisTierConfig {
    pub enabled: bool,

    /// Redis connection URL
    pub url: String,

    /// Key prefix for all cache entries
    pub key_prefix: String,

    /// Upper bound for a single Redis round trip
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            zero_ttl_never_expires: false,
            max_key_length: 250,
            in_memory: InMemoryTierConfig::default(),
            redis: RedisTierConfig::default(),
            enable_stats: true,
        }
    }
}

impl Default for InMemoryTierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl Default for RedisTierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://localhost:6379".to_string(),
            key_prefix: "gateway:cache:".to_string(),
            operation_timeout: Duration::from_millis(250),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Reads answered from any tier
    pub hits: u64,

    /// Reads that found nothing in any tier
    pub misses: u64,

    /// Cache hit ratio
    pub hit_ratio: f64,

    /// Total cache operations
    pub operations: u64,

    /// In-memory tier statistics
    pub memory: Option<CacheStoreStats>,

    /// Redis tier statistics
    pub redis: Option<CacheStoreStats>,

    /// Statistics collection start time
    pub start_time: chrono::DateTime<chrono::Utc>,
}

/// Multi-level cache manager
pub struct CacheManager {
    config: CacheConfig,

    /// In-memory cache (L1)
    memory_cache: Option<Arc<dyn CacheStore>>,

    /// Redis cache (L2)
    redis_cache: Option<Arc<dyn CacheStore>>,

    hits: AtomicU64,
    misses: AtomicU64,
    operations: AtomicU64,
    start_time: parking_lot::Mutex<chrono::DateTime<chrono::Utc>>,

    /// Bumped before every delete, prefix delete and clear. An L2 read only
    /// back-fills L1 if no invalidation started while it was in flight.
    invalidation_generation: AtomicU64,
}

impl CacheManager {
    /// Create a new cache manager.
    ///
    /// An unreachable Redis does not fail startup while the in-memory tier is
    /// enabled; the manager runs with L1 only.
    pub async fn new(config: CacheConfig) -> CacheResult<Self> {
        let mut memory_cache: Option<Arc<dyn CacheStore>> = None;
        let mut redis_cache: Option<Arc<dyn CacheStore>> = None;

        if config.in_memory.enabled {
            let memory_config = InMemoryCacheConfig {
                max_entries: config.in_memory.max_entries,
                cleanup_interval: config.in_memory.cleanup_interval,
            };
            memory_cache = Some(Arc::new(InMemoryCache::new(memory_config)));
            info!("In-memory cache initialized with max {} entries", config.in_memory.max_entries);
        }

        if config.redis.enabled {
            let redis_config = RedisCacheConfig {
                url: config.redis.url.clone(),
                key_prefix: config.redis.key_prefix.clone(),
                operation_timeout: config.redis.operation_timeout,
                ..Default::default()
            };
            match RedisCache::new(redis_config).await {
                Ok(redis) => {
                    redis_cache = Some(Arc::new(redis));
                    info!("Redis cache initialized at {}", config.redis.url);
                }
                Err(e) if memory_cache.is_some() => {
                    warn!("Redis cache unavailable at {}, continuing with in-memory cache only: {}", config.redis.url, e);
                }
                Err(e) => return Err(e),
            }
        }

        Self::from_stores(config, memory_cache, redis_cache)
    }

    /// Build a manager over already constructed stores
    pub fn from_stores(
        config: CacheConfig,
        memory_cache: Option<Arc<dyn CacheStore>>,
        redis_cache: Option<Arc<dyn CacheStore>>,
    ) -> CacheResult<Self> {
        if memory_cache.is_none() && redis_cache.is_none() {
            return Err(CacheError::Configuration {
                message: "At least one cache level must be enabled".to_string(),
            });
        }

        Ok(Self {
            config,
            memory_cache,
            redis_cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            operations: AtomicU64::new(0),
            start_time: parking_lot::Mutex::new(chrono::Utc::now()),
            invalidation_generation: AtomicU64::new(0),
        })
    }

    /// Get a value from cache
    pub async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.validate_key(key)?;

        let result = self.get_internal(key).await;
        if self.config.enable_stats {
            self.operations.fetch_add(1, Ordering::Relaxed);
            match &result {
                Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
                None => self.misses.fetch_add(1, Ordering::Relaxed),
            };
        }
        if result.is_none() {
            gateway_metrics::record_cache_miss();
        }

        Ok(result)
    }

    /// Get and deserialize a JSON value
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Set a value in cache.
    ///
    /// A zero TTL stores a non-expiring entry when `zero_ttl_never_expires` is set
    /// and is otherwise a no-op.
    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.validate_key(key)?;
        self.count_operation();

        let ttl = if ttl.is_zero() {
            if !self.config.zero_ttl_never_expires {
                debug!("Skipping cache store for key {} with zero TTL", key);
                return Ok(());
            }
            None
        } else {
            Some(ttl)
        };

        let mut errors = Vec::new();

        if let Some(memory_cache) = &self.memory_cache {
            if let Err(e) = memory_cache.set(key, value, ttl).await {
                errors.push(format!("Memory cache set error: {}", e));
            }
        }

        if let Some(redis_cache) = &self.redis_cache {
            if let Err(e) = redis_cache.set(key, value, ttl).await {
                errors.push(format!("Redis cache set error: {}", e));
            }
        }

        if !errors.is_empty() {
            return Err(CacheError::Store {
                message: errors.join("; "),
            });
        }

        debug!("Cached key: {} with TTL: {:?}", key, ttl);
        Ok(())
    }

    /// Serialize a value as JSON and store it
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> CacheResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, &bytes, ttl).await
    }

    /// Delete a value from every tier. Idempotent.
    ///
    /// Fails if any tier could not be reached, since that tier may still hold the entry.
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.validate_key(key)?;
        self.count_operation();
        self.begin_invalidation();

        let mut deleted = false;
        let mut errors = Vec::new();

        for store in self.stores() {
            match store.delete(key).await {
                Ok(was_deleted) => deleted |= was_deleted,
                Err(e) => errors.push(format!("{} cache delete error: {}", store.name(), e)),
            }
        }

        if !errors.is_empty() {
            return Err(CacheError::Store {
                message: errors.join("; "),
            });
        }

        if deleted {
            debug!("Deleted key from cache: {}", key);
        }
        Ok(deleted)
    }

    /// Delete every entry whose key starts with `prefix` from every tier
    pub async fn delete_by_prefix(&self, prefix: &str) -> CacheResult<usize> {
        if prefix.is_empty() {
            return Err(CacheError::InvalidKey {
                message: "Prefix cannot be empty; use clear() to flush the cache".to_string(),
            });
        }
        self.count_operation();
        self.begin_invalidation();

        let mut removed = 0;
        let mut errors = Vec::new();

        for store in self.stores() {
            match store.delete_by_prefix(prefix).await {
                Ok(count) => removed = removed.max(count),
                Err(e) => errors.push(format!("{} cache prefix delete error: {}", store.name(), e)),
            }
        }

        if !errors.is_empty() {
            return Err(CacheError::Store {
                message: errors.join("; "),
            });
        }

        debug!("Deleted {} keys with prefix: {}", removed, prefix);
        Ok(removed)
    }

    /// Check if a key exists in cache
    pub async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.validate_key(key)?;

        for store in self.stores() {
            if store.exists(key).await.non_critical("exists", key) == Some(true) {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Clear all cache entries
    pub async fn clear(&self) -> CacheResult<()> {
        self.begin_invalidation();
        let mut errors = Vec::new();

        for store in self.stores() {
            if let Err(e) = store.clear().await {
                errors.push(format!("{} cache clear error: {}", store.name(), e));
            }
        }

        if !errors.is_empty() {
            return Err(CacheError::Store {
                message: errors.join("; "),
            });
        }

        info!("All cache levels cleared");
        Ok(())
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);

        let memory = match &self.memory_cache {
            Some(store) => store.stats().await.non_critical("stats", "memory"),
            None => None,
        };
        let redis = match &self.redis_cache {
            Some(store) => store.stats().await.non_critical("stats", "redis"),
            None => None,
        };

        CacheStats {
            hits,
            misses,
            hit_ratio: if hits + misses > 0 {
                hits as f64 / (hits + misses) as f64
            } else {
                0.0
            },
            operations: self.operations.load(Ordering::Relaxed),
            memory,
            redis,
            start_time: *self.start_time.lock(),
        }
    }

    /// Reset cache statistics
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.operations.store(0, Ordering::Relaxed);
        *self.start_time.lock() = chrono::Utc::now();
        info!("Cache statistics reset");
    }

    /// Get cache configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    /// Check if every configured tier is healthy
    pub async fn health_check(&self) -> CacheResult<bool> {
        let mut healthy = true;

        for store in self.stores() {
            if store.health_check().await.non_critical("health_check", store.name()) != Some(true) {
                healthy = false;
                warn!("{} cache health check failed", store.name());
            }
        }

        Ok(healthy)
    }

    fn stores(&self) -> impl Iterator<Item = &Arc<dyn CacheStore>> {
        self.memory_cache.iter().chain(self.redis_cache.iter())
    }

    fn begin_invalidation(&self) {
        self.invalidation_generation.fetch_add(1, Ordering::AcqRel);
    }

    fn count_operation(&self) {
        if self.config.enable_stats {
            self.operations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// L1 first, then L2; an L2 hit back-fills L1
    async fn get_internal(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(memory_cache) = &self.memory_cache {
            if let Some(value) = memory_cache.get(key).await.non_critical("get", key).flatten() {
                debug!("Cache hit in memory cache for key: {}", key);
                gateway_metrics::record_cache_hit(memory_cache.name());
                return Some(value);
            }
        }

        if let Some(redis_cache) = &self.redis_cache {
            let generation = self.invalidation_generation.load(Ordering::Acquire);
            if let Some((value, remaining)) = redis_cache.get_with_ttl(key).await.non_critical("get", key).flatten() {
                debug!("Cache hit in Redis cache for key: {}", key);
                gateway_metrics::record_cache_hit(redis_cache.name());

                if let Some(memory_cache) = &self.memory_cache {
                    self.backfill(memory_cache, key, &value, remaining, generation).await;
                }

                return Some(value);
            }
        }

        debug!("Cache miss for key: {}", key);
        None
    }

    /// Copy an L2 hit into L1 unless an invalidation started after `generation`
    async fn backfill(
        &self,
        memory_cache: &Arc<dyn CacheStore>,
        key: &str,
        value: &[u8],
        remaining: Option<Duration>,
        generation: u64,
    ) {
        let backfill_ttl = match remaining {
            Some(remaining) => remaining.min(self.config.default_ttl),
            None => self.config.default_ttl,
        };
        if backfill_ttl.is_zero() {
            return;
        }

        if self.invalidation_generation.load(Ordering::Acquire) != generation {
            debug!("Invalidation during L2 read, skipping back-fill for key: {}", key);
            return;
        }

        memory_cache
            .set(key, value, Some(backfill_ttl))
            .await
            .non_critical("backfill", key);

        // An invalidation may have cleared L1 between the check and the store
        if self.invalidation_generation.load(Ordering::Acquire) != generation {
            debug!("Invalidation raced the back-fill, removing key from L1: {}", key);
            memory_cache.delete(key).await.non_critical("delete", key);
        }
    }

    /// Validate cache key
    fn validate_key(&self, key: &str) -> CacheResult<()> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey {
                message: "Cache key cannot be empty".to_string(),
            });
        }

        if key.len() > self.config.max_key_length {
            return Err(CacheError::InvalidKey {
                message: format!(
                    "Cache key length {} exceeds maximum {}",
                    key.len(),
                    self.config.max_key_length
                ),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::time::advance;

    /// A store whose every operation fails, standing in for an unreachable backend
    struct UnavailableStore;

    #[async_trait]
    impl CacheStore for UnavailableStore {
        fn name(&self) -> &'static str {
            "unavailable"
        }
        async fn get(&self, _key: &str) -> CacheResult<Option<Vec<u8>>> {
            Err(CacheError::Unavailable)
        }
        async fn get_with_ttl(&self, _key: &str) -> CacheResult<Option<(Vec<u8>, Option<Duration>)>> {
            Err(CacheError::Unavailable)
        }
        async fn set(&self, _key: &str, _value: &[u8], _ttl: Option<Duration>) -> CacheResult<()> {
            Err(CacheError::Unavailable)
        }
        async fn delete(&self, _key: &str) -> CacheResult<bool> {
            Err(CacheError::Unavailable)
        }
        async fn delete_by_prefix(&self, _prefix: &str) -> CacheResult<usize> {
            Err(CacheError::Unavailable)
        }
        async fn exists(&self, _key: &str) -> CacheResult<bool> {
            Err(CacheError::Unavailable)
        }
        async fn clear(&self) -> CacheResult<()> {
            Err(CacheError::Unavailable)
        }
        async fn stats(&self) -> CacheResult<CacheStoreStats> {
            Err(CacheError::Unavailable)
        }
        async fn health_check(&self) -> CacheResult<bool> {
            Err(CacheError::Unavailable)
        }
    }

    /// In-memory store whose first `get_with_ttl` pauses after reading until released
    struct GatedStore {
        inner: InMemoryCache,
        armed: std::sync::atomic::AtomicBool,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    impl GatedStore {
        fn new() -> Self {
            Self {
                inner: InMemoryCache::new(InMemoryCacheConfig::default()),
                armed: std::sync::atomic::AtomicBool::new(true),
                entered: tokio::sync::Notify::new(),
                release: tokio::sync::Notify::new(),
            }
        }
    }

    #[async_trait]
    impl CacheStore for GatedStore {
        fn name(&self) -> &'static str {
            "gated"
        }
        async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
            self.inner.get(key).await
        }
        async fn get_with_ttl(&self, key: &str) -> CacheResult<Option<(Vec<u8>, Option<Duration>)>> {
            let result = self.inner.get_with_ttl(key).await;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            result
        }
        async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()> {
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> CacheResult<bool> {
            self.inner.delete(key).await
        }
        async fn delete_by_prefix(&self, prefix: &str) -> CacheResult<usize> {
            self.inner.delete_by_prefix(prefix).await
        }
        async fn exists(&self, key: &str) -> CacheResult<bool> {
            self.inner.exists(key).await
        }
        async fn clear(&self) -> CacheResult<()> {
            self.inner.clear().await
        }
        async fn stats(&self) -> CacheResult<CacheStoreStats> {
            self.inner.stats().await
        }
        async fn health_check(&self) -> CacheResult<bool> {
            self.inner.health_check().await
        }
    }

    fn memory_store() -> Arc<dyn CacheStore> {
        Arc::new(InMemoryCache::new(InMemoryCacheConfig::default()))
    }

    #[tokio::test]
    async fn test_cache_manager_creation() {
        let cache_manager = CacheManager::new(CacheConfig::default()).await.unwrap();
        assert!(cache_manager.memory_cache.is_some());
        assert!(cache_manager.redis_cache.is_none());
    }

    #[tokio::test]
    async fn test_no_tier_enabled_is_rejected() {
        let result = CacheManager::from_stores(CacheConfig::default(), None, None);
        assert!(matches!(result, Err(CacheError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_redis_degrades_to_memory() {
        let mut config = CacheConfig::default();
        config.redis.enabled = true;
        config.redis.url = "redis://127.0.0.1:1".to_string();

        let cache_manager = CacheManager::new(config).await.unwrap();
        assert!(cache_manager.memory_cache.is_some());
        assert!(cache_manager.redis_cache.is_none());
    }

    #[tokio::test]
    async fn test_cache_operations() {
        let cache_manager = CacheManager::new(CacheConfig::default()).await.unwrap();

        let key = "daily_orders:u1:2024-05-01";
        cache_manager.set(key, b"test_value", Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache_manager.get(key).await.unwrap(), Some(b"test_value".to_vec()));
        assert!(cache_manager.exists(key).await.unwrap());

        assert!(cache_manager.delete(key).await.unwrap());
        assert!(!cache_manager.exists(key).await.unwrap());
        // Idempotent
        assert!(!cache_manager.delete(key).await.unwrap());
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        let cache_manager = CacheManager::new(CacheConfig::default()).await.unwrap();
        cache_manager
            .set_json("report:u1:today", &vec![1u32, 2, 3], Duration::from_secs(60))
            .await
            .unwrap();

        let value: Option<Vec<u32>> = cache_manager.get_json("report:u1:today").await.unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_boundary() {
        let cache_manager = CacheManager::new(CacheConfig::default()).await.unwrap();
        cache_manager.set("k", b"v", Duration::from_secs(30)).await.unwrap();

        advance(Duration::from_millis(29_999)).await;
        assert!(cache_manager.get("k").await.unwrap().is_some());

        advance(Duration::from_millis(2)).await;
        assert!(cache_manager.get("k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_policy() {
        let cache_manager = CacheManager::new(CacheConfig::default()).await.unwrap();
        cache_manager.set("k", b"v", Duration::ZERO).await.unwrap();
        assert!(cache_manager.get("k").await.unwrap().is_none());

        let config = CacheConfig {
            zero_ttl_never_expires: true,
            ..Default::default()
        };
        let cache_manager = CacheManager::new(config).await.unwrap();
        cache_manager.set("k", b"v", Duration::ZERO).await.unwrap();
        advance(Duration::from_secs(86_400)).await;
        assert_eq!(cache_manager.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_by_prefix() {
        let cache_manager = CacheManager::new(CacheConfig::default()).await.unwrap();
        let ttl = Duration::from_secs(60);
        cache_manager.set("daily_orders:u1:2024-05-01", b"a", ttl).await.unwrap();
        cache_manager.set("daily_orders:u1:2024-05-02", b"b", ttl).await.unwrap();
        cache_manager.set("daily_orders:u2:2024-05-01", b"c", ttl).await.unwrap();

        assert_eq!(cache_manager.delete_by_prefix("daily_orders:u1:").await.unwrap(), 2);
        assert!(cache_manager.get("daily_orders:u2:2024-05-01").await.unwrap().is_some());
        assert!(cache_manager.delete_by_prefix("").await.is_err());
    }

    #[tokio::test]
    async fn test_key_validation() {
        let config = CacheConfig {
            max_key_length: 10,
            ..Default::default()
        };
        let cache_manager = CacheManager::new(config).await.unwrap();

        assert!(matches!(cache_manager.get("").await, Err(CacheError::InvalidKey { .. })));
        let long_key = "a".repeat(20);
        assert!(cache_manager.get(&long_key).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_tier_falls_through() {
        let cache_manager = CacheManager::from_stores(
            CacheConfig::default(),
            Some(Arc::new(UnavailableStore)),
            Some(memory_store()),
        )
        .unwrap();

        // Set reports the failing tier but still writes the healthy one
        assert!(cache_manager.set("k", b"v", Duration::from_secs(60)).await.is_err());
        assert_eq!(cache_manager.get("k").await.unwrap(), Some(b"v".to_vec()));

        // Delete must not claim success while a tier may still hold the entry
        assert!(cache_manager.delete("k").await.is_err());
        assert!(!cache_manager.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_l2_hit_backfills_l1() {
        let l1 = memory_store();
        let l2 = memory_store();
        l2.set("k", b"v", Some(Duration::from_secs(300))).await.unwrap();

        let cache_manager =
            CacheManager::from_stores(CacheConfig::default(), Some(l1.clone()), Some(l2)).unwrap();

        assert_eq!(cache_manager.get("k").await.unwrap(), Some(b"v".to_vec()));
        let (_, ttl) = l1.get_with_ttl("k").await.unwrap().unwrap();
        assert!(ttl.unwrap() <= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_l2_read_in_flight_during_invalidation_does_not_backfill() {
        let l1 = memory_store();
        let l2 = Arc::new(GatedStore::new());
        l2.set("daily_orders:o1:d1", b"old", Some(Duration::from_secs(300)))
            .await
            .unwrap();

        let cache_manager = Arc::new(
            CacheManager::from_stores(CacheConfig::default(), Some(l1.clone()), Some(l2.clone() as Arc<dyn CacheStore>))
                .unwrap(),
        );

        let in_flight = {
            let cache_manager = cache_manager.clone();
            tokio::spawn(async move { cache_manager.get("daily_orders:o1:d1").await })
        };
        l2.entered.notified().await;

        cache_manager.delete_by_prefix("daily_orders:o1:").await.unwrap();
        l2.release.notify_one();

        // The read already in flight may still see the old value
        assert_eq!(in_flight.await.unwrap().unwrap(), Some(b"old".to_vec()));

        // but it must not have repopulated L1 behind the invalidation
        assert!(l1.get("daily_orders:o1:d1").await.unwrap().is_none());
        assert!(cache_manager.get("daily_orders:o1:d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_stats() {
        let cache_manager = CacheManager::new(CacheConfig::default()).await.unwrap();

        cache_manager.set("key1", b"value1", Duration::from_secs(60)).await.unwrap();
        cache_manager.get("key1").await.unwrap(); // Hit
        cache_manager.get("key2").await.unwrap(); // Miss

        let stats = cache_manager.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.operations, 3); // 1 set + 2 gets
        assert_eq!(stats.memory.unwrap().entries, 1);

        cache_manager.reset_stats();
        assert_eq!(cache_manager.stats().await.operations, 0);
    }
}
