//! # In-Memory Cache Store
//!
//! This module provides the in-memory cache implementation with LRU eviction,
//! TTL support, and periodic cleanup of expired entries.

use super::{CacheEntry, CacheStore, CacheStoreStats};
use crate::caching::CacheResult;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, info};

/// In-memory cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryCacheConfig {
    /// Maximum number of entries before LRU eviction kicks in
    pub max_entries: usize,

    /// Interval of the background sweep removing expired entries
    pub cleanup_interval: Duration,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// In-memory cache implementation
pub struct InMemoryCache {
    config: InMemoryCacheConfig,

    entries: Arc<DashMap<String, CacheEntry>>,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_cleanups: Arc<AtomicU64>,

    /// Current memory usage estimate
    memory_usage: Arc<AtomicUsize>,

    cleanup_task: JoinHandle<()>,
}

impl InMemoryCache {
    /// Create a new in-memory cache. Must be called from within a Tokio runtime.
    pub fn new(config: InMemoryCacheConfig) -> Self {
        let entries = Arc::new(DashMap::new());
        let expired_cleanups = Arc::new(AtomicU64::new(0));
        let memory_usage = Arc::new(AtomicUsize::new(0));

        let cleanup_task = {
            let entries = entries.clone();
            let expired_cleanups = expired_cleanups.clone();
            let memory_usage = memory_usage.clone();
            let cleanup_interval = config.cleanup_interval;

            tokio::spawn(async move {
                let mut interval = interval(cleanup_interval);
                loop {
                    interval.tick().await;
                    Self::cleanup_expired_entries(&entries, &expired_cleanups, &memory_usage);
                }
            })
        };

        Self {
            config,
            entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_cleanups,
            memory_usage,
            cleanup_task,
        }
    }

    fn cleanup_expired_entries(
        entries: &DashMap<String, CacheEntry>,
        expired_cleanups: &AtomicU64,
        memory_usage: &AtomicUsize,
    ) {
        let now = Instant::now();
        let mut cleaned_count = 0u64;
        let mut freed_memory = 0usize;

        entries.retain(|_, entry| {
            if entry.is_expired_at(now) {
                cleaned_count += 1;
                freed_memory += entry.size;
                false
            } else {
                true
            }
        });

        if cleaned_count > 0 {
            memory_usage.fetch_sub(freed_memory, Ordering::Relaxed);
            expired_cleanups.fetch_add(cleaned_count, Ordering::Relaxed);
            debug!("Cleaned up {} expired cache entries, freed {} bytes", cleaned_count, freed_memory);
        }
    }

    /// Evict least recently used entries until there is room for one more
    fn evict_if_needed(&self, incoming_key: &str) {
        if self.entries.len() < self.config.max_entries || self.entries.contains_key(incoming_key) {
            return;
        }

        // Keep 90% of max entries, evict at least one
        let target = self.config.max_entries * 9 / 10;
        let evict_count = std::cmp::max(self.entries.len().saturating_sub(target), 1);

        let mut by_access: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().last_accessed))
            .collect();
        by_access.sort_by_key(|(_, accessed)| *accessed);

        let mut evicted_count = 0u64;
        let mut freed_memory = 0usize;
        for (key, _) in by_access.into_iter().take(evict_count) {
            if let Some((_, entry)) = self.entries.remove(&key) {
                freed_memory += entry.size;
                evicted_count += 1;
            }
        }

        self.memory_usage.fetch_sub(freed_memory, Ordering::Relaxed);
        self.evictions.fetch_add(evicted_count, Ordering::Relaxed);
        info!("Evicted {} LRU cache entries, freed {} bytes", evicted_count, freed_memory);
    }

    fn remove_entry(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                self.memory_usage.fetch_sub(entry.size, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Read an entry, dropping it if it has expired
    fn read(&self, key: &str) -> Option<(Vec<u8>, Option<Duration>)> {
        let mut entry = match self.entries.get_mut(key) {
            Some(entry) => entry,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if entry.is_expired() {
            drop(entry);
            // Opportunistic prune; only remove if still expired (a writer may have raced us)
            if let Some((_, expired)) = self.entries.remove_if(key, |_, e| e.is_expired()) {
                self.memory_usage.fetch_sub(expired.size, Ordering::Relaxed);
                self.expired_cleanups.fetch_add(1, Ordering::Relaxed);
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        entry.mark_accessed();
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some((entry.value.clone(), entry.remaining_ttl()))
    }
}

impl Drop for InMemoryCache {
    fn drop(&mut self) {
        self.cleanup_task.abort();
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(self.read(key).map(|(value, _)| value))
    }

    async fn get_with_ttl(&self, key: &str) -> CacheResult<Option<(Vec<u8>, Option<Duration>)>> {
        Ok(self.read(key))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()> {
        self.evict_if_needed(key);

        let entry = CacheEntry::new(value.to_vec(), ttl);
        let entry_size = entry.size;

        match self.entries.insert(key.to_string(), entry) {
            Some(old_entry) => {
                self.memory_usage.fetch_sub(old_entry.size, Ordering::Relaxed);
                self.memory_usage.fetch_add(entry_size, Ordering::Relaxed);
            }
            None => {
                self.memory_usage.fetch_add(entry_size, Ordering::Relaxed);
            }
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.remove_entry(key))
    }

    async fn delete_by_prefix(&self, prefix: &str) -> CacheResult<usize> {
        let mut removed = 0usize;
        let mut freed_memory = 0usize;

        self.entries.retain(|key, entry| {
            if key.starts_with(prefix) {
                removed += 1;
                freed_memory += entry.size;
                false
            } else {
                true
            }
        });

        self.memory_usage.fetch_sub(freed_memory, Ordering::Relaxed);
        debug!("Deleted {} in-memory cache keys with prefix: {}", removed, prefix);
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self
            .entries
            .get(key)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false))
    }

    async fn clear(&self) -> CacheResult<()> {
        let entry_count = self.entries.len();
        self.entries.clear();
        self.memory_usage.store(0, Ordering::Relaxed);

        info!("Cleared {} entries from in-memory cache", entry_count);
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStoreStats> {
        Ok(CacheStoreStats {
            entries: self.entries.len(),
            memory_usage: self.memory_usage.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_cleanups: self.expired_cleanups.load(Ordering::Relaxed),
        })
    }

    async fn health_check(&self) -> CacheResult<bool> {
        let test_key = "__health_check__";
        let test_value = b"health_check_value";

        self.set(test_key, test_value, Some(Duration::from_secs(1))).await?;
        let retrieved = self.get(test_key).await?;
        self.delete(test_key).await?;

        Ok(retrieved.as_deref() == Some(&test_value[..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn cache() -> InMemoryCache {
        InMemoryCache::new(InMemoryCacheConfig::default())
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let cache = cache();
        let ttl = Some(Duration::from_secs(60));

        cache.set("test_key", b"test_value", ttl).await.unwrap();
        let result = cache.get("test_key").await.unwrap();
        assert_eq!(result, Some(b"test_value".to_vec()));
        assert!(cache.exists("test_key").await.unwrap());

        assert!(cache.delete("test_key").await.unwrap());
        assert!(!cache.exists("test_key").await.unwrap());

        // Deleting again is a no-op, not an error
        assert!(!cache.delete("test_key").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let cache = cache();
        cache.set("k", b"one", Some(Duration::from_secs(60))).await.unwrap();
        cache.set("k", b"two", Some(Duration::from_secs(60))).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(cache.stats().await.unwrap().entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiration() {
        let cache = cache();
        cache.set("expire_test", b"v", Some(Duration::from_secs(30))).await.unwrap();

        advance(Duration::from_millis(29_990)).await;
        assert_eq!(cache.get("expire_test").await.unwrap(), Some(b"v".to_vec()));

        advance(Duration::from_millis(20)).await;
        assert_eq!(cache.get("expire_test").await.unwrap(), None);
        assert_eq!(cache.stats().await.unwrap().expired_cleanups, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_cleanup() {
        let cache = InMemoryCache::new(InMemoryCacheConfig {
            max_entries: 100,
            cleanup_interval: Duration::from_secs(5),
        });
        cache.set("short", b"v", Some(Duration::from_secs(1))).await.unwrap();
        cache.set("long", b"v", Some(Duration::from_secs(600))).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.expired_cleanups, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction() {
        let cache = InMemoryCache::new(InMemoryCacheConfig {
            max_entries: 3,
            ..Default::default()
        });

        for i in 0..3 {
            let key = format!("key_{}", i);
            cache.set(&key, b"value", Some(Duration::from_secs(60))).await.unwrap();
            advance(Duration::from_millis(10)).await;
        }

        // Access first key to make it recently used
        cache.get("key_0").await.unwrap();
        advance(Duration::from_millis(10)).await;

        cache.set("key_3", b"value_3", Some(Duration::from_secs(60))).await.unwrap();

        assert!(!cache.exists("key_1").await.unwrap());
        assert!(cache.exists("key_0").await.unwrap());
        assert!(cache.exists("key_2").await.unwrap());
        assert!(cache.exists("key_3").await.unwrap());
        assert_eq!(cache.stats().await.unwrap().evictions, 1);
    }

    #[tokio::test]
    async fn test_delete_by_prefix() {
        let cache = cache();
        let ttl = Some(Duration::from_secs(60));
        cache.set("daily_orders:u1:2024-05-01", b"a", ttl).await.unwrap();
        cache.set("daily_orders:u1:2024-05-02", b"b", ttl).await.unwrap();
        cache.set("daily_orders:u10:2024-05-01", b"c", ttl).await.unwrap();
        cache.set("nutrition:u1:2024-05-01", b"d", ttl).await.unwrap();

        let removed = cache.delete_by_prefix("daily_orders:u1:").await.unwrap();
        assert_eq!(removed, 2);
        assert!(cache.exists("daily_orders:u10:2024-05-01").await.unwrap());
        assert!(cache.exists("nutrition:u1:2024-05-01").await.unwrap());
    }

    #[tokio::test]
    async fn test_stats() {
        let cache = cache();
        cache.set("key1", b"value1", Some(Duration::from_secs(60))).await.unwrap();
        cache.get("key1").await.unwrap();
        cache.get("key2").await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert!(stats.memory_usage > 0);
    }

    #[tokio::test]
    async fn test_health_check() {
        assert!(cache().health_check().await.unwrap());
    }
}
