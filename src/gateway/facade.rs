//! # Gateway Facade
//!
//! The single entry point request handlers use. It wires the read cache, the
//! request deduplicator, the invalidator and the stream relay together:
//!
//! - [`GatewayFacade::cached_read`]: cache lookup, else one deduplicated fetch that
//!   populates the cache for everyone waiting on it
//! - [`GatewayFacade::stream_chat`]: a live relay session
//! - [`GatewayFacade::on_write`]: synchronous invalidation for a committed write
//!
//! ## Read-after-write
//!
//! Every write bumps a write epoch before invalidating. Reads only coalesce with
//! fetches started in the same epoch, and a fetch only populates the cache if no
//! write happened while it was in flight (checked again after the store, with a
//! compensating delete). A read initiated after `on_write` returned can therefore
//! neither join nor be served a pre-write fetch.

use crate::caching::{
    CacheAdminState, CacheError, CacheInvalidator, CacheKey, CacheManager, InvalidationReport, NonCritical,
    RequestDeduplicator,
};
use crate::core::config::GatewayConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::relay::{ClientEvent, ConversationBackend, ConversationRequest, HttpConversationBackend, SessionReport, StreamRelay};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

/// Client side of a relay session
pub struct ChatStream {
    /// Events in the order they were produced; ends after the terminal event
    pub events: ReceiverStream<ClientEvent>,

    /// Resolves to the session report once the relay finished
    pub session: JoinHandle<SessionReport>,
}

#[derive(Clone)]
pub struct GatewayFacade {
    cache: Arc<CacheManager>,
    deduplicator: RequestDeduplicator<Bytes>,
    invalidator: Arc<CacheInvalidator>,
    relay: Arc<StreamRelay>,
    write_epoch: Arc<AtomicU64>,
}

impl GatewayFacade {
    pub fn new(
        cache: Arc<CacheManager>,
        deduplicator: RequestDeduplicator<Bytes>,
        invalidator: Arc<CacheInvalidator>,
        relay: Arc<StreamRelay>,
    ) -> Self {
        Self {
            cache,
            deduplicator,
            invalidator,
            relay,
            write_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Build every component from configuration, talking to the configured HTTP upstream
    pub async fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let backend = Arc::new(HttpConversationBackend::new(&config.upstream)?);
        info!(endpoint = backend.endpoint(), "Upstream conversation backend configured");
        Self::with_backend(config, backend).await
    }

    /// Build every component from configuration around an existing backend
    pub async fn with_backend(config: &GatewayConfig, backend: Arc<dyn ConversationBackend>) -> GatewayResult<Self> {
        let cache = Arc::new(CacheManager::new(config.cache.clone()).await?);
        let invalidator = Arc::new(CacheInvalidator::from_config(cache.clone(), &config.invalidation.rules));
        let relay = Arc::new(StreamRelay::new(
            backend,
            config.upstream.request_deadline,
            config.relay.channel_capacity,
        ));

        Ok(Self::new(cache, RequestDeduplicator::new(), invalidator, relay))
    }

    /// Serve `key` from the cache, or run `fetcher` once for all concurrent callers.
    ///
    /// `ttl` defaults to the configured cache TTL. Cache failures are logged and
    /// fall back to fetching; only a failing `fetcher` fails the read.
    pub async fn cached_read<T, F, Fut>(&self, key: &CacheKey, ttl: Option<Duration>, fetcher: F) -> GatewayResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = GatewayResult<T>> + Send + 'static,
    {
        let key = key.clone().bounded(self.cache.config().max_key_length).into_string();
        let ttl = ttl.unwrap_or_else(|| self.cache.default_ttl());
        let epoch = self.write_epoch.load(Ordering::Acquire);

        if let Some(Some(bytes)) = self.cache.get(&key).await.non_critical("get", &key) {
            let cached = serde_json::from_slice::<T>(&bytes).map_err(CacheError::from);
            if let Some(value) = cached.non_critical("decode", &key) {
                debug!(key = %key, "Cached read served from cache");
                return Ok(value);
            }
        }

        let cache = self.cache.clone();
        let write_epoch = self.write_epoch.clone();
        let flight_key = format!("{}@{}", key, epoch);

        let bytes = self
            .deduplicator
            .run(&flight_key, move || async move {
                let value = fetcher().await?;
                let bytes = Bytes::from(serde_json::to_vec(&value)?);

                if write_epoch.load(Ordering::Acquire) != epoch {
                    debug!(key = %key, "Write happened during fetch, not caching result");
                    return Ok(bytes);
                }

                cache.set(&key, &bytes, ttl).await.non_critical("set", &key);

                // A write may have invalidated between the check and the store
                if write_epoch.load(Ordering::Acquire) != epoch {
                    debug!(key = %key, "Write raced the cache store, removing entry");
                    cache.delete(&key).await.non_critical("delete", &key);
                }

                Ok(bytes)
            })
            .await?;

        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Open a relay session for `request`
    pub fn stream_chat(&self, request: ConversationRequest) -> GatewayResult<ChatStream> {
        if request.query.trim().is_empty() {
            return Err(GatewayError::validation("query", "must not be empty"));
        }
        if request.user.trim().is_empty() {
            return Err(GatewayError::validation("user", "must not be empty"));
        }

        let (events, session) = self.relay.open(request);
        Ok(ChatStream { events, session })
    }

    /// Invalidate everything `event_type` affects. Call after the write committed
    /// and before answering it. Never fails.
    pub async fn on_write(&self, event_type: &str, payload: &Value) -> InvalidationReport {
        let epoch = self.write_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(event_type, epoch, "Write committed");
        self.invalidator.invalidate(event_type, payload).await
    }

    /// Number of writes observed so far
    pub fn write_epoch(&self) -> u64 {
        self.write_epoch.load(Ordering::Acquire)
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn deduplicator(&self) -> &RequestDeduplicator<Bytes> {
        &self.deduplicator
    }

    pub fn invalidator(&self) -> &Arc<CacheInvalidator> {
        &self.invalidator
    }

    pub fn cache_admin_state(&self) -> CacheAdminState {
        CacheAdminState {
            cache_manager: self.cache.clone(),
            invalidator: self.invalidator.clone(),
            deduplicator: self.deduplicator.clone(),
        }
    }
}
