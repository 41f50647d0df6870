//! # Gateway Facade Integration Tests
//!
//! Cached reads, write-driven invalidation and deduplication wired together from a
//! configuration, the way the binary builds them.

use ai_gateway::caching::{
    CacheConfig, CacheKey, CacheManager, InvalidationRuleConfig, InvalidationTarget, RequestDeduplicator,
    TargetTemplate,
};
use ai_gateway::core::error::{GatewayError, GatewayResult};
use ai_gateway::relay::{BackendError, ConversationBackend, ConversationRequest, UpstreamStream};
use ai_gateway::{GatewayConfig, GatewayFacade};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

struct OfflineBackend;

#[async_trait]
impl ConversationBackend for OfflineBackend {
    async fn start_or_continue(&self, _request: ConversationRequest) -> Result<UpstreamStream, BackendError> {
        Err(BackendError::Unreachable {
            reason: "offline".to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DailyOrders {
    owner_id: String,
    count: usize,
}

fn config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.invalidation.rules = vec![
        InvalidationRuleConfig {
            event_type: "order_placed".to_string(),
            targets: vec![
                TargetTemplate::Prefix("daily_orders:{owner_id}:".to_string()),
                TargetTemplate::Key("nutrition_summary:{owner_id}:{today}".to_string()),
            ],
        },
        InvalidationRuleConfig {
            event_type: "dish_updated".to_string(),
            targets: vec![TargetTemplate::Prefix("menu_suggestions:{owner_id}:".to_string())],
        },
    ];
    config
}

async fn facade() -> GatewayFacade {
    GatewayFacade::with_backend(&config(), Arc::new(OfflineBackend)).await.unwrap()
}

/// Stand-in for the record store: counts reads and returns the current order count
#[derive(Clone, Default)]
struct OrderStore {
    orders: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
}

impl OrderStore {
    fn fetch(&self, owner_id: &str) -> impl std::future::Future<Output = GatewayResult<DailyOrders>> + Send + 'static {
        let store = self.clone();
        let owner_id = owner_id.to_string();
        async move {
            store.reads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(DailyOrders {
                owner_id,
                count: store.orders.load(Ordering::SeqCst),
            })
        }
    }
}

#[tokio::test]
async fn test_invalidation_precedes_visibility() {
    let facade = facade().await;
    let store = OrderStore::default();
    let key = CacheKey::new("daily_orders", "owner-7", "2024-05-01");

    let read = |store: OrderStore| {
        let facade = facade.clone();
        let key = key.clone();
        async move { facade.cached_read(&key, None, move || store.fetch("owner-7")).await.unwrap() }
    };

    assert_eq!(read(store.clone()).await.count, 0);
    assert_eq!(read(store.clone()).await.count, 0);
    assert_eq!(store.reads.load(Ordering::SeqCst), 1);

    // Write path: commit, then invalidate before answering
    store.orders.fetch_add(1, Ordering::SeqCst);
    let report = facade.on_write("order_placed", &json!({ "owner_id": "owner-7" })).await;
    assert_eq!(report.failures, 0);
    assert_eq!(report.entries_removed, 1);

    assert_eq!(read(store.clone()).await.count, 1);
    assert_eq!(store.reads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_write_for_other_owner_keeps_entry() {
    let facade = facade().await;
    let store = OrderStore::default();
    let key = CacheKey::new("daily_orders", "owner-7", "2024-05-01");

    let fetch = store.clone();
    facade
        .cached_read(&key, None, move || fetch.fetch("owner-7"))
        .await
        .unwrap();

    facade.on_write("order_placed", &json!({ "owner_id": "owner-8" })).await;
    assert!(facade.cache().exists(key.as_str()).await.unwrap());
}

#[tokio::test]
async fn test_unknown_event_type_is_a_no_op() {
    let facade = facade().await;
    let report = facade.on_write("user_renamed", &json!({ "owner_id": "owner-7" })).await;
    assert!(report.keys.is_empty());
    assert!(report.prefixes.is_empty());
    assert_eq!(report.failures, 0);
}

#[tokio::test]
async fn test_payload_missing_field_is_counted_not_raised() {
    let facade = facade().await;
    let report = facade.on_write("order_placed", &json!({ "order_id": 1 })).await;
    assert_eq!(report.failures, 2);
}

#[tokio::test]
async fn test_invalidations_are_broadcast() {
    let facade = facade().await;
    let mut events = facade.invalidator().subscribe();

    facade.on_write("dish_updated", &json!({ "owner_id": "owner-7" })).await;

    let event = events.recv().await.unwrap();
    assert_eq!(event.event_type, "dish_updated");
    assert_eq!(event.target, InvalidationTarget::Prefix("menu_suggestions:owner-7:".to_string()));
}

#[tokio::test]
async fn test_concurrent_reads_share_one_fetch() {
    let facade = facade().await;
    let store = OrderStore::default();
    let key = CacheKey::new("daily_orders", "owner-7", "2024-05-01");

    let reads = (0..10).map(|_| {
        let store = store.clone();
        facade.cached_read(&key, None, move || store.fetch("owner-7"))
    });
    let results: Vec<GatewayResult<DailyOrders>> = join_all(reads).await;

    assert!(results.iter().all(|r| matches!(r, Ok(orders) if orders.count == 0)));
    assert_eq!(store.reads.load(Ordering::SeqCst), 1);

    let stats = facade.deduplicator().stats();
    assert_eq!(stats.executions, 1);
    assert_eq!(stats.coalesced, 9);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_failure_is_shared_by_every_waiter() {
    let facade = facade().await;
    let key = CacheKey::new("inventory_report", "owner-7", "weekly");
    let attempts = Arc::new(AtomicUsize::new(0));

    let reads = (0..4).map(|_| {
        let attempts = attempts.clone();
        facade.cached_read::<String, _, _>(&key, None, move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(GatewayError::UpstreamTimeout { timeout_ms: 20 })
        })
    });

    for result in join_all(reads).await {
        assert!(matches!(result, Err(GatewayError::UpstreamTimeout { .. })));
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(!facade.cache().exists(key.as_str()).await.unwrap());
}

#[tokio::test]
async fn test_different_keys_run_concurrently() {
    let dedup: RequestDeduplicator<u32> = RequestDeduplicator::new();
    // Both computations must be running at once to pass the barrier
    let barrier = Arc::new(Barrier::new(2));

    let run = |key: &'static str, value: u32| {
        let barrier = barrier.clone();
        let dedup = dedup.clone();
        async move {
            dedup
                .run(key, move || async move {
                    barrier.wait().await;
                    Ok(value)
                })
                .await
        }
    };

    let (a, b) = tokio::time::timeout(Duration::from_secs(1), async { tokio::join!(run("a", 1), run("b", 2)) })
        .await
        .expect("computations for different keys were serialized");
    assert_eq!(a.unwrap(), 1);
    assert_eq!(b.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cache_ttl_expiry() {
    let cache = CacheManager::new(CacheConfig::default()).await.unwrap();
    cache.set("daily_orders:o1:d", b"v", Duration::from_secs(10)).await.unwrap();

    tokio::time::advance(Duration::from_millis(9_900)).await;
    assert!(cache.get("daily_orders:o1:d").await.unwrap().is_some());

    tokio::time::advance(Duration::from_millis(200)).await;
    assert!(cache.get("daily_orders:o1:d").await.unwrap().is_none());
}

#[tokio::test]
async fn test_long_keys_are_bounded_and_still_invalidated() {
    let facade = facade().await;
    let discriminator = "x".repeat(400);
    let key = CacheKey::new("daily_orders", "owner-7", &discriminator);

    let value: String = facade
        .cached_read(&key, None, || async { Ok("cached".to_string()) })
        .await
        .unwrap();
    assert_eq!(value, "cached");
    assert_eq!(facade.cache().stats().await.memory.map(|m| m.entries), Some(1));

    let report = facade.on_write("order_placed", &json!({ "owner_id": "owner-7" })).await;
    assert_eq!(report.entries_removed, 1);
}
