//! # Cache Admin Interface
//!
//! This module provides admin endpoints for cache management and monitoring.

use super::{CacheInvalidator, CacheManager, CacheStats, DedupStats, RequestDeduplicator};
use crate::core::error::GatewayError;
use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Cache admin state
#[derive(Clone)]
pub struct CacheAdminState {
    pub cache_manager: Arc<CacheManager>,

    pub invalidator: Arc<CacheInvalidator>,

    /// Deduplicator used for cached reads, for diagnostics
    pub deduplicator: RequestDeduplicator<Bytes>,
}

/// Cache admin router
pub struct CacheAdminRouter;

impl CacheAdminRouter {
    /// Create cache admin router, mounted under `/admin`
    pub fn create_router(state: CacheAdminState) -> Router {
        Router::new()
            .route("/cache/stats", get(get_cache_stats))
            .route("/cache/health", get(get_cache_health))
            .route("/cache/config", get(get_cache_config))
            .route("/cache/flush", post(flush_cache))
            .route("/cache/keys/:key", get(get_cache_key).delete(delete_cache_key))
            .route("/cache/invalidate/prefix", post(invalidate_cache_prefix))
            .with_state(state)
    }
}

/// Cache statistics response
#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub stats: CacheStats,
    pub deduplication: DedupStats,
    pub healthy: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Cache health response
#[derive(Debug, Serialize)]
pub struct CacheHealthResponse {
    pub healthy: bool,
    pub pending_computations: usize,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Cache configuration response
#[derive(Debug, Serialize)]
pub struct CacheConfigResponse {
    pub config: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Cache key response
#[derive(Debug, Serialize)]
pub struct CacheKeyResponse {
    pub key: String,
    pub exists: bool,
    pub size_bytes: Option<usize>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Prefix invalidation request
#[derive(Debug, Deserialize)]
pub struct PrefixInvalidationRequest {
    pub prefix: String,
}

/// Cache invalidation response
#[derive(Debug, Serialize)]
pub struct CacheInvalidationResponse {
    pub success: bool,
    pub message: String,
    pub invalidated_count: Option<usize>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Get cache statistics
pub async fn get_cache_stats(State(state): State<CacheAdminState>) -> Result<Json<CacheStatsResponse>, GatewayError> {
    let stats = state.cache_manager.stats().await;
    let healthy = state.cache_manager.health_check().await.unwrap_or(false);

    info!(
        "Cache stats requested - hits: {}, hit_ratio: {:.2}%",
        stats.hits,
        stats.hit_ratio * 100.0
    );

    Ok(Json(CacheStatsResponse {
        stats,
        deduplication: state.deduplicator.stats(),
        healthy,
        timestamp: chrono::Utc::now(),
    }))
}

/// Get cache health status
pub async fn get_cache_health(State(state): State<CacheAdminState>) -> Json<CacheHealthResponse> {
    let healthy = state.cache_manager.health_check().await.unwrap_or(false);

    Json(CacheHealthResponse {
        healthy,
        pending_computations: state.deduplicator.pending_count(),
        timestamp: chrono::Utc::now(),
    })
}

/// Get cache configuration
pub async fn get_cache_config(State(state): State<CacheAdminState>) -> Result<Json<CacheConfigResponse>, GatewayError> {
    let config = serde_json::to_value(state.cache_manager.config())
        .map_err(|e| GatewayError::internal(format!("Config serialization error: {}", e)))?;

    Ok(Json(CacheConfigResponse {
        config,
        timestamp: chrono::Utc::now(),
    }))
}

/// Flush every cache tier
pub async fn flush_cache(State(state): State<CacheAdminState>) -> Result<Json<CacheInvalidationResponse>, GatewayError> {
    state.cache_manager.clear().await?;
    info!("Cache flushed via admin API");

    Ok(Json(CacheInvalidationResponse {
        success: true,
        message: "Cache flushed successfully".to_string(),
        invalidated_count: None,
        timestamp: chrono::Utc::now(),
    }))
}

/// Inspect one cache key
pub async fn get_cache_key(
    State(state): State<CacheAdminState>,
    Path(key): Path<String>,
) -> Result<Json<CacheKeyResponse>, GatewayError> {
    let value = state.cache_manager.get(&key).await?;

    Ok(Json(CacheKeyResponse {
        exists: value.is_some(),
        size_bytes: value.map(|v| v.len()),
        key,
        timestamp: chrono::Utc::now(),
    }))
}

/// Delete one cache key
pub async fn delete_cache_key(
    State(state): State<CacheAdminState>,
    Path(key): Path<String>,
) -> Result<Json<CacheInvalidationResponse>, GatewayError> {
    let deleted = state.invalidator.invalidate_key(&key).await?;
    info!("Cache key {} deleted via admin API (existed: {})", key, deleted);

    Ok(Json(CacheInvalidationResponse {
        success: true,
        message: if deleted {
            format!("Key '{}' deleted", key)
        } else {
            format!("Key '{}' was not cached", key)
        },
        invalidated_count: Some(usize::from(deleted)),
        timestamp: chrono::Utc::now(),
    }))
}

/// Delete every key with a prefix
pub async fn invalidate_cache_prefix(
    State(state): State<CacheAdminState>,
    Json(request): Json<PrefixInvalidationRequest>,
) -> Result<Json<CacheInvalidationResponse>, GatewayError> {
    if request.prefix.is_empty() {
        return Err(GatewayError::validation("prefix", "must not be empty"));
    }

    let count = state.invalidator.invalidate_prefix(&request.prefix).await?;
    info!("Invalidated {} cache keys with prefix {} via admin API", count, request.prefix);

    Ok(Json(CacheInvalidationResponse {
        success: true,
        message: format!("Invalidated keys with prefix '{}'", request.prefix),
        invalidated_count: Some(count),
        timestamp: chrono::Utc::now(),
    }))
}
