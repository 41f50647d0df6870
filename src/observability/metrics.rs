//! # Metrics Collection
//!
//! Counters are recorded through the `metrics` facade and exported by
//! `metrics-exporter-prometheus` when it is installed. Without an installed
//! recorder every call here is a no-op, which is what unit tests rely on.
//!
//! ## Metrics
//! - `gateway_cache_hits_total{tier}` / `gateway_cache_misses_total`
//! - `gateway_cache_failures_total{operation}`: swallowed non-critical failures
//! - `gateway_dedup_executions_total` / `gateway_dedup_coalesced_total`
//! - `gateway_invalidations_total{event_type}` / `gateway_invalidation_targets_total`
//! - `gateway_relay_sessions_total{outcome}`
//! - `gateway_relay_conversation_retries_total`
//! - `gateway_relay_chunks_total` / `gateway_relay_bytes_total`

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;
use tracing::info;

use crate::observability::config::MetricsConfig;

/// Errors that can occur during metrics setup
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to initialize metrics exporter: {0}")]
    InitializationError(String),
}

/// Install the Prometheus exporter with its own scrape listener.
///
/// Returns `false` when metrics are disabled.
pub fn install_prometheus_exporter(config: &MetricsConfig) -> Result<bool, MetricsError> {
    if !config.enabled {
        info!("Metrics export disabled");
        return Ok(false);
    }

    let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.listen_port));
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| MetricsError::InitializationError(e.to_string()))?;

    info!("Prometheus exporter listening on {}", address);
    Ok(true)
}

pub fn record_cache_hit(tier: &'static str) {
    metrics::counter!("gateway_cache_hits_total", "tier" => tier).increment(1);
}

pub fn record_cache_miss() {
    metrics::counter!("gateway_cache_misses_total").increment(1);
}

/// A cache operation failed and was swallowed
pub fn record_cache_failure(operation: &'static str) {
    metrics::counter!("gateway_cache_failures_total", "operation" => operation).increment(1);
}

pub fn record_dedup_execution() {
    metrics::counter!("gateway_dedup_executions_total").increment(1);
}

pub fn record_dedup_coalesced() {
    metrics::counter!("gateway_dedup_coalesced_total").increment(1);
}

pub fn record_invalidation(event_type: &str, targets: usize) {
    metrics::counter!("gateway_invalidations_total", "event_type" => event_type.to_string()).increment(1);
    metrics::counter!("gateway_invalidation_targets_total").increment(targets as u64);
}

/// A relay session ended; `outcome` is `done` or an error code
pub fn record_relay_session(outcome: &'static str) {
    metrics::counter!("gateway_relay_sessions_total", "outcome" => outcome).increment(1);
}

pub fn record_conversation_retry() {
    metrics::counter!("gateway_relay_conversation_retries_total").increment(1);
}

pub fn record_chunk_forwarded(bytes: usize) {
    metrics::counter!("gateway_relay_chunks_total").increment(1);
    metrics::counter!("gateway_relay_bytes_total").increment(bytes as u64);
}
