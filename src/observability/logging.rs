//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. `RUST_LOG` wins over the configured
//! level when set.

use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::error::{GatewayError, GatewayResult};
use crate::observability::config::{LogConfig, LogFormat};

/// Build the filter: `RUST_LOG` if present, otherwise the configured directive
pub fn build_env_filter(config: &LogConfig) -> GatewayResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| GatewayError::config(format!("Invalid log level '{}': {}", config.level, e))),
    }
}

/// Initialize the tracing subscriber.
///
/// Calling it twice is harmless; the second call keeps the first subscriber.
pub fn init_logging(config: &LogConfig) -> GatewayResult<()> {
    let env_filter = build_env_filter(config)?;

    let result = match config.format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
    };

    if result.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
        return Ok(());
    }

    info!(format = ?config.format, level = %config.level, "Structured logging initialized");
    Ok(())
}
