// Core observability configuration
pub mod config;

// Metrics collection
pub mod metrics;

// Structured logging
pub mod logging;

pub use config::{LogConfig, LogFormat, MetricsConfig, ObservabilityConfig};
pub use logging::init_logging;
pub use metrics::install_prometheus_exporter;
