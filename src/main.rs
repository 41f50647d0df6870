//! # AI Gateway - Main Entry Point
//!
//! Loads configuration, installs logging and metrics, builds the gateway facade and
//! serves the public and admin listeners until SIGINT or SIGTERM.
//!
//! The configuration path is read from `GATEWAY_CONFIG_PATH` (default
//! `config/gateway.yaml`). A missing file is not an error: the defaults are used,
//! with `GATEWAY_*` environment overrides applied on top.

use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use ai_gateway::gateway::{GatewayFacade, GatewayServer};
use ai_gateway::observability::{init_logging, install_prometheus_exporter};
use ai_gateway::{GatewayConfig, GatewayResult};

const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

#[tokio::main]
async fn main() -> GatewayResult<()> {
    let config = load_config().await?;

    init_logging(&config.observability.logging)?;
    info!("Starting AI Gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = install_prometheus_exporter(&config.observability.metrics) {
        // Metrics are not worth refusing to start over
        warn!("Prometheus exporter not installed: {}", e);
    }

    let facade = Arc::new(GatewayFacade::from_config(&config).await.map_err(|e| {
        error!("Failed to initialize gateway: {}", e);
        e
    })?);

    let server = GatewayServer::new(facade, &config.server)?;
    info!("AI Gateway ready on {}", server.bind_addr());
    info!("Admin interface ready on {}", server.admin_bind_addr());

    server.start(shutdown_signal()).await?;

    info!("AI Gateway shutdown complete");
    Ok(())
}

async fn load_config() -> GatewayResult<GatewayConfig> {
    let config_path = std::env::var("GATEWAY_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    if Path::new(&config_path).exists() {
        if config_path.ends_with(".json") {
            GatewayConfig::load_from_json(&config_path).await
        } else {
            GatewayConfig::load_from_file(&config_path).await
        }
    } else {
        // Logging is not up yet
        eprintln!("Configuration file {} not found, using defaults", config_path);
        let mut config = GatewayConfig::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install SIGINT handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

