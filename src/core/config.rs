//! # Configuration Module
//!
//! This module handles configuration loading for the gateway layer.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde
//! - Environment variable override support
//! - Validation that reports every problem at once instead of the first one

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::caching::invalidation::InvalidationRuleConfig;
use crate::caching::CacheConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::observability::config::{LogFormat, ObservabilityConfig};

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration
    pub server: ServerConfig,

    /// Read cache configuration
    pub cache: CacheConfig,

    /// Conversational AI provider
    pub upstream: UpstreamConfig,

    /// Streaming relay tuning
    pub relay: RelayConfig,

    /// Write-event invalidation rules
    pub invalidation: InvalidationConfig,

    /// Logging and metrics
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub http_port: u16,
    pub admin_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8080,
            admin_port: 9080,
        }
    }
}

/// Upstream conversational AI provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the provider API, e.g. `https://ai.example.com/v1`
    pub base_url: String,

    /// Bearer token sent with every call
    pub api_key: Option<String>,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Overall deadline for one upstream exchange, retries and streaming included
    #[serde(with = "humantime_serde")]
    pub request_deadline: Duration,

    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5001/v1".to_string(),
            api_key: None,
            connect_timeout: Duration::from_secs(5),
            request_deadline: Duration::from_secs(120),
            user_agent: concat!("ai-gateway/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Capacity of the per-session client channel
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { channel_capacity: 16 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    pub rules: Vec<InvalidationRuleConfig>,
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: GatewayConfig = serde_yaml::from_str(&content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from JSON
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: GatewayConfig = serde_json::from_str(&content)
            .map_err(|e| GatewayError::config(format!("Failed to parse JSON config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern: GATEWAY_<SECTION>_<FIELD>
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(port) = env::var("GATEWAY_SERVER_HTTP_PORT") {
            self.server.http_port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_SERVER_HTTP_PORT: {}", e)))?;
        }

        if let Ok(port) = env::var("GATEWAY_SERVER_ADMIN_PORT") {
            self.server.admin_port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_SERVER_ADMIN_PORT: {}", e)))?;
        }

        if let Ok(url) = env::var("GATEWAY_UPSTREAM_BASE_URL") {
            self.upstream.base_url = url;
        }

        if let Ok(key) = env::var("GATEWAY_UPSTREAM_API_KEY") {
            self.upstream.api_key = Some(key);
        }

        if let Ok(deadline) = env::var("GATEWAY_UPSTREAM_DEADLINE") {
            self.upstream.request_deadline = humantime::parse_duration(&deadline)
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_UPSTREAM_DEADLINE: {}", e)))?;
        }

        if let Ok(ttl) = env::var("GATEWAY_CACHE_DEFAULT_TTL") {
            self.cache.default_ttl = humantime::parse_duration(&ttl)
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_CACHE_DEFAULT_TTL: {}", e)))?;
        }

        if let Ok(url) = env::var("GATEWAY_REDIS_URL") {
            self.cache.redis.enabled = true;
            self.cache.redis.url = url;
        }

        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        if let Ok(format) = env::var("GATEWAY_LOG_FORMAT") {
            self.observability.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(GatewayError::config(format!(
                        "Invalid GATEWAY_LOG_FORMAT: {} (expected json or text)",
                        other
                    )))
                }
            };
        }

        Ok(())
    }

    /// Configuration validation with detailed error messages
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }
        if self.server.admin_port == self.server.http_port {
            errors.push("server.admin_port must differ from server.http_port".to_string());
        }

        match Url::parse(&self.upstream.base_url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(url) => errors.push(format!("upstream.base_url has unsupported scheme '{}'", url.scheme())),
            Err(e) => errors.push(format!("upstream.base_url is invalid: {}", e)),
        }
        if self.upstream.request_deadline.is_zero() {
            errors.push("upstream.request_deadline must be greater than zero".to_string());
        }

        if self.relay.channel_capacity == 0 {
            errors.push("relay.channel_capacity must be greater than zero".to_string());
        }

        if !self.cache.in_memory.enabled && !self.cache.redis.enabled {
            errors.push("at least one cache tier (in_memory or redis) must be enabled".to_string());
        }
        if self.cache.max_key_length == 0 {
            errors.push("cache.max_key_length must be greater than zero".to_string());
        }

        for (index, rule) in self.invalidation.rules.iter().enumerate() {
            if rule.event_type.trim().is_empty() {
                errors.push(format!("invalidation.rules[{}].event_type must not be empty", index));
            }
            if rule.targets.is_empty() {
                errors.push(format!("invalidation.rules[{}] has no targets", index));
            }
            for target in &rule.targets {
                if target.template().trim().is_empty() {
                    errors.push(format!("invalidation.rules[{}] has an empty template", index));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::config(errors.join("; ")))
        }
    }
}
