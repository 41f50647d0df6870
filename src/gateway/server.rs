//! # HTTP Server Module
//!
//! Serves the gateway over two listeners using the Axum framework:
//!
//! - the public listener: `POST /v1/chat/stream` (server-sent events),
//!   `POST /v1/events/write` and `GET /health`
//! - the admin listener: `GET /health` and the cache admin routes under `/admin`
//!
//! Every route is wrapped in a `TraceLayer`. Chat events are written to the response
//! as soon as the relay produces them; when the client goes away the response
//! stream is dropped, which closes the relay channel and aborts the upstream call.

use super::facade::GatewayFacade;
use crate::caching::{CacheAdminRouter, InvalidationReport};
use crate::core::config::ServerConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::relay::{ClientEvent, ConversationRequest};
use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router as AxumRouter,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument};

/// Body of `POST /v1/events/write`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteEventRequest {
    pub event_type: String,

    #[serde(default)]
    pub payload: Value,
}

/// HTTP server for the public and admin listeners
pub struct GatewayServer {
    facade: Arc<GatewayFacade>,
    bind_addr: SocketAddr,
    admin_bind_addr: SocketAddr,
}

impl GatewayServer {
    pub fn new(facade: Arc<GatewayFacade>, config: &ServerConfig) -> GatewayResult<Self> {
        Ok(Self {
            facade,
            bind_addr: socket_addr(&config.bind_address, config.http_port)?,
            admin_bind_addr: socket_addr(&config.bind_address, config.admin_port)?,
        })
    }

    /// Router for the public listener
    pub fn gateway_app(&self) -> AxumRouter {
        create_gateway_app(self.facade.clone())
    }

    /// Router for the admin listener
    pub fn admin_app(&self) -> AxumRouter {
        create_admin_app(self.facade.clone())
    }

    /// Serve both listeners until `shutdown` resolves, then drain in-flight requests
    #[instrument(skip(self, shutdown))]
    pub async fn start<S>(self, shutdown: S) -> GatewayResult<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let gateway_listener = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            GatewayError::internal(format!("Failed to bind gateway server to {}: {}", self.bind_addr, e))
        })?;
        let admin_listener = TcpListener::bind(self.admin_bind_addr).await.map_err(|e| {
            GatewayError::internal(format!("Failed to bind admin server to {}: {}", self.admin_bind_addr, e))
        })?;

        info!("Gateway HTTP server listening on {}", self.bind_addr);
        info!("Admin HTTP server listening on {}", self.admin_bind_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        tokio::spawn(async move {
            shutdown.await;
            info!("Shutdown requested, draining connections");
            let _ = shutdown_tx.send(());
        });

        let gateway_server = axum::serve(gateway_listener, self.gateway_app())
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));
        let admin_server = axum::serve(admin_listener, self.admin_app())
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx));

        let gateway = async move {
            gateway_server
                .await
                .map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)))
        };
        let admin = async move {
            admin_server
                .await
                .map_err(|e| GatewayError::internal(format!("Admin server error: {}", e)))
        };

        tokio::try_join!(gateway, admin)?;
        info!("HTTP servers stopped");
        Ok(())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn admin_bind_addr(&self) -> SocketAddr {
        self.admin_bind_addr
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<()>) {
    // Also resolves if the sender was dropped
    let _ = rx.changed().await;
}

fn socket_addr(host: &str, port: u16) -> GatewayResult<SocketAddr> {
    format!("{}:{}", host, port)
        .parse()
        .map_err(|e| GatewayError::config(format!("Invalid bind address {}:{}: {}", host, port, e)))
}

/// Public routes
pub fn create_gateway_app(facade: Arc<GatewayFacade>) -> AxumRouter {
    AxumRouter::new()
        .route("/v1/chat/stream", post(chat_stream))
        .route("/v1/events/write", post(write_event))
        .route("/health", get(health_check))
        .with_state(facade)
        .layer(TraceLayer::new_for_http())
}

/// Admin routes
pub fn create_admin_app(facade: Arc<GatewayFacade>) -> AxumRouter {
    let cache_routes = CacheAdminRouter::create_router(facade.cache_admin_state());

    AxumRouter::new()
        .route("/health", get(health_check))
        .with_state(facade)
        .nest("/admin", cache_routes)
        .layer(TraceLayer::new_for_http())
}

/// Relay a chat answer as server-sent events
async fn chat_stream(
    State(facade): State<Arc<GatewayFacade>>,
    Json(request): Json<ConversationRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    debug!(user = %request.user, conversation_id = ?request.conversation(), "Chat stream requested");
    let chat = facade.stream_chat(request)?;
    let events = chat.events.map(|event| Ok(sse_event(&event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &ClientEvent) -> Event {
    Event::default().event(event.event_name()).data(event.data().to_string())
}

/// Hook for the record-management layer, called once per committed write
async fn write_event(
    State(facade): State<Arc<GatewayFacade>>,
    Json(request): Json<WriteEventRequest>,
) -> Result<Json<InvalidationReport>, GatewayError> {
    if request.event_type.trim().is_empty() {
        return Err(GatewayError::validation("event_type", "must not be empty"));
    }
    let report = facade.on_write(&request.event_type, &request.payload).await;
    Ok(Json(report))
}

/// Health check handler. A degraded cache does not make the gateway unhealthy.
pub async fn health_check(State(facade): State<Arc<GatewayFacade>>) -> impl IntoResponse {
    let cache = match facade.cache().health_check().await {
        Ok(true) => "ok",
        _ => "degraded",
    };

    let health_info = serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "checks": {
            "cache": cache,
        }
    });

    (StatusCode::OK, Json(health_info))
}
