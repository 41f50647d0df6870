//! # HTTP Surface Tests
//!
//! Exercises the public and admin routers in-process with `tower::ServiceExt::oneshot`.

use ai_gateway::gateway::{create_admin_app, create_gateway_app};
use ai_gateway::relay::{BackendError, ConversationBackend, ConversationRequest, UpstreamEvent, UpstreamStream};
use ai_gateway::{CacheKey, GatewayConfig, GatewayFacade};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// Answers "Hi there" in conversation c1, rejects any other conversation id
struct ScriptedProvider;

#[async_trait]
impl ConversationBackend for ScriptedProvider {
    async fn start_or_continue(&self, request: ConversationRequest) -> Result<UpstreamStream, BackendError> {
        match request.conversation() {
            Some(id) if id != "c1" => Err(BackendError::ConversationNotFound {
                conversation_id: id.to_string(),
            }),
            _ => Ok(futures::stream::iter(vec![
                Ok(UpstreamEvent::Fragment("Hi".to_string())),
                Ok(UpstreamEvent::Fragment(" there".to_string())),
                Ok(UpstreamEvent::MessageEnd {
                    conversation_id: "c1".to_string(),
                }),
            ])
            .boxed()),
        }
    }
}

/// Refuses every call
struct DownProvider;

#[async_trait]
impl ConversationBackend for DownProvider {
    async fn start_or_continue(&self, _request: ConversationRequest) -> Result<UpstreamStream, BackendError> {
        Err(BackendError::Unreachable {
            reason: "connection refused".to_string(),
        })
    }
}

async fn facade_with(backend: Arc<dyn ConversationBackend>) -> Arc<GatewayFacade> {
    let mut config = GatewayConfig::default();
    config.invalidation.rules = serde_yaml::from_str(
        r#"
- event_type: order_placed
  targets:
    - prefix: "daily_orders:{owner_id}:"
"#,
    )
    .unwrap();
    Arc::new(GatewayFacade::with_backend(&config, backend).await.unwrap())
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

/// `(event, data)` pairs of an SSE body, comments and keep-alives skipped
fn sse_events(body: &str) -> Vec<(String, Value)> {
    body.split("\n\n")
        .filter_map(|block| {
            let mut event = None;
            let mut data = None;
            for line in block.lines() {
                if let Some(name) = line.strip_prefix("event:") {
                    event = Some(name.trim().to_string());
                } else if let Some(payload) = line.strip_prefix("data:") {
                    data = serde_json::from_str(payload.trim()).ok();
                }
            }
            Some((event?, data?))
        })
        .collect()
}

#[tokio::test]
async fn test_chat_stream_emits_sse_events() {
    let app = create_gateway_app(facade_with(Arc::new(ScriptedProvider)).await);

    let response = app
        .oneshot(post_json("/v1/chat/stream", json!({"query": "hello", "user": "u1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let events = sse_events(&body_text(response).await);
    assert_eq!(
        events,
        vec![
            ("message".to_string(), json!({"answer": "Hi"})),
            ("message".to_string(), json!({"answer": " there"})),
            ("message_end".to_string(), json!({"conversation_id": "c1"})),
        ]
    );
}

#[tokio::test]
async fn test_chat_stream_recovers_unknown_conversation() {
    let app = create_gateway_app(facade_with(Arc::new(ScriptedProvider)).await);

    let response = app
        .oneshot(post_json(
            "/v1/chat/stream",
            json!({"query": "hello", "user": "u1", "conversation_id": "gone"}),
        ))
        .await
        .unwrap();

    let events = sse_events(&body_text(response).await);
    assert_eq!(events.last().unwrap().0, "message_end");
    assert!(events.iter().all(|(name, _)| name != "error"));
}

#[tokio::test]
async fn test_chat_stream_reports_upstream_failure_as_error_event() {
    let app = create_gateway_app(facade_with(Arc::new(DownProvider)).await);

    let response = app
        .oneshot(post_json("/v1/chat/stream", json!({"query": "hello", "user": "u1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let events = sse_events(&body_text(response).await);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "error");
    assert_eq!(events[0].1["code"], "upstream_unreachable");
}

#[tokio::test]
async fn test_chat_stream_validates_request() {
    let app = create_gateway_app(facade_with(Arc::new(ScriptedProvider)).await);

    let response = app
        .oneshot(post_json("/v1/chat/stream", json!({"query": "", "user": "u1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["code"], "invalid_request");
}

#[tokio::test]
async fn test_write_event_invalidates_cached_reads() {
    let facade = facade_with(Arc::new(ScriptedProvider)).await;
    let key = CacheKey::new("daily_orders", "owner-7", "2024-05-01");
    let _: u32 = facade
        .cached_read(&key, Some(Duration::from_secs(60)), || async { Ok(3) })
        .await
        .unwrap();
    assert!(facade.cache().exists(key.as_str()).await.unwrap());

    let app = create_gateway_app(facade.clone());
    let response = app
        .oneshot(post_json(
            "/v1/events/write",
            json!({"event_type": "order_placed", "payload": {"owner_id": "owner-7"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let report = body_json(response).await;
    assert_eq!(report["prefixes"], json!(["daily_orders:owner-7:"]));
    assert_eq!(report["entries_removed"], 1);
    assert!(!facade.cache().exists(key.as_str()).await.unwrap());
}

#[tokio::test]
async fn test_write_event_requires_event_type() {
    let app = create_gateway_app(facade_with(Arc::new(ScriptedProvider)).await);

    let response = app
        .oneshot(post_json("/v1/events/write", json!({"event_type": " ", "payload": {}})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_endpoints() {
    let facade = facade_with(Arc::new(ScriptedProvider)).await;

    for app in [create_gateway_app(facade.clone()), create_admin_app(facade.clone())] {
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["checks"]["cache"], "ok");
    }
}

#[tokio::test]
async fn test_admin_cache_routes_are_nested() {
    let facade = facade_with(Arc::new(ScriptedProvider)).await;
    facade
        .cache()
        .set("daily_orders:owner-7:a", b"1", Duration::from_secs(60))
        .await
        .unwrap();
    let app = create_admin_app(facade.clone());

    let response = app
        .clone()
        .oneshot(Request::get("/admin/cache/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["stats"]["memory"]["entries"], 1);

    let response = app
        .clone()
        .oneshot(
            Request::delete("/admin/cache/keys/daily_orders:owner-7:a")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["invalidated_count"], 1);

    // The public listener does not expose admin routes
    let public = create_gateway_app(facade);
    let response = public
        .oneshot(Request::get("/admin/cache/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
