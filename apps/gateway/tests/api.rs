//! Router behaviour over in-memory stores.

use axum::{Router, body::Body, http::StatusCode, response::Response};
use axum_helpers::{RateLimitConfig, RateLimitState, ScopeLimit};
use core_config::{
    AppInfo, Environment, queue::QueueSettings, redis::RedisConfig, server::ServerConfig,
};
use http_body_util::BodyExt;
use queue_gateway::{api, build_breakers, config::Config, events, state::AppState};
use resilience::{MemoryCounterStore, RateLimitStrategy};
use serde_json::{Value, json};
use std::sync::Arc;
use stream_queue::message::fields;
use stream_queue::{
    MAX_DELAY, MemoryStreamStore, StreamQueueManager, StreamStore, dlq_stream_name,
};
use tower::ServiceExt;

struct TestApp {
    router: Router,
    store: Arc<MemoryStreamStore>,
    queue: Arc<StreamQueueManager>,
}

fn config(rate_limit: RateLimitConfig) -> Config {
    Config {
        app: AppInfo {
            name: "queue-gateway",
            version: "0.0.0-test",
        },
        environment: Environment::Development,
        server: ServerConfig::new("127.0.0.1".to_string(), 0),
        redis: RedisConfig::new("redis://127.0.0.1:6379"),
        queue: QueueSettings::default(),
        rate_limit,
    }
}

fn generous_limits() -> RateLimitConfig {
    RateLimitConfig {
        strategy: RateLimitStrategy::TokenBucket,
        global: ScopeLimit::new(10_000, "1h"),
        per_ip: ScopeLimit::new(10_000, "1h"),
        per_user: ScopeLimit::new(10_000, "1h"),
        per_tenant: ScopeLimit::new(10_000, "1h"),
    }
}

async fn test_app(rate_limit: RateLimitConfig) -> TestApp {
    let config = config(rate_limit);
    let store = Arc::new(MemoryStreamStore::new());
    let queue = Arc::new(StreamQueueManager::new(store.clone()));
    events::register_streams(&queue, &config.queue).await.unwrap();

    let limits = RateLimitState::new(Arc::new(MemoryCounterStore::new()), &config.rate_limit).unwrap();
    let state = AppState {
        config: Arc::new(config),
        queue: queue.clone(),
        breakers: Arc::new(build_breakers()),
        redis: None,
    };

    TestApp {
        router: api::router(state, limits).unwrap(),
        store,
        queue,
    }
}

fn request(method: &str, uri: &str, body: Option<Value>) -> axum::http::Request<Body> {
    let builder = axum::http::Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", "203.0.113.9");
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_and_ready() {
    let app = test_app(generous_limits()).await;

    let response = app.router.clone().oneshot(request("GET", "/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["name"], "queue-gateway");

    let response = app.router.clone().oneshot(request("GET", "/ready", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["queue"], "up");
    assert!(body.get("redis").is_none());

    app.queue.stop().await;
    let response = app.router.oneshot(request("GET", "/ready", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["queue"], "down");
}

#[tokio::test]
async fn test_publish_event() {
    let app = test_app(generous_limits()).await;

    let response = app
        .router
        .oneshot(request(
            "POST",
            "/api/v1/events/user_events",
            Some(json!({"type": "signup", "user_id": 42})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(response.headers().contains_key("x-ratelimit-limit"));

    let body = body_json(response).await;
    assert_eq!(body["stream"], events::USER_EVENTS);
    assert!(body.get("delayed_until").is_none());

    let id = body["id"].as_str().unwrap();
    let entry = app.store.get(events::USER_EVENTS, id).await.unwrap().unwrap();
    assert!(entry.fields.contains(&("type".to_string(), "\"signup\"".to_string())));
}

#[tokio::test]
async fn test_publish_delayed_event() {
    let app = test_app(generous_limits()).await;

    let response = app
        .router
        .oneshot(request(
            "POST",
            "/api/v1/events/user_events?delay_secs=60",
            Some(json!({"type": "reminder"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(body_json(response).await["delayed_until"].is_string());

    assert_eq!(app.store.len(events::USER_EVENTS).await.unwrap(), 0);
    assert_eq!(app.store.len("user_events_delayed").await.unwrap(), 1);
}

#[tokio::test]
async fn test_out_of_range_delay_is_rejected_without_tripping_breakers() {
    let app = test_app(generous_limits()).await;

    let too_long = MAX_DELAY.as_secs() + 1;
    for delay_secs in [too_long, 9_000_000_000_000, u64::MAX, too_long] {
        let response = app
            .router
            .clone()
            .oneshot(request(
                "POST",
                &format!("/api/v1/events/user_events?delay_secs={delay_secs}"),
                Some(json!({"type": "reminder"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "delay_secs={delay_secs}");
    }
    for _ in 0..4 {
        let response = app
            .router
            .clone()
            .oneshot(request("POST", "/api/v1/events/unknown", Some(json!({"n": 1}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
    assert_eq!(app.store.len("user_events_delayed").await.unwrap(), 0);

    let response = app
        .router
        .clone()
        .oneshot(request(
            "POST",
            "/api/v1/events/user_events",
            Some(json!({"type": "signup"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .router
        .oneshot(request("GET", "/admin/breakers/stats", None))
        .await
        .unwrap();
    let body = body_json(response).await;
    for name in ["gateway", "redis"] {
        assert_eq!(body[name]["state"], "CLOSED", "breaker {name}");
        assert_eq!(body[name]["failures"], 0, "breaker {name}");
    }
}

#[tokio::test]
async fn test_publish_rejections() {
    let app = test_app(generous_limits()).await;

    let response = app
        .router
        .clone()
        .oneshot(request("POST", "/api/v1/events/orders", Some(json!({"id": 1}))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");

    let response = app
        .router
        .clone()
        .oneshot(request("POST", "/api/v1/events/user_events", Some(json!([1, 2]))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(response).await["code"], "INVALID_JSON");

    let response = app
        .router
        .oneshot(request("POST", "/api/v1/events/user_events", Some(json!({}))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_api_is_rate_limited_per_ip() {
    let mut limits = generous_limits();
    limits.per_ip = ScopeLimit::new(2, "1h");
    let app = test_app(limits).await;

    for _ in 0..2 {
        let response = app
            .router
            .clone()
            .oneshot(request("POST", "/api/v1/events/user_events", Some(json!({"n": 1}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    let response = app
        .router
        .clone()
        .oneshot(request("POST", "/api/v1/events/user_events", Some(json!({"n": 1}))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "3600");
    assert_eq!(body_json(response).await["error"], "Rate limit exceeded");

    // Health checks are outside the limited tree
    let response = app.router.oneshot(request("GET", "/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_stats() {
    let app = test_app(generous_limits()).await;

    let response = app
        .router
        .clone()
        .oneshot(request("GET", "/admin/breakers/stats", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    for name in ["database", "gateway", "redis"] {
        assert_eq!(body[name]["state"], "CLOSED", "breaker {name}");
    }
    assert_eq!(body["redis"]["config"]["max_failures"], 3);

    let response = app
        .router
        .oneshot(request("GET", "/admin/queues/stats", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["user_events"]["consumer_group"], "gateway_consumers");
    assert_eq!(body["user_events"]["length"], 0);
}

#[tokio::test]
async fn test_dead_letter_listing_and_requeue() {
    let app = test_app(generous_limits()).await;
    let dlq = dlq_stream_name(events::USER_EVENTS);
    let dead_id = app
        .store
        .append(
            &dlq,
            &[
                ("type".to_string(), "\"signup\"".to_string()),
                (fields::ERROR.to_string(), "mailer down".to_string()),
                (fields::ATTEMPTS.to_string(), "4".to_string()),
            ],
            None,
        )
        .await
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(request("GET", "/admin/queues/user_events/dlq?count=10", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["entries"][0]["id"], dead_id.as_str());
    assert_eq!(body["entries"][0]["error"], "mailer down");
    assert_eq!(body["entries"][0]["data"]["type"], "signup");
    assert!(body.get("next").is_none());

    let response = app
        .router
        .clone()
        .oneshot(request(
            "POST",
            &format!("/admin/queues/user_events/dlq/{dead_id}/requeue"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(app.store.len(&dlq).await.unwrap(), 0);
    assert_eq!(app.store.len(events::USER_EVENTS).await.unwrap(), 1);

    let response = app
        .router
        .clone()
        .oneshot(request(
            "DELETE",
            &format!("/admin/queues/user_events/dlq/{dead_id}"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .router
        .oneshot(request("GET", "/admin/queues/orders/dlq", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_route_falls_back() {
    let app = test_app(generous_limits()).await;
    let response = app.router.oneshot(request("GET", "/nope", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");
}
