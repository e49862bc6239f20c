//! Liveness, readiness and metrics

use crate::state::AppState;
use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use axum_helpers::{HealthCheckFuture, HealthResponse, run_health_checks};
use resilience::REDIS;
use serde_json::Value;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.config.app.name,
        version: state.config.app.version,
    })
}

/// 200 when every dependency answers, 503 otherwise.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let mut checks: Vec<(&str, HealthCheckFuture<'_>)> = vec![(
        "queue",
        Box::pin(async {
            if state.queue.is_stopped() {
                Err("stream consumers stopped".to_string())
            } else {
                Ok(())
            }
        }),
    )];

    if let Some(connection) = &state.redis {
        let mut conn = connection.clone();
        let breakers = state.breakers.clone();
        checks.push((
            "redis",
            Box::pin(async move {
                breakers
                    .execute(REDIS, || async move {
                        redis::cmd("PING").query_async::<String>(&mut conn).await
                    })
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }),
        ));
    }

    run_health_checks(checks).await
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        stream_queue::render_metrics(),
    )
}
