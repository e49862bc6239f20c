//! Route-level circuit breaking
//!
//! Requests pass through a named breaker. A 5xx response counts as a failure
//! (and is still returned to the client); an open breaker answers 503 without
//! reaching the handler.

use crate::errors::ErrorResponse;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use resilience::{BreakerError, CircuitBreaker, CircuitBreakerManager, format_duration};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::warn;

pub const CIRCUIT_BREAKER_OPEN: &str = "CIRCUIT_BREAKER_OPEN";
pub const CIRCUIT_BREAKER_TIMEOUT: &str = "CIRCUIT_BREAKER_TIMEOUT";

/// State for [`circuit_breaker_middleware`]: one registered breaker.
#[derive(Clone, Debug)]
pub struct CircuitBreakerLayer {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerLayer {
    /// Look up `name` in `manager`; the breaker must already be registered.
    pub fn new(manager: &CircuitBreakerManager, name: &str) -> Result<Self, BreakerError<Infallible>> {
        let breaker = manager
            .get_breaker(name)
            .ok_or_else(|| BreakerError::NotFound {
                name: name.to_string(),
            })?;
        Ok(Self { breaker })
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

pub async fn circuit_breaker_middleware(
    State(layer): State<CircuitBreakerLayer>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let outcome = layer
        .breaker
        .execute(|| async move {
            let response = next.run(request).await;
            if response.status().is_server_error() {
                Err(response)
            } else {
                Ok(response)
            }
        })
        .await;

    match outcome {
        Ok(response) | Err(BreakerError::Inner(response)) => response,
        Err(BreakerError::Timeout { name, timeout }) => {
            warn!(breaker = %name, path = %path, timeout = ?timeout, "Request timed out in circuit breaker");
            ErrorResponse::new(
                "Gateway timeout",
                format!("Upstream did not respond within {}", format_duration(timeout)),
            )
            .with_code(CIRCUIT_BREAKER_TIMEOUT)
            .into_response_with(StatusCode::GATEWAY_TIMEOUT)
        }
        Err(BreakerError::Open { name } | BreakerError::NotFound { name }) => {
            warn!(breaker = %name, path = %path, "Request rejected by open circuit breaker");
            ErrorResponse::new("Service temporarily unavailable", "Circuit breaker is open")
                .with_code(CIRCUIT_BREAKER_OPEN)
                .into_response_with(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, middleware, routing::get};
    use http_body_util::BodyExt;
    use resilience::{CircuitBreakerConfig, CircuitState};
    use std::time::Duration;
    use tower::ServiceExt;

    fn get_request(uri: &str) -> Request {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn app(config: CircuitBreakerConfig) -> (Router, Arc<CircuitBreaker>) {
        let manager = CircuitBreakerManager::new();
        manager.register("gateway", config);
        let layer = CircuitBreakerLayer::new(&manager, "gateway").unwrap();
        let breaker = layer.breaker().clone();

        let router = Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route(
                "/broken",
                get(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
            )
            .route(
                "/missing",
                get(|| async { (StatusCode::NOT_FOUND, "nope") }),
            )
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            )
            .layer(middleware::from_fn_with_state(layer, circuit_breaker_middleware));

        (router, breaker)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_unknown_breaker_is_rejected() {
        let err = CircuitBreakerLayer::new(&CircuitBreakerManager::new(), "gateway").unwrap_err();
        assert!(matches!(err, BreakerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_server_errors_open_the_breaker() {
        let (app, breaker) = app(CircuitBreakerConfig::default().with_max_failures(2));

        for _ in 0..2 {
            let response = app.clone().oneshot(get_request("/broken")).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let response = app.oneshot(get_request("/ok")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = body_json(response).await;
        assert_eq!(body["error"], "Service temporarily unavailable");
        assert_eq!(body["message"], "Circuit breaker is open");
        assert_eq!(body["code"], CIRCUIT_BREAKER_OPEN);
    }

    #[tokio::test]
    async fn test_client_errors_are_successes() {
        let (app, breaker) = app(CircuitBreakerConfig::default().with_max_failures(1));

        let response = app.oneshot(get_request("/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out() {
        let (app, breaker) = app(
            CircuitBreakerConfig::default()
                .with_max_failures(1)
                .with_timeout(Duration::from_millis(100)),
        );

        let response = app.oneshot(get_request("/slow")).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_json(response).await["code"], CIRCUIT_BREAKER_TIMEOUT);
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
