//! HTTP routes
//!
//! ```text
//! /health, /ready, /metrics       health checks, never rate limited
//! /admin/...                      queue and breaker inspection, internal network only
//! /api/v1/...                     rate limited, behind the `gateway` breaker
//! ```

pub mod admin;
pub mod events;
pub mod health;

use crate::GATEWAY;
use crate::state::AppState;
use axum::{
    Router,
    extract::Request,
    http::HeaderMap,
    middleware::{self, Next},
    response::Response,
};
use axum_helpers::{
    AppError, CircuitBreakerLayer, RateLimitState, RequestIdentity, circuit_breaker_middleware,
    not_found, rate_limit_middleware, request_id, security_headers,
};
use resilience::{BreakerError, REDIS};
use stream_queue::StreamError;
use tower_http::trace::TraceLayer;
use tracing::error;

pub const X_USER_ID: &str = "x-user-id";
pub const X_TENANT_ID: &str = "x-tenant-id";

/// Assemble the full application router.
///
/// Fails if the `gateway` breaker was not registered on `state.breakers`.
pub fn router(state: AppState, limits: RateLimitState) -> eyre::Result<Router> {
    let breaker = CircuitBreakerLayer::new(&state.breakers, GATEWAY)?;

    let api = Router::new()
        .nest("/events", events::router())
        .layer(middleware::from_fn_with_state(breaker, circuit_breaker_middleware))
        .layer(middleware::from_fn_with_state(limits, rate_limit_middleware))
        .layer(middleware::from_fn(identity_from_headers));

    Ok(Router::new()
        .nest("/api/v1", api)
        .nest("/admin", admin::router())
        .merge(health::router())
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(security_headers))
        .layer(middleware::from_fn(request_id)))
}

/// Caller identity as forwarded by the authenticating proxy.
fn identity(headers: &HeaderMap) -> RequestIdentity {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    RequestIdentity {
        user_id: header(X_USER_ID),
        tenant_id: header(X_TENANT_ID),
    }
}

async fn identity_from_headers(mut request: Request, next: Next) -> Response {
    if request.extensions().get::<RequestIdentity>().is_none() {
        let identity = identity(request.headers());
        request.extensions_mut().insert(identity);
    }
    next.run(request).await
}

/// Map a queue failure onto an HTTP error.
pub(crate) fn queue_error(err: StreamError) -> AppError {
    match err {
        StreamError::UnknownStream(stream) => {
            AppError::NotFound(format!("stream '{stream}' is not registered"))
        }
        StreamError::Config(msg) | StreamError::Serialization(msg) => AppError::BadRequest(msg),
        other => {
            error!(error = %other, "Queue operation failed");
            AppError::ServiceUnavailable("Queue backend unavailable".to_string())
        }
    }
}

/// Run a queue call through the `redis` breaker.
///
/// Caller errors are returned as-is and never recorded as breaker failures.
pub(crate) async fn guarded_queue_call<T, F, Fut>(state: &AppState, f: F) -> Result<T, AppError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, StreamError>>,
{
    state
        .breakers
        .execute(REDIS, || async move {
            match f().await {
                Err(e) if e.is_caller_error() => Ok(Err(e)),
                other => other.map(Ok),
            }
        })
        .await
        .map_err(guarded_queue_error)?
        .map_err(queue_error)
}

/// Map a queue call made through a breaker onto an HTTP error.
pub(crate) fn guarded_queue_error(err: BreakerError<StreamError>) -> AppError {
    match err {
        BreakerError::Inner(e) => queue_error(e),
        BreakerError::Timeout { name, timeout } => AppError::GatewayTimeout(format!(
            "circuit breaker '{name}' timed out after {timeout:?}"
        )),
        open @ (BreakerError::Open { .. } | BreakerError::NotFound { .. }) => {
            AppError::ServiceUnavailable(open.to_string())
        }
    }
}
