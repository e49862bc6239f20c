//! # Axum Helpers
//!
//! HTTP adapters that put the resilience primitives in front of an Axum app.
//!
//! ## Modules
//!
//! - **[`middleware`]**: rate limiting, circuit breaking, request ids, security headers
//! - **[`errors`]**: JSON error bodies
//! - **[`client_ip`]**: client address resolution behind proxies
//! - **[`server`]**: serving, readiness checks, graceful shutdown

pub mod client_ip;
pub mod errors;
pub mod middleware;
pub mod server;

pub use client_ip::{client_ip, extract_ip_from_headers, extract_ip_from_socket};
pub use errors::{AppError, ErrorResponse, not_found};
pub use middleware::{
    CircuitBreakerLayer, RateLimitConfig, RateLimitState, RequestId, RequestIdentity, ScopeLimit,
    circuit_breaker_middleware, rate_limit_middleware, request_id, security_headers,
};
pub use server::{HealthCheckFuture, HealthResponse, run_health_checks, serve, shutdown_signal};
