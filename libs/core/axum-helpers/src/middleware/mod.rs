//! HTTP middleware
//!
//! Layer order used by the gateway (the last `.layer` runs first):
//!
//! ```ignore
//! let app = api
//!     .layer(from_fn_with_state(breaker, circuit_breaker_middleware))
//!     .layer(from_fn_with_state(limits, rate_limit_middleware))
//!     .layer(from_fn(security_headers))
//!     .layer(from_fn(request_id));
//! ```

pub mod circuit_breaker;
pub mod rate_limit;
pub mod request_id;
pub mod security;

pub use circuit_breaker::{
    CIRCUIT_BREAKER_OPEN, CIRCUIT_BREAKER_TIMEOUT, CircuitBreakerLayer, circuit_breaker_middleware,
};
pub use rate_limit::{
    RateLimitConfig, RateLimitState, RequestIdentity, ScopeLimit, rate_limit_middleware,
};
pub use request_id::{RequestId, X_REQUEST_ID, request_id};
pub use security::security_headers;
