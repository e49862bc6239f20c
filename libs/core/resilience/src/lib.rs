//! Resilience primitives for calls to external dependencies.
//!
//! - [`CircuitBreaker`] / [`CircuitBreakerManager`]: fail fast while a dependency
//!   is unhealthy, retry it after a cool-down, and close again once it recovers.
//! - [`rate_limit`]: fixed-window and token-bucket limiters over a shared
//!   [`CounterStore`](rate_limit::CounterStore).
//!
//! ```ignore
//! use resilience::{CircuitBreakerConfig, CircuitBreakerManager, REDIS};
//!
//! let breakers = CircuitBreakerManager::new();
//! breakers.register(REDIS, CircuitBreakerConfig::redis());
//!
//! let pong: String = breakers
//!     .execute(REDIS, || async { redis::cmd("PING").query_async(&mut conn).await })
//!     .await?;
//! ```

mod circuit_breaker;
mod duration;
mod error;
mod manager;
pub mod rate_limit;

pub use circuit_breaker::{
    BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitState, StateChangeCallback,
};
pub use duration::{format_duration, parse_duration};
pub use error::{BreakerError, RateLimitError};
pub use manager::{CircuitBreakerManager, DATABASE, REDIS};
pub use rate_limit::{
    CounterStore, FixedWindowLimiter, MemoryCounterStore, RateLimitStrategy, RateLimiter,
    RedisCounterStore, TokenBucketLimiter,
};
