//! Request rate limiting
//!
//! Two interchangeable strategies sit behind [`RateLimiter`]:
//!
//! - [`FixedWindowLimiter`] counts requests per aligned window
//!   (`rate_limit:<key>:<window start>`).
//! - [`TokenBucketLimiter`] keeps a refilling bucket per key
//!   (`token_bucket:<key>`).
//!
//! Both keep their state in a [`CounterStore`], normally Redis.

mod fixed_window;
mod store;
mod token_bucket;

pub use fixed_window::FixedWindowLimiter;
pub use store::{CounterStore, MemoryCounterStore, RedisCounterStore};
pub use token_bucket::{Bucket, BucketState, IDLE_TTL, TokenBucketLimiter, TokenGrant, bucket_key};

use crate::error::RateLimitError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record one request for `key`; `false` means it should be rejected.
    async fn allow(&self, key: &str) -> Result<bool, RateLimitError>;

    /// Forget everything recorded for `key`.
    async fn reset(&self, key: &str) -> Result<(), RateLimitError>;
}

/// Which algorithm to build for a `(limit, window)` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[derive(Serialize, Deserialize, Display, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RateLimitStrategy {
    #[default]
    FixedWindow,
    TokenBucket,
}

impl RateLimitStrategy {
    /// Build a limiter allowing `limit` requests per `window`.
    ///
    /// A token bucket gets `capacity = limit` and refills `limit / window`
    /// tokens per second, so both strategies admit the same sustained rate.
    pub fn build(
        self,
        store: Arc<dyn CounterStore>,
        limit: u64,
        window: Duration,
    ) -> Result<Arc<dyn RateLimiter>, RateLimitError> {
        match self {
            RateLimitStrategy::FixedWindow => {
                Ok(Arc::new(FixedWindowLimiter::new(store, limit, window)?))
            }
            RateLimitStrategy::TokenBucket => {
                if window < Duration::from_secs(1) {
                    return Err(RateLimitError::config(
                        "window must be at least one second",
                    ));
                }
                let refill_rate = limit as f64 / window.as_secs_f64();
                Ok(Arc::new(TokenBucketLimiter::new(store, limit, refill_rate)?))
            }
        }
    }
}
