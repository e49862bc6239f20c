//! Token bucket limiter
//!
//! A bucket holds up to `capacity` tokens and regains `refill_rate` tokens per
//! second. Each request takes one token (or `n` with [`TokenBucketLimiter::allow_n`]).
//! State is `{tokens, last_refill}` under `token_bucket:<key>` and expires after
//! an hour without traffic.

use super::RateLimiter;
use super::store::CounterStore;
use crate::error::RateLimitError;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Buckets untouched for this long are forgotten.
pub const IDLE_TTL: Duration = Duration::from_secs(3600);

/// Shape of a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    pub capacity: f64,
    /// Tokens regained per second
    pub refill_rate: f64,
}

/// Persisted bucket state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_ms: i64,
}

/// Result of one take.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenGrant {
    pub allowed: bool,
    /// Tokens left after this request
    pub remaining: f64,
}

/// Refill `state` up to `now_ms` and try to take `requested` tokens.
///
/// A missing state starts full. The returned state is what gets persisted,
/// whether or not the take succeeded.
pub fn take(
    bucket: Bucket,
    state: Option<BucketState>,
    requested: f64,
    now_ms: i64,
) -> (TokenGrant, BucketState) {
    let BucketState {
        tokens,
        last_refill_ms,
    } = state.unwrap_or(BucketState {
        tokens: bucket.capacity,
        last_refill_ms: now_ms,
    });

    let elapsed_secs = (now_ms - last_refill_ms).max(0) as f64 / 1000.0;
    let mut tokens = bucket
        .capacity
        .min(tokens + elapsed_secs * bucket.refill_rate);

    let allowed = tokens >= requested;
    if allowed {
        tokens -= requested;
    }

    (
        TokenGrant {
            allowed,
            remaining: tokens,
        },
        BucketState {
            tokens,
            last_refill_ms: now_ms,
        },
    )
}

pub struct TokenBucketLimiter {
    store: Arc<dyn CounterStore>,
    bucket: Bucket,
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl TokenBucketLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        capacity: u64,
        refill_rate: f64,
    ) -> Result<Self, RateLimitError> {
        if capacity == 0 {
            return Err(RateLimitError::config("bucket capacity must be at least 1"));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(RateLimitError::config(format!(
                "refill rate must be a positive number, got {refill_rate}"
            )));
        }

        Ok(Self {
            store,
            bucket: Bucket {
                capacity: capacity as f64,
                refill_rate,
            },
        })
    }

    pub fn bucket(&self) -> Bucket {
        self.bucket
    }

    /// Take `n` tokens if available.
    pub async fn allow_n(&self, key: &str, n: u32) -> Result<bool, RateLimitError> {
        let grant = self
            .take_at(key, n, Utc::now().timestamp_millis())
            .await?;
        Ok(grant.allowed)
    }

    /// Take `n` tokens as of `now_ms` (Unix milliseconds).
    pub async fn take_at(
        &self,
        key: &str,
        n: u32,
        now_ms: i64,
    ) -> Result<TokenGrant, RateLimitError> {
        let grant = self
            .store
            .take_tokens(&bucket_key(key), self.bucket, f64::from(n), now_ms, IDLE_TTL)
            .await?;

        debug!(
            key = %key,
            allowed = grant.allowed,
            remaining = grant.remaining,
            "Token bucket check"
        );

        Ok(grant)
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn allow(&self, key: &str) -> Result<bool, RateLimitError> {
        self.allow_n(key, 1).await
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.store.delete(&bucket_key(key)).await
    }
}

pub fn bucket_key(key: &str) -> String {
    format!("token_bucket:{key}")
}
