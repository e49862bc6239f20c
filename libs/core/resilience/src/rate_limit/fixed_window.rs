//! Fixed-window counter limiter

use super::RateLimiter;
use super::store::CounterStore;
use crate::duration::format_duration;
use crate::error::RateLimitError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Counts requests per `(key, window start)` and allows at most `limit` per window.
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    limit: u64,
    window: Duration,
}

impl std::fmt::Debug for FixedWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindowLimiter")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl FixedWindowLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        limit: u64,
        window: Duration,
    ) -> Result<Self, RateLimitError> {
        if limit == 0 {
            return Err(RateLimitError::config("limit must be at least 1"));
        }
        if window < Duration::from_secs(1) {
            return Err(RateLimitError::config(format!(
                "window must be at least one second, got {}",
                format_duration(window)
            )));
        }

        Ok(Self {
            store,
            limit,
            window,
        })
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count one request at `now` and return the window's running total.
    pub async fn hit_at(&self, key: &str, now: DateTime<Utc>) -> Result<u64, RateLimitError> {
        let redis_key = self.window_key(key, now);
        let count = self.store.incr_window(&redis_key, self.window).await?;

        debug!(key = %key, count, limit = self.limit, "Rate limit check");
        Ok(count)
    }

    pub async fn allow_at(&self, key: &str, now: DateTime<Utc>) -> Result<bool, RateLimitError> {
        Ok(self.hit_at(key, now).await? <= self.limit)
    }

    /// `rate_limit:<key>:<window start, Unix seconds>`
    pub fn window_key(&self, key: &str, now: DateTime<Utc>) -> String {
        format!("rate_limit:{key}:{}", window_start(now, self.window))
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn allow(&self, key: &str) -> Result<bool, RateLimitError> {
        self.allow_at(key, Utc::now()).await
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        let removed = self
            .store
            .delete_prefix(&format!("rate_limit:{key}:"))
            .await?;
        debug!(key = %key, removed, "Rate limit reset");
        Ok(())
    }
}

/// Start of the window containing `now`, in Unix seconds.
fn window_start(now: DateTime<Utc>, window: Duration) -> i64 {
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    let now_ms = now.timestamp_millis();
    (now_ms - now_ms.rem_euclid(window_ms)) / 1000
}
