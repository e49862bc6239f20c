//! Limiter behaviour over the in-memory counter store.

use chrono::{DateTime, TimeZone, Utc};
use resilience::rate_limit::{Bucket, IDLE_TTL};
use resilience::{
    CounterStore, FixedWindowLimiter, MemoryCounterStore, RateLimitStrategy, RateLimiter,
    TokenBucketLimiter,
};
use std::sync::Arc;
use std::time::Duration;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

#[tokio::test]
async fn test_fixed_window_allows_exactly_limit() {
    let store = Arc::new(MemoryCounterStore::new());
    let limiter = FixedWindowLimiter::new(store, 3, Duration::from_secs(60)).unwrap();
    let now = at(1_800_000_010);

    for _ in 0..3 {
        assert!(limiter.allow_at("ip:1.2.3.4", now).await.unwrap());
    }
    assert!(!limiter.allow_at("ip:1.2.3.4", now).await.unwrap());

    // Other keys are counted separately.
    assert!(limiter.allow_at("ip:5.6.7.8", now).await.unwrap());
}

#[tokio::test]
async fn test_fixed_window_rolls_over() {
    let store = Arc::new(MemoryCounterStore::new());
    let limiter = FixedWindowLimiter::new(store, 1, Duration::from_secs(60)).unwrap();

    assert!(limiter.allow_at("user:7", at(1_800_000_059)).await.unwrap());
    assert!(!limiter.allow_at("user:7", at(1_800_000_059)).await.unwrap());
    assert!(limiter.allow_at("user:7", at(1_800_000_060)).await.unwrap());
}

#[tokio::test]
async fn test_fixed_window_reset_clears_every_window() {
    let store = Arc::new(MemoryCounterStore::new());
    let limiter = FixedWindowLimiter::new(store.clone(), 1, Duration::from_secs(60)).unwrap();

    limiter.allow_at("tenant:acme", at(1_800_000_000)).await.unwrap();
    limiter.allow_at("tenant:acme", at(1_800_000_060)).await.unwrap();
    limiter.allow_at("tenant:acme-eu", at(1_800_000_000)).await.unwrap();

    limiter.reset("tenant:acme").await.unwrap();

    assert_eq!(store.len(), 1);
    assert!(limiter.allow_at("tenant:acme", at(1_800_000_060)).await.unwrap());
    assert!(!limiter.allow_at("tenant:acme-eu", at(1_800_000_000)).await.unwrap());
}

#[tokio::test]
async fn test_token_bucket_burst_then_refill() {
    let store = Arc::new(MemoryCounterStore::new());
    let limiter = TokenBucketLimiter::new(store, 5, 1.0).unwrap();
    let t0 = 1_800_000_000_000;

    for _ in 0..5 {
        assert!(limiter.take_at("ip:a", 1, t0).await.unwrap().allowed);
    }
    let denied = limiter.take_at("ip:a", 1, t0).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0.0);

    // Two seconds refill two tokens.
    let grant = limiter.take_at("ip:a", 1, t0 + 2_000).await.unwrap();
    assert!(grant.allowed);
    assert_eq!(grant.remaining, 1.0);
}

#[tokio::test]
async fn test_token_bucket_denial_does_not_deduct() {
    let store = Arc::new(MemoryCounterStore::new());
    let limiter = TokenBucketLimiter::new(store, 4, 1.0).unwrap();
    let t0 = 1_800_000_000_000;

    assert!(!limiter.take_at("k", 5, t0).await.unwrap().allowed);
    let grant = limiter.take_at("k", 4, t0).await.unwrap();
    assert!(grant.allowed);
    assert_eq!(grant.remaining, 0.0);
}

#[tokio::test]
async fn test_token_bucket_reset() {
    let store = Arc::new(MemoryCounterStore::new());
    let limiter = TokenBucketLimiter::new(store.clone(), 1, 0.01).unwrap();

    assert!(limiter.allow("k").await.unwrap());
    assert!(!limiter.allow("k").await.unwrap());

    limiter.reset("k").await.unwrap();
    assert!(store.is_empty());
    assert!(limiter.allow("k").await.unwrap());
}

#[tokio::test]
async fn test_token_bucket_rejects_bad_configuration() {
    let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
    assert!(TokenBucketLimiter::new(store.clone(), 0, 1.0).is_err());
    assert!(TokenBucketLimiter::new(store.clone(), 10, 0.0).is_err());
    assert!(TokenBucketLimiter::new(store, 10, f64::NAN).is_err());
}

#[tokio::test]
async fn test_strategy_builds_equivalent_token_bucket() {
    let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
    let limiter = RateLimitStrategy::TokenBucket
        .build(store.clone(), 3, Duration::from_secs(60))
        .unwrap();

    for _ in 0..3 {
        assert!(limiter.allow("global:global").await.unwrap());
    }
    assert!(!limiter.allow("global:global").await.unwrap());

    // capacity = limit, refill = limit / window
    let grant = store
        .take_tokens(
            "token_bucket:trial",
            Bucket {
                capacity: 3.0,
                refill_rate: 3.0 / 60.0,
            },
            1.0,
            0,
            IDLE_TTL,
        )
        .await
        .unwrap();
    assert_eq!(grant.remaining, 2.0);
}
