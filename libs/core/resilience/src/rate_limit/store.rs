//! Counter storage shared by the limiters
//!
//! Redis is the deployment store, so every replica sees the same counters.
//! [`MemoryCounterStore`] runs the same arithmetic in process for tests and
//! single-instance setups.

use super::token_bucket::{self, Bucket, BucketState, TokenGrant};
use crate::error::RateLimitError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter at `key`, (re)arm its expiry to `window`, and
    /// return the new count.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, RateLimitError>;

    /// Atomically refill the bucket at `key` and try to take `requested` tokens.
    async fn take_tokens(
        &self,
        key: &str,
        bucket: Bucket,
        requested: f64,
        now_ms: i64,
        idle_ttl: Duration,
    ) -> Result<TokenGrant, RateLimitError>;

    async fn delete(&self, key: &str) -> Result<(), RateLimitError>;

    /// Delete every key starting with `prefix`; returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, RateLimitError>;
}

const TOKEN_BUCKET_SCRIPT: &str = r"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local bucket = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(bucket[1]) or capacity
local last_refill = tonumber(bucket[2]) or now

local elapsed = math.max(0, now - last_refill) / 1000
tokens = math.min(capacity, tokens + elapsed * refill_rate)

local allowed = 0
if tokens >= requested then
    tokens = tokens - requested
    allowed = 1
end

redis.call('HSET', key, 'tokens', tokens, 'last_refill', now)
redis.call('EXPIRE', key, ttl)
return {allowed, tostring(tokens)}
";

/// Redis-backed counters.
#[derive(Clone)]
pub struct RedisCounterStore {
    redis: ConnectionManager,
    script: redis::Script,
}

impl RedisCounterStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            script: redis::Script::new(TOKEN_BUCKET_SCRIPT),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, RateLimitError> {
        let mut conn = self.redis.clone();

        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(window.as_millis() as u64)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(count)
    }

    async fn take_tokens(
        &self,
        key: &str,
        bucket: Bucket,
        requested: f64,
        now_ms: i64,
        idle_ttl: Duration,
    ) -> Result<TokenGrant, RateLimitError> {
        let mut conn = self.redis.clone();

        let (allowed, remaining): (i64, String) = self
            .script
            .key(key)
            .arg(bucket.capacity)
            .arg(bucket.refill_rate)
            .arg(now_ms)
            .arg(requested)
            .arg(idle_ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;

        Ok(TokenGrant {
            allowed: allowed == 1,
            remaining: remaining.parse().unwrap_or(0.0),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), RateLimitError> {
        let mut conn = self.redis.clone();
        let _: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, RateLimitError> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut removed = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, removed, "Deleted counter keys");
        Ok(removed)
    }
}

/// Escape glob metacharacters so a key prefix matches literally in SCAN MATCH.
fn escape_glob(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[derive(Debug, Clone, Copy)]
enum Counter {
    Window(u64),
    Bucket(BucketState),
}

#[derive(Debug)]
struct Slot {
    counter: Counter,
    expires_at: Instant,
}

/// Writes between two sweeps of expired slots
pub const SWEEP_EVERY: usize = 1024;

#[derive(Debug, Default)]
struct Slots {
    map: HashMap<String, Slot>,
    writes: usize,
}

impl Slots {
    fn live(&self, key: &str, now: Instant) -> Option<Counter> {
        self.map
            .get(key)
            .filter(|slot| slot.expires_at > now)
            .map(|slot| slot.counter)
    }

    /// Store `slot` and drop expired slots every `SWEEP_EVERY` writes.
    fn put(&mut self, key: &str, slot: Slot, now: Instant) {
        self.map.insert(key.to_string(), slot);
        self.writes += 1;
        if self.writes >= SWEEP_EVERY {
            self.writes = 0;
            let before = self.map.len();
            self.map.retain(|_, slot| slot.expires_at > now);
            debug!(swept = before - self.map.len(), "Expired rate limit counters dropped");
        }
    }
}

/// Process-local counters with the same expiry behaviour as Redis.
///
/// Expired keys read as absent immediately and are reclaimed in periodic sweeps.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    slots: Mutex<Slots>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .map
            .values()
            .filter(|slot| slot.expires_at > now)
            .count()
    }

    /// Keys held in memory, including expired ones not yet swept.
    pub fn stored(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, RateLimitError> {
        let now = Instant::now();
        let mut slots = self.lock();

        let count = match slots.live(key, now) {
            Some(Counter::Window(count)) => count + 1,
            _ => 1,
        };
        slots.put(
            key,
            Slot {
                counter: Counter::Window(count),
                expires_at: now + window,
            },
            now,
        );

        Ok(count)
    }

    async fn take_tokens(
        &self,
        key: &str,
        bucket: Bucket,
        requested: f64,
        now_ms: i64,
        idle_ttl: Duration,
    ) -> Result<TokenGrant, RateLimitError> {
        let now = Instant::now();
        let mut slots = self.lock();

        let state = match slots.live(key, now) {
            Some(Counter::Bucket(state)) => Some(state),
            _ => None,
        };
        let (grant, state) = token_bucket::take(bucket, state, requested, now_ms);
        slots.put(
            key,
            Slot {
                counter: Counter::Bucket(state),
                expires_at: now + idle_ttl,
            },
            now,
        );

        Ok(grant)
    }

    async fn delete(&self, key: &str) -> Result<(), RateLimitError> {
        self.lock().map.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, RateLimitError> {
        let mut slots = self.lock();
        let before = slots.map.len();
        slots.map.retain(|key, _| !key.starts_with(prefix));
        Ok((before - slots.map.len()) as u64)
    }
}
