//! Circuit breaker
//!
//! ## States
//!
//! ```text
//! ┌─────────┐  failures >= max_failures  ┌────────┐
//! │ CLOSED  │ ─────────────────────────> │  OPEN  │ <──────┐
//! └─────────┘                            └────────┘        │
//!      ^                                      │            │
//!      │                                      │ reset_timeout elapsed
//!      │                                      v            │
//!      │  successes >= success_threshold ┌───────────┐     │ any failure
//!      └──────────────────────────────── │ HALF_OPEN │ ────┘
//!                                        └───────────┘
//! ```
//!
//! Counters and state live in process memory behind one mutex; every replica
//! trips independently.
//!
//! ## Example
//!
//! ```rust,ignore
//! use resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::new("billing-api"));
//!
//! match breaker.execute(|| client.charge(&order)).await {
//!     Ok(receipt) => { /* ... */ }
//!     Err(e) if e.is_open() => { /* fail fast */ }
//!     Err(e) => { /* timeout or call error */ }
//! }
//! ```

use crate::duration::serde_go;
use crate::error::BreakerError;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};
use tokio::time::Instant;
use tracing::{info, warn};

pub const DEFAULT_MAX_FAILURES: u32 = 5;
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected without being attempted
    Open,
    /// Trial calls are let through to test recovery
    HalfOpen,
}

/// Invoked with `(name, from, to)` after every transition.
pub type StateChangeCallback = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Configuration for one breaker.
#[derive(Clone, Serialize)]
pub struct CircuitBreakerConfig {
    pub name: String,

    /// Consecutive failures in `Closed` that open the breaker
    pub max_failures: u32,

    /// Time spent `Open` before a trial call is let through
    #[serde(with = "serde_go")]
    pub reset_timeout: Duration,

    /// Successes in `HalfOpen` needed to close again
    pub success_threshold: u32,

    /// Time budget per call; zero disables the limit
    #[serde(with = "serde_go")]
    pub timeout: Duration,

    #[serde(skip)]
    pub on_state_change: Option<StateChangeCallback>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_failures: DEFAULT_MAX_FAILURES,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            timeout: DEFAULT_TIMEOUT,
            on_state_change: None,
        }
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("name", &self.name)
            .field("max_failures", &self.max_failures)
            .field("reset_timeout", &self.reset_timeout)
            .field("success_threshold", &self.success_threshold)
            .field("timeout", &self.timeout)
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Relational database: 5 failures, 30s open, 3 trial calls, 5s per call.
    pub fn database() -> Self {
        Self::new(crate::manager::DATABASE)
            .with_max_failures(5)
            .with_reset_timeout(Duration::from_secs(30))
            .with_success_threshold(3)
            .with_timeout(Duration::from_secs(5))
    }

    /// Redis: 3 failures, 15s open, 2 trial calls, 3s per call.
    pub fn redis() -> Self {
        Self::new(crate::manager::REDIS)
            .with_max_failures(3)
            .with_reset_timeout(Duration::from_secs(15))
            .with_success_threshold(2)
            .with_timeout(Duration::from_secs(3))
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn with_reset_timeout(mut self, reset_timeout: Duration) -> Self {
        self.reset_timeout = reset_timeout;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn on_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(callback));
        self
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub last_fail_time: Option<DateTime<Utc>>,
    pub config: CircuitBreakerConfig,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
    last_fail_time: Option<DateTime<Utc>>,
}

/// A state change to announce once the lock is released.
#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
    failures: u32,
}

/// Thread-safe circuit breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("inner", &*self.lock())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
                last_fail_time: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            name: self.config.name.clone(),
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            last_fail_time: inner.last_fail_time,
            config: self.config.clone(),
        }
    }

    /// Run `f` under breaker protection.
    ///
    /// An open breaker rejects the call without invoking `f`. A call that
    /// outlives `timeout` is dropped and counted as a failure.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.can_execute() {
            return Err(BreakerError::Open {
                name: self.config.name.clone(),
            });
        }

        let outcome = if self.config.timeout.is_zero() {
            Ok(f().await)
        } else {
            tokio::time::timeout(self.config.timeout, f()).await
        };

        match outcome {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure();
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                self.on_failure();
                Err(BreakerError::Timeout {
                    name: self.config.name.clone(),
                    timeout: self.config.timeout,
                })
            }
        }
    }

    /// Whether a call may proceed now.
    ///
    /// An `Open` breaker whose reset timeout has elapsed moves to `HalfOpen`
    /// here and lets the triggering call through.
    pub fn can_execute(&self) -> bool {
        let (allowed, transition) = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => (true, None),
                CircuitState::Open => {
                    let elapsed = inner
                        .last_failure
                        .map(|t| t.elapsed())
                        .unwrap_or(Duration::MAX);
                    if elapsed >= self.config.reset_timeout {
                        (true, Some(set_state(&mut inner, CircuitState::HalfOpen)))
                    } else {
                        (false, None)
                    }
                }
            }
        };

        self.announce(transition);
        allowed
    }

    /// Record a successful call.
    pub fn on_success(&self) {
        let transition = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    inner.successes += 1;
                    if inner.successes >= self.config.success_threshold {
                        let transition = set_state(&mut inner, CircuitState::Closed);
                        inner.failures = 0;
                        inner.successes = 0;
                        Some(transition)
                    } else {
                        None
                    }
                }
                // A call admitted before the breaker opened; counters stay frozen.
                CircuitState::Open => None,
            }
        };

        self.announce(transition);
    }

    /// Record a failed call.
    pub fn on_failure(&self) {
        let transition = {
            let mut inner = self.lock();
            if inner.state == CircuitState::Open {
                None
            } else {
                inner.failures += 1;
                inner.last_failure = Some(Instant::now());
                inner.last_fail_time = Some(Utc::now());

                match inner.state {
                    CircuitState::Closed if inner.failures >= self.config.max_failures => {
                        Some(set_state(&mut inner, CircuitState::Open))
                    }
                    CircuitState::HalfOpen => {
                        let transition = set_state(&mut inner, CircuitState::Open);
                        inner.successes = 0;
                        Some(transition)
                    }
                    _ => None,
                }
            }
        };

        self.announce(transition);
    }

    /// Force the breaker back to `Closed` with zeroed counters.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.lock();
            inner.failures = 0;
            inner.successes = 0;
            (inner.state != CircuitState::Closed).then(|| set_state(&mut inner, CircuitState::Closed))
        };

        self.announce(transition);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce(&self, transition: Option<Transition>) {
        let Some(Transition { from, to, failures }) = transition else {
            return;
        };

        if to == CircuitState::Open {
            warn!(name = %self.config.name, %from, %to, failures, "Circuit breaker state changed");
        } else {
            info!(name = %self.config.name, %from, %to, failures, "Circuit breaker state changed");
        }

        counter!(
            "circuit_breaker_transitions_total",
            "name" => self.config.name.clone(),
            "state" => to.to_string()
        )
        .increment(1);

        if let Some(callback) = &self.config.on_state_change {
            callback(&self.config.name, from, to);
        }
    }
}

fn set_state(inner: &mut Inner, to: CircuitState) -> Transition {
    let from = inner.state;
    inner.state = to;
    Transition {
        from,
        to,
        failures: inner.failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(max_failures: u32, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::new("test")
                .with_max_failures(max_failures)
                .with_success_threshold(success_threshold)
                .with_reset_timeout(Duration::from_secs(30))
                .with_timeout(Duration::from_secs(1)),
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> BreakerError<&'static str> {
        breaker
            .execute(|| async { Err::<(), _>("boom") })
            .await
            .unwrap_err()
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, BreakerError<&'static str>> {
        breaker.execute(|| async { Ok(7) }).await
    }

    #[test]
    fn test_state_names() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
        assert_eq!(
            serde_json::to_string(&CircuitState::Open).unwrap(),
            "\"OPEN\""
        );
    }

    #[tokio::test]
    async fn test_initial_state_is_closed() {
        let breaker = breaker(3, 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_opens_after_exactly_max_failures() {
        let breaker = breaker(3, 2);

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        let err = fail(&breaker).await;
        assert!(matches!(err, BreakerError::Inner("boom")));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_breaker_does_not_invoke_call() {
        let breaker = breaker(1, 1);
        fail(&breaker).await;

        let calls = AtomicU32::new(0);
        let err = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_open());
        assert_eq!(err.to_string(), "circuit breaker 'test' is open");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count_while_closed() {
        let breaker = breaker(3, 2);
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.stats().failures, 2);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.stats().failures, 0);

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_reset_timeout_then_closes() {
        let breaker = breaker(1, 2);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(fail(&breaker).await.is_open());

        tokio::time::advance(Duration::from_secs(1)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.stats().successes, 1);

        succeed(&breaker).await.unwrap();
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_in_half_open_reopens() {
        let breaker = breaker(2, 3);
        fail(&breaker).await;
        fail(&breaker).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.stats().successes, 0);

        // The reopen restarts the reset timeout.
        assert!(fail(&breaker).await.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::new("slow")
                .with_max_failures(1)
                .with_timeout(Duration::from_millis(100)),
        );

        let err = breaker
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, &str>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_state_change_callback_sees_every_transition() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::new("callback")
                .with_max_failures(1)
                .with_reset_timeout(Duration::ZERO)
                .with_success_threshold(1)
                .on_state_change(move |name, from, to| {
                    recorder.lock().unwrap().push((name.to_string(), from, to));
                }),
        );

        fail(&breaker).await;
        succeed(&breaker).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("callback".to_string(), CircuitState::Closed, CircuitState::Open),
                ("callback".to_string(), CircuitState::Open, CircuitState::HalfOpen),
                ("callback".to_string(), CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_reset_forces_closed() {
        let breaker = breaker(1, 1);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
    }

    #[test]
    fn test_stats_serialize_like_the_admin_payload() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::redis());
        let json = serde_json::to_value(breaker.stats()).unwrap();

        assert_eq!(json["name"], "redis");
        assert_eq!(json["state"], "CLOSED");
        assert_eq!(json["failures"], 0);
        assert_eq!(json["last_fail_time"], serde_json::Value::Null);
        assert_eq!(json["config"]["max_failures"], 3);
        assert_eq!(json["config"]["reset_timeout"], "15s");
        assert_eq!(json["config"]["timeout"], "3s");
    }

    #[test]
    fn test_presets() {
        let db = CircuitBreakerConfig::database();
        assert_eq!(db.name, "database");
        assert_eq!(db.max_failures, 5);
        assert_eq!(db.success_threshold, 3);
        assert_eq!(db.timeout, Duration::from_secs(5));
    }
}
