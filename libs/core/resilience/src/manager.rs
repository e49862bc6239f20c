//! Named registry of circuit breakers

use crate::circuit_breaker::{BreakerStats, CircuitBreaker, CircuitBreakerConfig};
use crate::error::BreakerError;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Well-known breaker name for the relational database.
pub const DATABASE: &str = "database";

/// Well-known breaker name for Redis.
pub const REDIS: &str = "redis";

/// Holds breakers by name so independent call sites share state.
#[derive(Debug, Default)]
pub struct CircuitBreakerManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager preloaded with the `database` and `redis` presets.
    pub fn with_defaults() -> Self {
        let manager = Self::new();
        manager.register(DATABASE, CircuitBreakerConfig::database());
        manager.register(REDIS, CircuitBreakerConfig::redis());
        manager
    }

    /// Create and store a breaker under `name`, replacing any previous one.
    ///
    /// `name` wins over whatever `config.name` carried.
    pub fn register(
        &self,
        name: impl Into<String>,
        mut config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        let name = name.into();
        config.name = name.clone();
        let breaker = Arc::new(CircuitBreaker::new(config));

        let replaced = self
            .breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), breaker.clone())
            .is_some();
        debug!(name = %name, replaced, "Registered circuit breaker");

        breaker
    }

    pub fn get_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Route `f` through the named breaker.
    pub async fn execute<F, Fut, T, E>(&self, name: &str, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.get_breaker(name).ok_or_else(|| BreakerError::NotFound {
            name: name.to_string(),
        })?;
        breaker.execute(f).await
    }

    pub fn get_all_stats(&self) -> BTreeMap<String, BreakerStats> {
        self.get_all()
            .into_iter()
            .map(|b| (b.name().to_string(), b.stats()))
            .collect()
    }

    pub fn reset_all(&self) {
        for breaker in self.get_all() {
            breaker.reset();
        }
    }

    fn get_all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
