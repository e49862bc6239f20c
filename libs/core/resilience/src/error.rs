//! Error types for breakers and limiters

use std::time::Duration;
use thiserror::Error;

/// Outcome of a call routed through a circuit breaker.
///
/// `Inner` carries the protected call's own error untouched.
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    /// The breaker is open; the call was not attempted
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    /// The call exceeded the breaker's time budget and was cancelled
    #[error("circuit breaker '{name}' timeout exceeded ({timeout:?})")]
    Timeout { name: String, timeout: Duration },

    /// No breaker registered under this name
    #[error("circuit breaker '{name}' not found")]
    NotFound { name: String },

    /// The call ran and failed
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BreakerError::Timeout { .. })
    }

    /// The protected call's error, if the call ran and failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn map_inner<F, U>(self, f: F) -> BreakerError<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            BreakerError::Open { name } => BreakerError::Open { name },
            BreakerError::Timeout { name, timeout } => BreakerError::Timeout { name, timeout },
            BreakerError::NotFound { name } => BreakerError::NotFound { name },
            BreakerError::Inner(e) => BreakerError::Inner(f(e)),
        }
    }
}

/// Rate limiter errors
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// Counter store (Redis) failure; callers usually fail open
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Limit or window rejected at construction time
    #[error("invalid rate limit configuration: {0}")]
    Config(String),

    /// Unparseable duration string
    #[error("invalid duration {input:?}: {reason}")]
    InvalidDuration { input: String, reason: String },
}

impl RateLimitError {
    pub fn config(message: impl Into<String>) -> Self {
        RateLimitError::Config(message.into())
    }

    /// Whether the failure came from the backing store rather than configuration.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, RateLimitError::Redis(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_error_messages() {
        let open: BreakerError<std::io::Error> = BreakerError::Open {
            name: "database".into(),
        };
        assert_eq!(open.to_string(), "circuit breaker 'database' is open");
        assert!(open.is_open());

        let inner: BreakerError<String> = BreakerError::Inner("connection refused".into());
        assert_eq!(inner.to_string(), "connection refused");
        assert_eq!(inner.into_inner().as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_map_inner_keeps_breaker_variants() {
        let timeout: BreakerError<u16> = BreakerError::Timeout {
            name: "redis".into(),
            timeout: Duration::from_secs(3),
        };
        let mapped = timeout.map_inner(|code| code.to_string());
        assert!(mapped.is_timeout());

        let inner: BreakerError<u16> = BreakerError::Inner(502);
        assert_eq!(inner.map_inner(|c| c + 1).into_inner(), Some(503));
    }

    #[test]
    fn test_store_failure_classification() {
        assert!(!RateLimitError::config("limit must be positive").is_store_failure());
    }
}
