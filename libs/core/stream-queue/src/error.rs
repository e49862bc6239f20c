//! Queue error types
//!
//! Errors fall into three groups that the consumer treats differently:
//! - **Store**: the log backend failed (Redis or in-memory); logged, loop backs off
//! - **Handler**: the business handler failed, timed out or panicked; retried until
//!   `max_retries`, then dead-lettered
//! - **Configuration**: unknown stream, invalid config; returned to the caller

use std::time::Duration;
use thiserror::Error;

/// Stream queue errors
#[derive(Error, Debug)]
pub enum StreamError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// In-process store error (mirrors the Redis error text, e.g. `NOGROUP`)
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stream was never registered with the manager
    #[error("stream {0} not registered")]
    UnknownStream(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Handler returned an error
    #[error("{0}")]
    Handler(String),

    /// Handler exceeded its time budget
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    /// Handler panicked
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl StreamError {
    /// Create a handler failure.
    pub fn handler(message: impl Into<String>) -> Self {
        StreamError::Handler(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        StreamError::Config(message.into())
    }

    /// Whether the failure came from running the handler (as opposed to the store).
    pub fn is_handler_failure(&self) -> bool {
        matches!(
            self,
            StreamError::Handler(_) | StreamError::Timeout(_) | StreamError::Panicked(_)
        )
    }

    /// Whether the caller's input was at fault rather than the store.
    ///
    /// These are raised before any backend call is made.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            StreamError::UnknownStream(_) | StreamError::Config(_) | StreamError::Serialization(_)
        )
    }

    /// Whether the backend reported that the consumer group does not exist.
    pub fn is_nogroup(&self) -> bool {
        match self {
            StreamError::Redis(e) => e.to_string().contains("NOGROUP"),
            StreamError::Store(msg) => msg.starts_with("NOGROUP"),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Serialization(err.to_string())
    }
}
