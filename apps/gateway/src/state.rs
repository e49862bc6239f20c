//! Shared application state.

use crate::config::Config;
use redis::aio::ConnectionManager;
use resilience::CircuitBreakerManager;
use std::sync::Arc;
use stream_queue::StreamQueueManager;

/// Cloned into every handler; all fields are cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: Arc<StreamQueueManager>,
    pub breakers: Arc<CircuitBreakerManager>,
    /// Pinged by `/ready`; absent when running on the in-memory store
    pub redis: Option<ConnectionManager>,
}
