//! Queue Gateway
//!
//! Accepts events over HTTP and publishes them to Redis Streams. API routes
//! sit behind the shared rate limiter and the `gateway` circuit breaker;
//! Redis calls go through the `redis` breaker.

pub mod api;
pub mod config;
pub mod events;
pub mod state;

use axum::Router;
use axum_helpers::{RateLimitState, serve, shutdown_signal};
use config::Config;
use core_config::tracing::init_tracing;
use redis::aio::ConnectionManager;
use resilience::{CircuitBreakerConfig, CircuitBreakerManager, RedisCounterStore};
use state::AppState;
use std::sync::Arc;
use stream_queue::{RedisStreamStore, StreamQueueManager, init_metrics};
use tracing::{info, warn};

/// Breaker wrapped around every `/api/v1` request.
pub const GATEWAY: &str = "gateway";

/// `database` and `redis` presets plus the default-configured `gateway` breaker.
pub fn build_breakers() -> CircuitBreakerManager {
    let breakers = CircuitBreakerManager::with_defaults();
    breakers.register(GATEWAY, CircuitBreakerConfig::default());
    breakers
}

/// Connect to Redis, start the stream consumers and build the router.
///
/// Consumers are running when this returns; stop them with
/// `state.queue.stop()`.
pub async fn build_app(config: Config) -> eyre::Result<(Router, AppState)> {
    let client = redis::Client::open(config.redis.url.as_str())?;
    let redis = ConnectionManager::new(client.clone()).await?;
    info!("Connected to Redis");

    // Consumers open their own blocking-read connections from `client`;
    // `redis` stays free for publishes, rate limiting and readiness checks.
    let queue = Arc::new(StreamQueueManager::new(Arc::new(RedisStreamStore::new(
        client, redis.clone(),
    ))));
    events::register_streams(&queue, &config.queue).await?;
    queue.start_all_consumers()?;

    let limits = RateLimitState::new(
        Arc::new(RedisCounterStore::new(redis.clone())),
        &config.rate_limit,
    )?;

    let state = AppState {
        config: Arc::new(config),
        queue,
        breakers: Arc::new(build_breakers()),
        redis: Some(redis),
    };
    let app = api::router(state.clone(), limits)?;

    Ok((app, state))
}

pub async fn run() -> eyre::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.environment);

    if init_metrics().is_none() {
        warn!("Prometheus recorder unavailable, /metrics will be empty");
    }

    info!(name = config.app.name, version = config.app.version, "Starting gateway");

    let (app, state) = build_app(config).await?;

    let served = serve(app, &state.config.server, shutdown_signal()).await;

    info!("Shutting down: stopping stream consumers");
    state.queue.stop().await;

    served?;
    info!("Gateway shutdown complete");
    Ok(())
}
