//! Throwaway Redis server for integration tests

use redis::Client;
use redis::aio::ConnectionManager;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::{REDIS_PORT, Redis};

const IMAGE_TAG: &str = "8-alpine";

/// A Redis 8 container that lives as long as this value.
///
/// Streams commands and Lua scripting are available, so both the stream
/// queue and the rate limiter stores can be exercised against it.
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    client: Client,
    url: String,
}

impl TestRedis {
    /// Start a container and wait until it accepts connections.
    ///
    /// Panics if Docker is unavailable.
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag(IMAGE_TAG)
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(REDIS_PORT)
            .await
            .expect("Failed to get Redis port");

        let url = format!("redis://127.0.0.1:{port}");
        let client = Client::open(url.as_str()).expect("Failed to create Redis client");

        tracing::info!(port, image = IMAGE_TAG, "Test Redis ready");

        Self {
            _container: container,
            client,
            url,
        }
    }

    /// A reconnecting connection, the same type services receive in production.
    pub async fn connection_manager(&self) -> ConnectionManager {
        ConnectionManager::new(self.client.clone())
            .await
            .expect("Failed to connect to Redis")
    }

    /// Client for the container, for stores that open extra connections
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// `redis://127.0.0.1:<mapped port>`, for code that opens its own client
    pub fn url(&self) -> &str {
        &self.url
    }
}
