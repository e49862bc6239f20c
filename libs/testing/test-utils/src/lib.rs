//! Test helpers shared by the workspace crates
//!
//! - [`unique_name`]: collision-free stream and key names for tests sharing a server
//! - `TestRedis` (feature `redis`, on by default): a Redis container per test
//!
//! Redis-backed tests are marked `#[ignore = "requires Docker"]` and run with
//! `cargo test -- --ignored`:
//!
//! ```rust,ignore
//! let redis = TestRedis::new().await;
//! let store = RedisStreamStore::new(redis.client(), redis.connection_manager().await);
//! let stream = unique_name("orders");
//! ```

use uuid::Uuid;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// `<prefix>_<8 hex chars>`, unique per call.
pub fn unique_name(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &id[..8])
}
