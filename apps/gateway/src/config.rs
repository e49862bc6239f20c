use axum_helpers::RateLimitConfig;
use core_config::{
    AppInfo, FromEnv, app_info, queue::QueueSettings, redis::RedisConfig, server::ServerConfig,
};

pub use core_config::Environment;

/// Gateway configuration, composed from the shared config components
#[derive(Clone, Debug)]
pub struct Config {
    pub app: AppInfo,
    pub environment: Environment,
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub queue: QueueSettings,
    pub rate_limit: RateLimitConfig,
}

impl Config {
    pub fn from_env() -> eyre::Result<Self> {
        Ok(Self {
            app: app_info!(),
            environment: Environment::from_env(),
            server: ServerConfig::from_env()?, // HOST=0.0.0.0, PORT=8080 by default
            redis: RedisConfig::from_env()?,   // required
            queue: QueueSettings::from_env()?,
            rate_limit: RateLimitConfig::from_env()?,
        })
    }
}
