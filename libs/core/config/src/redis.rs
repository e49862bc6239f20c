use crate::{ConfigError, FromEnv, env_required};

/// Redis connection settings
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl FromEnv for RedisConfig {
    /// Requires REDIS_URL to be set (no default)
    fn from_env() -> Result<Self, ConfigError> {
        let url = env_required("REDIS_URL")?;
        if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
            return Err(ConfigError::ParseError {
                key: "REDIS_URL".to_string(),
                details: format!("expected a redis:// or rediss:// URL, got '{url}'"),
            });
        }

        Ok(Self { url })
    }
}
