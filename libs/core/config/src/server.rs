use crate::{ConfigError, FromEnv, env_or_default, env_parse_or};
use std::net::Ipv4Addr;

pub const DEFAULT_PORT: u16 = 8080;

/// Listen address of the HTTP server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    /// `host:port`, as accepted by `TcpListener::bind`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED.to_string(), DEFAULT_PORT)
    }
}

impl FromEnv for ServerConfig {
    /// - HOST: defaults to `0.0.0.0`
    /// - PORT: defaults to 8080
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let host = env_or_default("HOST", &defaults.host);
        if host.trim().is_empty() {
            return Err(ConfigError::ParseError {
                key: "HOST".to_string(),
                details: "must not be empty".to_string(),
            });
        }

        Ok(Self {
            host,
            port: env_parse_or("PORT", defaults.port)?,
        })
    }
}
