//! Settings for the Redis-backed light store

use std::time::Duration;

use crate::{get_env_or_default, parse_env, ConfigError, ConfigResult};

/// Where and how the API daemon persists light state
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Optional password for Redis authentication
    pub password: Option<String>,

    /// How long to wait for the initial connection before falling back to
    /// the in-memory store, in seconds
    pub connect_timeout_secs: u64,

    /// Upper bound on a single store operation, in milliseconds
    pub command_timeout_ms: u64,

    /// Prepended to every key the store writes, so several fleets can share
    /// one server. Empty by default, which keeps the `light:{id}` and
    /// `lightKeys` layout.
    pub key_prefix: String,
}

impl RedisConfig {
    /// Load store settings from environment variables
    pub fn from_env() -> ConfigResult<Self> {
        let command_timeout_ms = parse_env("REDIS_COMMAND_TIMEOUT_MS", 1000)?;
        if command_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "REDIS_COMMAND_TIMEOUT_MS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let key_prefix = get_env_or_default("REDIS_KEY_PREFIX", "");
        if key_prefix.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidValue(
                "REDIS_KEY_PREFIX".to_string(),
                "must not contain whitespace".to_string(),
            ));
        }

        Ok(Self {
            url: get_env_or_default("REDIS_URL", "redis://localhost:6379"),
            password: std::env::var("REDIS_PASSWORD").ok().filter(|s| !s.is_empty()),
            connect_timeout_secs: parse_env("REDIS_CONNECT_TIMEOUT", 5)?,
            command_timeout_ms,
            key_prefix,
        })
    }

    /// Store settings for a server at `url`, everything else default
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            password: None,
            connect_timeout_secs: 5,
            command_timeout_ms: 1000,
            key_prefix: String::new(),
        }
    }

    /// Connection URL with the password spliced in, if one is set
    pub fn connection_url(&self) -> String {
        if let Some(ref password) = self.password {
            if let Some(at_pos) = self.url.find("://") {
                let (scheme, rest) = self.url.split_at(at_pos + 3);
                return format!("{}:{}@{}", scheme, password, rest);
            }
        }
        self.url.clone()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Full key for `name` under the configured prefix
    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::with_url("redis://localhost:6379")
    }
}
