//! Shared configuration types for Prysmalight services
//!
//! This crate provides the configuration types used by both the API
//! daemon and the mock light fleet, so that both sides of the bus agree
//! on broker address and topic layout.

mod error;
mod mqtt;
mod redis;

pub use error::{ConfigError, ConfigResult};
pub use mqtt::{MqttConfig, DEFAULT_BASE_TOPIC};
pub use redis::RedisConfig;

use std::env;

use serde::{Deserialize, Serialize};

/// Common configuration shared between all services
#[derive(Debug, Clone)]
pub struct CommonConfig {
    /// MQTT broker configuration
    pub mqtt: MqttConfig,

    /// Redis configuration
    pub redis: RedisConfig,

    /// Environment mode (development, staging, production)
    pub environment: Environment,

    /// Log level (from RUST_LOG or LOG_LEVEL)
    pub log_level: String,
}

/// Application environment mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl std::str::FromStr for Environment {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "staging" | "stage" => Self::Staging,
            _ => Self::Development,
        })
    }
}

impl Environment {
    /// Check if this is a production environment
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    /// Check if this is a development environment
    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Staging => write!(f, "staging"),
            Self::Production => write!(f, "production"),
        }
    }
}

impl CommonConfig {
    /// Load common configuration from environment variables
    ///
    /// Production deployments must authenticate against the broker.
    pub fn from_env() -> ConfigResult<Self> {
        let environment: Environment = env::var("ENVIRONMENT")
            .unwrap_or_else(|_| "development".to_string())
            .parse()
            .unwrap_or_default();

        let mqtt = MqttConfig::from_env()?;
        if environment.is_production() && !mqtt.has_credentials() {
            return Err(ConfigError::MissingEnvVar(
                "MQTT_USERNAME/MQTT_PASSWORD".to_string(),
            ));
        }

        Ok(Self {
            mqtt,
            redis: RedisConfig::from_env()?,
            environment,
            log_level: env::var("RUST_LOG")
                .or_else(|_| env::var("LOG_LEVEL"))
                .unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Load a `.env` file if present; missing files are not an error
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Helper function to get a required environment variable
pub fn get_required_env(name: &str) -> ConfigResult<String> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

/// Helper function to get an optional environment variable with a default
pub fn get_env_or_default(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Helper function to parse an environment variable into a specific type
pub fn parse_env<T>(name: &str, default: T) -> ConfigResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}
