//! API daemon configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use prysmalight_shared_config::{CommonConfig, MqttConfig, RedisConfig};

use crate::rpc::DisconnectPolicy;
use crate::services::ServiceSettings;

/// Longest accepted call timeout or discovery window (one hour)
const MAX_WINDOW_MS: u64 = 60 * 60 * 1000;

/// Which bus the daemon talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerBackend {
    /// A real MQTT server
    Mqtt,
    /// In-process loopback, for local development without a server
    Memory,
}

impl FromStr for BrokerBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mqtt" => Ok(Self::Mqtt),
            "memory" | "in-memory" => Ok(Self::Memory),
            other => bail!("unknown broker backend '{}'", other),
        }
    }
}

/// Where canonical light state lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    /// Redis, falling back to memory when unreachable
    Redis,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" | "in-memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => bail!("unknown store backend '{}'", other),
        }
    }
}

/// API daemon configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Common configuration shared with the mock light fleet
    pub common: CommonConfig,

    /// Bus backend (default: mqtt)
    pub broker_backend: BrokerBackend,

    /// Store backend (default: memory)
    pub store_backend: StoreBackend,

    /// Per-call timeout in milliseconds (default: 5000)
    pub request_timeout_ms: u64,

    /// In-flight call behavior on disconnect (default: fail-fast)
    pub disconnect_policy: DisconnectPolicy,

    /// Discovery listening window in milliseconds (default: 2000)
    pub discovery_window_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let common = CommonConfig::from_env()
            .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

        let request_timeout_ms: u64 = env::var("REQUEST_TIMEOUT_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .context("Invalid REQUEST_TIMEOUT_MS value")?;
        if request_timeout_ms == 0 {
            bail!("REQUEST_TIMEOUT_MS must be greater than zero");
        }
        if request_timeout_ms > MAX_WINDOW_MS {
            bail!("REQUEST_TIMEOUT_MS must be at most {} (one hour)", MAX_WINDOW_MS);
        }

        let discovery_window_ms: u64 = env::var("DISCOVERY_WINDOW_MS")
            .unwrap_or_else(|_| "2000".to_string())
            .parse()
            .context("Invalid DISCOVERY_WINDOW_MS value")?;
        if discovery_window_ms > MAX_WINDOW_MS {
            bail!("DISCOVERY_WINDOW_MS must be at most {} (one hour)", MAX_WINDOW_MS);
        }

        Ok(Self {
            common,

            broker_backend: env::var("BROKER_BACKEND")
                .unwrap_or_else(|_| "mqtt".to_string())
                .parse()
                .context("Invalid BROKER_BACKEND value")?,

            store_backend: env::var("STORE_BACKEND")
                .unwrap_or_else(|_| "memory".to_string())
                .parse()
                .context("Invalid STORE_BACKEND value")?,

            request_timeout_ms,

            disconnect_policy: env::var("DISCONNECT_POLICY")
                .unwrap_or_else(|_| "fail-fast".to_string())
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("Invalid DISCONNECT_POLICY value")?,

            discovery_window_ms,
        })
    }

    /// Settings for the light service
    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            base_topic: self.common.mqtt.base_topic.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            disconnect_policy: self.disconnect_policy,
            discovery_window: Duration::from_millis(self.discovery_window_ms),
        }
    }

    pub fn mqtt(&self) -> &MqttConfig {
        &self.common.mqtt
    }

    pub fn redis(&self) -> &RedisConfig {
        &self.common.redis
    }

    pub fn is_production(&self) -> bool {
        self.common.environment.is_production()
    }
}
