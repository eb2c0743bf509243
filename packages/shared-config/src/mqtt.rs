//! MQTT broker configuration types

use std::time::Duration;

use crate::{get_env_or_default, parse_env, ConfigError, ConfigResult};

/// Default topic prefix every light publishes under
pub const DEFAULT_BASE_TOPIC: &str = "prysmalight";

/// MQTT broker connection settings
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker hostname
    pub host: String,

    /// Broker port
    pub port: u16,

    /// Client identifier presented to the broker
    pub client_id: String,

    /// Optional username for broker authentication
    pub username: Option<String>,

    /// Optional password for broker authentication
    pub password: Option<String>,

    /// Topic prefix shared by all lights
    pub base_topic: String,

    /// Fixed delay between connection attempts, in seconds
    pub reconnect_delay_secs: u64,

    /// Keep-alive interval in seconds
    pub keep_alive_secs: u64,
}

impl MqttConfig {
    /// Load MQTT configuration from environment variables
    ///
    /// Credentials must be supplied together: a username without a password
    /// (or the reverse) is rejected.
    pub fn from_env() -> ConfigResult<Self> {
        let username = std::env::var("MQTT_USERNAME").ok().filter(|s| !s.is_empty());
        let password = std::env::var("MQTT_PASSWORD").ok().filter(|s| !s.is_empty());

        if username.is_some() != password.is_some() {
            return Err(ConfigError::Conflict(
                "MQTT_USERNAME and MQTT_PASSWORD must be set together".to_string(),
            ));
        }

        let base_topic = get_env_or_default("MQTT_BASE_TOPIC", DEFAULT_BASE_TOPIC);
        if base_topic.is_empty() || base_topic.contains(['+', '#']) {
            return Err(ConfigError::InvalidValue(
                "MQTT_BASE_TOPIC".to_string(),
                "must be non-empty and free of wildcards".to_string(),
            ));
        }

        Ok(Self {
            host: get_env_or_default("MQTT_HOST", "localhost"),
            port: parse_env("MQTT_PORT", 1883)?,
            client_id: get_env_or_default("MQTT_CLIENT_ID", "prysmalight-api"),
            username,
            password,
            base_topic: base_topic.trim_end_matches('/').to_string(),
            reconnect_delay_secs: parse_env("MQTT_RECONNECT_DELAY", 5)?,
            keep_alive_secs: parse_env("MQTT_KEEP_ALIVE", 30)?,
        })
    }

    /// Create a configuration pointing at a specific host (useful for testing)
    pub fn with_host(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Delay between two connection attempts
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Keep-alive interval
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Whether broker credentials are configured
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Broker address for log output (never includes credentials)
    pub fn address(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "prysmalight-api".to_string(),
            username: None,
            password: None,
            base_topic: DEFAULT_BASE_TOPIC.to_string(),
            reconnect_delay_secs: 5,
            keep_alive_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MQTT_VARS: [&str; 8] = [
        "MQTT_HOST",
        "MQTT_PORT",
        "MQTT_CLIENT_ID",
        "MQTT_USERNAME",
        "MQTT_PASSWORD",
        "MQTT_BASE_TOPIC",
        "MQTT_RECONNECT_DELAY",
        "MQTT_KEEP_ALIVE",
    ];

    fn unset_all() -> Vec<(&'static str, Option<&'static str>)> {
        MQTT_VARS.iter().map(|k| (*k, None)).collect()
    }

    #[test]
    fn test_default_config() {
        let config = MqttConfig::default();
        assert_eq!(config.address(), "tcp://localhost:1883");
        assert_eq!(config.base_topic, "prysmalight");
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert!(!config.has_credentials());
    }

    #[test]
    fn test_from_env_uses_defaults() {
        temp_env::with_vars(unset_all(), || {
            let config = MqttConfig::from_env().unwrap();
            assert_eq!(config.host, "localhost");
            assert_eq!(config.port, 1883);
            assert_eq!(config.reconnect_delay_secs, 5);
        });
    }

    #[test]
    fn test_from_env_reads_overrides() {
        let mut vars = unset_all();
        vars.extend([
            ("MQTT_HOST", Some("raspberrypi.local")),
            ("MQTT_PORT", Some("1884")),
            ("MQTT_BASE_TOPIC", Some("lightapp2/")),
            ("MQTT_RECONNECT_DELAY", Some("1")),
        ]);
        temp_env::with_vars(vars, || {
            let config = MqttConfig::from_env().unwrap();
            assert_eq!(config.address(), "tcp://raspberrypi.local:1884");
            assert_eq!(config.base_topic, "lightapp2");
            assert_eq!(config.reconnect_delay(), Duration::from_secs(1));
        });
    }

    #[test]
    fn test_credentials_must_be_paired() {
        let mut vars = unset_all();
        vars.push(("MQTT_USERNAME", Some("pi")));
        temp_env::with_vars(vars, || {
            let err = MqttConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("must be set together"));
        });
    }

    #[test]
    fn test_wildcard_base_topic_rejected() {
        let mut vars = unset_all();
        vars.push(("MQTT_BASE_TOPIC", Some("lights/#")));
        temp_env::with_vars(vars, || {
            assert!(MqttConfig::from_env().is_err());
        });
    }

    #[test]
    fn test_invalid_port_rejected() {
        let mut vars = unset_all();
        vars.push(("MQTT_PORT", Some("not-a-port")));
        temp_env::with_vars(vars, || {
            let err = MqttConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("MQTT_PORT"));
        });
    }
}
