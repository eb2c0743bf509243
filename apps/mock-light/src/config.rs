//! Mock light fleet configuration loaded from environment variables

use std::env;

use anyhow::{bail, Result};
use prysmalight_shared_config::{get_env_or_default, MqttConfig};

/// Effects a mock light advertises unless `MOCK_EFFECTS` says otherwise
const DEFAULT_EFFECTS: &str = "Cylon,Rainbow,Juggle,Confetti,Flicker";

/// Mock light fleet configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Broker settings shared with the API daemon
    pub mqtt: MqttConfig,

    /// Ids of the lights to simulate
    pub lights: Vec<String>,

    /// Effects every simulated light supports
    pub effects: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut mqtt =
            MqttConfig::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
        mqtt.client_id = get_env_or_default("MOCK_CLIENT_ID", "prysmalight-mock-light");

        let lights = split_list(&get_env_or_default("MOCK_LIGHTS", "Light 1"));
        if lights.is_empty() {
            bail!("MOCK_LIGHTS must name at least one light");
        }
        for id in &lights {
            if let Err(reason) = prysmalight_api::topics::validate_light_id(id) {
                bail!("Invalid MOCK_LIGHTS entry: {}", reason);
            }
        }

        let effects = env::var("MOCK_EFFECTS")
            .map(|value| split_list(&value))
            .unwrap_or_else(|_| split_list(DEFAULT_EFFECTS));

        Ok(Self {
            mqtt,
            lights,
            effects,
        })
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
