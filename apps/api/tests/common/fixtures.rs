//! Test fixtures for API integration tests
//!
//! Provides a light service wired to an in-memory broker and store, plus
//! simulated lights registered against it.

#![allow(dead_code)]

use std::time::Duration;

use prysmalight_api::broker::MemoryTransport;
use prysmalight_api::models::ConnectionStatus;
use prysmalight_api::{
    Broker, DisconnectPolicy, LightRepository, LightService, ServiceSettings, SimulatedLight,
    Topics,
};

use super::helpers::wait_until;

/// Effects every simulated light supports unless told otherwise
pub fn default_effects() -> Vec<String> {
    vec!["Rainbow".to_string(), "Cylon".to_string()]
}

/// Service settings with short timeouts
pub fn test_settings(timeout: Duration, policy: DisconnectPolicy) -> ServiceSettings {
    ServiceSettings {
        request_timeout: timeout,
        disconnect_policy: policy,
        discovery_window: Duration::from_millis(100),
        ..ServiceSettings::default()
    }
}

/// A service, its broker and its store
pub struct TestBed {
    pub broker: Broker,
    pub store: LightRepository,
    pub service: LightService,
}

impl TestBed {
    pub fn new() -> Self {
        Self::with_settings(test_settings(
            Duration::from_millis(500),
            DisconnectPolicy::FailFast,
        ))
    }

    pub fn with_settings(settings: ServiceSettings) -> Self {
        let broker = Broker::in_memory();
        let store = LightRepository::new_in_memory();
        let service = LightService::new(broker.clone(), store.clone(), settings);
        Self {
            broker,
            store,
            service,
        }
    }

    pub fn topics(&self) -> Topics {
        self.service.topics().clone()
    }

    pub fn controls(&self) -> &MemoryTransport {
        self.broker
            .in_memory_controls()
            .expect("test bed runs on the loopback broker")
    }

    /// Spawn a simulated light that is not registered
    pub async fn spawn_light(&self, id: &str) -> SimulatedLight {
        SimulatedLight::spawn(self.broker.clone(), self.topics(), id, default_effects())
            .await
            .expect("simulated light should start")
    }

    /// Register `id`, spawn its simulated light and wait until the store
    /// has seen it come online with its effect list
    pub async fn register_light(&self, id: &str) -> SimulatedLight {
        self.service.add_light(id).await.expect("light should register");
        let light = self.spawn_light(id).await;

        let store = self.store.clone();
        let id = id.to_string();
        wait_until(|| {
            let store = store.clone();
            let id = id.clone();
            async move {
                store.get(&id).await.ok().flatten().is_some_and(|light| {
                    light.connected == ConnectionStatus::Online
                        && !light.supported_effects.is_empty()
                })
            }
        })
        .await;
        light
    }
}

impl Default for TestBed {
    fn default() -> Self {
        Self::new()
    }
}
