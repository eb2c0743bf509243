//! Device Service
//!
//! The façade resolvers consume. Queries read the canonical store,
//! mutations round-trip to the light and only report what the light
//! acknowledged, and subscriptions hand out bridge streams.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use crate::broker::{Broker, ConnectionState};
use crate::error::{DeviceError, DeviceResult};
use crate::models::{message, Light, LightPatch};
use crate::repositories::LightRepository;
use crate::rpc::{DisconnectPolicy, RpcClient};
use crate::services::discovery::DiscoveryService;
use crate::subscriptions::{LightStream, StreamKind, SubscriptionBridge};
use crate::topics::{validate_light_id, Topics};

/// Tunables for the light service
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Topic prefix shared with the lights
    pub base_topic: String,
    /// Default per-call timeout
    pub request_timeout: Duration,
    /// What in-flight calls do when the broker drops
    pub disconnect_policy: DisconnectPolicy,
    /// How long a discovery round listens for announcements
    pub discovery_window: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            base_topic: prysmalight_shared_config::DEFAULT_BASE_TOPIC.to_string(),
            request_timeout: Duration::from_millis(5000),
            disconnect_policy: DisconnectPolicy::FailFast,
            discovery_window: Duration::from_millis(2000),
        }
    }
}

#[derive(Clone)]
pub struct LightService {
    broker: Broker,
    topics: Topics,
    bridge: SubscriptionBridge,
    rpc: RpcClient,
    discovery: DiscoveryService,
    request_timeout: Duration,
}

impl LightService {
    /// Wire the service on top of a broker and a store.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(broker: Broker, store: LightRepository, settings: ServiceSettings) -> Self {
        let topics = Topics::new(settings.base_topic);
        Self {
            bridge: SubscriptionBridge::new(broker.clone(), store, topics.clone()),
            rpc: RpcClient::new(broker.clone(), settings.disconnect_policy),
            discovery: DiscoveryService::new(
                broker.clone(),
                topics.clone(),
                settings.discovery_window,
            ),
            broker,
            topics,
            request_timeout: settings.request_timeout,
        }
    }

    /// Start tracking every light already in the store.
    ///
    /// Returns how many lights are tracked.
    pub async fn start(&self) -> DeviceResult<usize> {
        let ids = self.bridge.store().ids().await?;
        for id in &ids {
            self.bridge.track(id).await?;
        }
        tracing::info!(count = ids.len(), "Tracking stored lights");
        Ok(ids.len())
    }

    /// Ask the light for its current state and return it after merging.
    pub async fn get_light(&self, id: &str) -> DeviceResult<Light> {
        async {
            self.ensure_registered(id).await?;
            self.round_trip(id, &self.topics.get(id), message::get_command(id))
                .await
        }
        .await
        .inspect_err(DeviceError::log)
    }

    /// Every registered light from the store, without a round trip
    pub async fn get_lights(&self) -> DeviceResult<Vec<Light>> {
        self.bridge
            .store()
            .get_all()
            .await
            .inspect_err(DeviceError::log)
    }

    /// Send a change to the light and return the state it acknowledged
    pub async fn set_light(&self, id: &str, patch: LightPatch) -> DeviceResult<Light> {
        async {
            let current = self
                .bridge
                .store()
                .get(id)
                .await?
                .ok_or_else(|| DeviceError::unknown(id))?;
            check_settable(&current, &patch)?;

            self.round_trip(id, &self.topics.command(id), message::set_command(id, &patch)?)
                .await
        }
        .await
        .inspect_err(DeviceError::log)
    }

    /// Register a light and start tracking it
    pub async fn add_light(&self, id: &str) -> DeviceResult<Light> {
        async {
            validate_light_id(id).map_err(DeviceError::InvalidInput)?;
            self.bridge.register_light(id).await
        }
        .await
        .inspect_err(DeviceError::log)
    }

    /// Deregister a light; returns its last known state
    pub async fn remove_light(&self, id: &str) -> DeviceResult<Light> {
        self.bridge
            .deregister_light(id)
            .await
            .inspect_err(DeviceError::log)
    }

    /// Changes of one registered light
    pub async fn subscribe_to_light(&self, id: &str) -> DeviceResult<LightStream> {
        async {
            self.ensure_registered(id).await?;
            self.bridge
                .open_stream(StreamKind::Light(id.to_string()))
                .await
        }
        .await
        .inspect_err(DeviceError::log)
    }

    /// Changes of every light
    pub async fn subscribe_to_all_lights(&self) -> DeviceResult<LightStream> {
        self.bridge
            .open_stream(StreamKind::AllLights)
            .await
            .inspect_err(DeviceError::log)
    }

    /// Lights as they are registered
    pub async fn subscribe_to_lights_added(&self) -> DeviceResult<LightStream> {
        self.bridge.open_stream(StreamKind::Added).await
    }

    /// Lights as they are removed
    pub async fn subscribe_to_lights_removed(&self) -> DeviceResult<LightStream> {
        self.bridge.open_stream(StreamKind::Removed).await
    }

    /// Run a discovery round and return announcing lights that are not
    /// registered yet
    pub async fn get_discovered_lights(&self) -> DeviceResult<Vec<String>> {
        async {
            let registered = self.bridge.store().ids().await?;
            let discovered = self.discovery.discover().await?;
            Ok::<_, DeviceError>(
                discovered
                    .into_iter()
                    .filter(|id| validate_light_id(id).is_ok())
                    .filter(|id| !registered.contains(id))
                    .collect(),
            )
        }
        .await
        .inspect_err(DeviceError::log)
    }

    /// Current broker connection state
    pub fn broker_status(&self) -> ConnectionState {
        self.broker.state()
    }

    /// Watch broker connection state changes
    pub fn watch_broker_status(&self) -> watch::Receiver<ConnectionState> {
        self.broker.watch_state()
    }

    /// Close the broker connection and end every open stream
    pub async fn shutdown(&self) {
        self.broker.close().await;
        self.bridge.close_streams();
    }

    pub fn bridge(&self) -> &SubscriptionBridge {
        &self.bridge
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    async fn ensure_registered(&self, id: &str) -> DeviceResult<()> {
        if self.bridge.store().contains(id).await? {
            Ok(())
        } else {
            Err(DeviceError::unknown(id))
        }
    }

    /// Call the light and return its state once the reply is merged.
    ///
    /// The reply goes through the bridge's ingest task so it cannot
    /// overtake or be overtaken by the light's own events.
    async fn round_trip(&self, id: &str, topic: &str, payload: Value) -> DeviceResult<Light> {
        self.rpc
            .call_routed(
                topic,
                &self.topics.reply_prefix(id),
                payload,
                self.request_timeout,
                |reply_topic| self.bridge.expect_reply(id, reply_topic),
            )
            .await
    }
}

/// Reject changes a client may not request
fn check_settable(light: &Light, patch: &LightPatch) -> DeviceResult<()> {
    if patch.is_empty() {
        return Err(DeviceError::InvalidInput("no fields to set".to_string()));
    }
    if patch.connected.is_some() {
        return Err(DeviceError::InvalidInput(
            "connected is reported by the light".to_string(),
        ));
    }
    if patch.supported_effects.is_some() {
        return Err(DeviceError::InvalidInput(
            "supported effects are reported by the light".to_string(),
        ));
    }
    patch
        .validate()
        .map_err(|e| DeviceError::InvalidInput(e.to_string()))?;
    if let Some(effect) = &patch.effect {
        if !light.supports_effect(effect) {
            return Err(DeviceError::InvalidInput(format!(
                "light '{}' does not support effect '{}'",
                light.id, effect
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionStatus, PowerState};
    use assert_matches::assert_matches;

    fn service() -> LightService {
        LightService::new(
            Broker::in_memory(),
            LightRepository::new_in_memory(),
            ServiceSettings {
                request_timeout: Duration::from_millis(50),
                ..ServiceSettings::default()
            },
        )
    }

    #[test]
    fn test_check_settable() {
        let mut light = Light::new("L1");
        light.merge(&LightPatch::effects(vec!["Rainbow".to_string()]));

        assert!(check_settable(&light, &LightPatch::power(PowerState::On)).is_ok());
        assert_matches!(
            check_settable(&light, &LightPatch::default()),
            Err(DeviceError::InvalidInput(_))
        );
        assert_matches!(
            check_settable(&light, &LightPatch::connection(ConnectionStatus::Online)),
            Err(DeviceError::InvalidInput(_))
        );
        let strobe = LightPatch {
            effect: Some("Strobe".to_string()),
            ..LightPatch::default()
        };
        assert_matches!(
            check_settable(&light, &strobe),
            Err(DeviceError::InvalidInput(_))
        );
    }

    #[tokio::test]
    async fn test_unknown_light_operations() {
        let service = service();

        assert_matches!(
            service.set_light("L1", LightPatch::power(PowerState::On)).await,
            Err(DeviceError::UnknownDevice(_))
        );
        assert_matches!(service.get_light("L1").await, Err(DeviceError::UnknownDevice(_)));
        assert_matches!(service.remove_light("L1").await, Err(DeviceError::UnknownDevice(_)));
        assert_matches!(
            service.subscribe_to_light("L1").await,
            Err(DeviceError::UnknownDevice(_))
        );
    }

    #[tokio::test]
    async fn test_add_light_validates_id() {
        let service = service();
        assert_matches!(
            service.add_light("a/b").await,
            Err(DeviceError::InvalidInput(_))
        );
        assert_matches!(service.add_light("").await, Err(DeviceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_start_tracks_stored_lights() {
        let broker = Broker::in_memory();
        let store = LightRepository::new_in_memory();
        store.insert_default("L1").await.unwrap();
        store.insert_default("L2").await.unwrap();
        let service = LightService::new(broker.clone(), store, ServiceSettings::default());

        assert_eq!(service.start().await.unwrap(), 2);
        assert_eq!(broker.subscription_count("prysmalight/L1/+"), 1);
        assert_eq!(broker.subscription_count("prysmalight/L2/+"), 1);

        // Tracking twice keeps a single reference
        service.start().await.unwrap();
        assert_eq!(service.bridge().pattern_holders("prysmalight/L1/+"), 1);
    }

    #[tokio::test]
    async fn test_broker_status() {
        let service = service();
        assert_eq!(service.broker_status(), ConnectionState::Connected);

        service.shutdown().await;
        assert_eq!(service.broker_status(), ConnectionState::Closed);
    }
}
