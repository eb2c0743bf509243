//! Simulated light
//!
//! A device that speaks the light protocol over a `Broker`. It announces
//! itself, answers `SET`, `GET` and discovery requests, and can be told to
//! go silent so callers hit their timeouts. Used by the mock-light binary
//! and by tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::broker::{Broker, BrokerError, BrokerResult, BusMessage, SubscriptionGuard};
use crate::models::{message, ConnectionStatus, Light, LightPatch};
use crate::topics::{TopicKind, Topics};

/// An inbound `SET` or `GET` body
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Command {
    #[serde(default)]
    reply_to: Option<String>,
    #[serde(flatten)]
    patch: LightPatch,
}

struct Device {
    broker: Broker,
    topics: Topics,
    light: Mutex<Light>,
    responding: AtomicBool,
}

impl Device {
    fn snapshot(&self) -> Light {
        self.light
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn publish(&self, topic: &str, body: Value) -> BrokerResult<()> {
        let bytes = serde_json::to_vec(&body).map_err(|e| BrokerError::Publish {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        self.broker.publish(topic, bytes).await
    }

    async fn report(&self, topic: &str, patch: &LightPatch) -> BrokerResult<()> {
        let id = self.snapshot().id;
        let body = message::state_report(&id, patch).map_err(|e| BrokerError::Publish {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        self.publish(topic, body).await
    }

    async fn handle(&self, msg: BusMessage) -> BrokerResult<()> {
        let id = self.snapshot().id;
        if msg.topic == self.topics.discovery() {
            return self
                .publish(&self.topics.hello(), serde_json::json!({ "id": id }))
                .await;
        }
        if !self.responding.load(Ordering::Relaxed) {
            tracing::debug!(light = %id, topic = %msg.topic, "Ignoring request while silent");
            return Ok(());
        }

        let command: Command = match serde_json::from_slice(&msg.payload) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(light = %id, error = %e, "Ignoring malformed command");
                return Ok(());
            }
        };
        let Some(reply_to) = command.reply_to else {
            tracing::warn!(light = %id, "Command without a reply topic");
            return Ok(());
        };

        match self.topics.classify(&msg.topic) {
            Some((_, TopicKind::Command)) => self.apply_command(&id, &reply_to, command.patch).await,
            Some((_, TopicKind::Get)) => {
                let full = LightPatch::from(&self.snapshot());
                self.report(&reply_to, &full).await
            }
            _ => Ok(()),
        }
    }

    async fn apply_command(&self, id: &str, reply_to: &str, mut patch: LightPatch) -> BrokerResult<()> {
        patch.connected = None;
        patch.supported_effects = None;

        let refusal = match patch.validate() {
            Err(e) => Some(e.to_string()),
            Ok(()) => patch
                .effect
                .as_deref()
                .filter(|effect| !self.snapshot().supports_effect(effect))
                .map(|effect| format!("unsupported effect '{}'", effect)),
        };
        if let Some(reason) = refusal {
            tracing::debug!(light = %id, %reason, "Refusing command");
            return self.publish(reply_to, message::rejection(id, &reason)).await;
        }

        let full = {
            let mut light = self.light.lock().unwrap_or_else(PoisonError::into_inner);
            light.merge(&patch);
            LightPatch::from(&*light)
        };
        self.report(reply_to, &full).await?;
        self.report(&self.topics.state(id), &full).await
    }
}

/// A running simulated light
pub struct SimulatedLight {
    device: Arc<Device>,
    task: JoinHandle<()>,
}

impl SimulatedLight {
    /// Subscribe to the light's request topics and announce it online
    pub async fn spawn(
        broker: Broker,
        topics: Topics,
        id: &str,
        effects: Vec<String>,
    ) -> BrokerResult<Self> {
        let mut light = Light::new(id);
        light.connected = ConnectionStatus::Online;
        light.supported_effects = effects.clone();

        let device = Arc::new(Device {
            broker: broker.clone(),
            topics: topics.clone(),
            light: Mutex::new(light),
            responding: AtomicBool::new(true),
        });

        let (sink, mut requests) = mpsc::unbounded_channel();
        let subscriptions = vec![
            SubscriptionGuard::subscribe(&broker, &topics.command(id), sink.clone()).await?,
            SubscriptionGuard::subscribe(&broker, &topics.get(id), sink.clone()).await?,
            SubscriptionGuard::subscribe(&broker, &topics.discovery(), sink).await?,
        ];

        device
            .publish(
                &topics.connected(id),
                message::connection_event(id, ConnectionStatus::Online),
            )
            .await?;
        if !effects.is_empty() {
            device
                .publish(&topics.effects(id), message::effects_event(id, &effects))
                .await?;
        }

        let worker = device.clone();
        let task = tokio::spawn(async move {
            let _subscriptions = subscriptions;
            while let Some(msg) = requests.recv().await {
                if let Err(e) = worker.handle(msg).await {
                    tracing::warn!(error = %e, "Simulated light could not answer");
                }
            }
        });

        tracing::info!(light = %id, "Simulated light online");
        Ok(Self { device, task })
    }

    pub fn id(&self) -> String {
        self.device.snapshot().id
    }

    /// Current device-side state
    pub fn state(&self) -> Light {
        self.device.snapshot()
    }

    /// Stop answering `SET` and `GET` requests, or resume
    pub fn respond(&self, responding: bool) {
        self.device.responding.store(responding, Ordering::Relaxed);
    }

    /// Change state on the device side, as a physical switch would
    pub async fn publish_state(&self, patch: LightPatch) -> BrokerResult<()> {
        let (id, changes) = {
            let mut light = self.device.light.lock().unwrap_or_else(PoisonError::into_inner);
            let changes = light.merge(&patch);
            (light.id.clone(), changes)
        };
        if changes.is_empty() {
            return Ok(());
        }
        self.device.report(&self.device.topics.state(&id), &changes).await
    }

    /// Announce the light offline and stop answering
    /// Announce the light offline and stop answering.
    ///
    /// The light stops either way; the result says whether the offline
    /// announcement went out.
    pub async fn stop(mut self) -> BrokerResult<()> {
        let id = self.id();
        let announced = self
            .device
            .publish(
                &self.device.topics.connected(&id),
                message::connection_event(&id, ConnectionStatus::Offline),
            )
            .await;
        self.task.abort();
        let _ = (&mut self.task).await;
        tracing::info!(light = %id, "Simulated light stopped");
        announced
    }
}

impl Drop for SimulatedLight {
    fn drop(&mut self) {
        self.task.abort();
    }
}
