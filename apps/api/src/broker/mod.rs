//! Broker Connection Manager
//!
//! One process-wide connection to the message bus, shared by cloning a
//! [`Broker`]. Two backends sit behind the same handle:
//!
//! - `Mqtt`: a rumqttc client whose event loop is driven by a background
//!   task that reconnects forever with a fixed delay
//! - `InMemory`: a loopback bus for tests and single-process development,
//!   with fault injection
//!
//! Callers register `(filter, sink)` pairs; the broker only subscribes on
//! the bus for the first registration of a filter and unsubscribes after
//! the last one is removed.

mod memory;
mod mqtt;
mod table;

pub use memory::MemoryTransport;
pub use table::{topic_matches, BusMessage, MessageSink, SubscriptionId};

use std::sync::{Arc, Weak};

use bytes::Bytes;
use prysmalight_shared_config::MqttConfig;
use tokio::sync::watch;

use mqtt::MqttTransport;
use table::SubscriptionTable;

/// Broker-level errors
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker is disconnected")]
    Disconnected,

    #[error("broker connection is closed")]
    Closed,

    #[error("subscribe to '{filter}' failed: {reason}")]
    Subscribe { filter: String, reason: String },

    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("invalid topic '{0}'")]
    InvalidTopic(String),

    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Lifecycle of the bus connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Closing or closed; no further traffic is accepted
    pub fn is_shut_down(&self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

pub(crate) type StateSender = Arc<watch::Sender<ConnectionState>>;

/// Move to `next` unless the connection is already shutting down.
///
/// Returns whether the state changed.
pub(crate) fn set_state(state: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    state.send_if_modified(|current| {
        let allowed = !current.is_shut_down() || next == ConnectionState::Closed;
        if allowed && *current != next {
            *current = next;
            true
        } else {
            false
        }
    })
}

/// Handle to the bus connection
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerShared>,
}

struct BrokerShared {
    table: SubscriptionTable,
    state: StateSender,
    transport: Transport,
}

enum Transport {
    /// MQTT client driven by a background event loop
    Mqtt(MqttTransport),
    /// Loopback bus
    InMemory(MemoryTransport),
}

impl Broker {
    /// Connect to an MQTT broker.
    ///
    /// Never fails: attempts are retried forever with the configured fixed
    /// delay. Once connected, an interrupt (Ctrl-C) closes the connection.
    pub async fn connect(config: &MqttConfig) -> Self {
        let broker = Self::connect_detached(config).await;
        broker.close_on_interrupt();
        broker
    }

    /// Connect like [`connect`](Self::connect), but leave interrupts to the
    /// caller, which must call [`close`](Self::close) itself.
    pub async fn connect_detached(config: &MqttConfig) -> Self {
        let table = SubscriptionTable::default();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let state = Arc::new(state);

        let transport = MqttTransport::connect(config, table.clone(), state.clone()).await;

        Self {
            inner: Arc::new(BrokerShared {
                table,
                state,
                transport: Transport::Mqtt(transport),
            }),
        }
    }

    /// Create a connected loopback broker
    pub fn in_memory() -> Self {
        let table = SubscriptionTable::default();
        let (state, _) = watch::channel(ConnectionState::Connected);
        let state = Arc::new(state);
        let transport = MemoryTransport::new(table.clone(), state.clone());

        Self {
            inner: Arc::new(BrokerShared {
                table,
                state,
                transport: Transport::InMemory(transport),
            }),
        }
    }

    /// Fault injection controls, for the in-memory backend only
    pub fn in_memory_controls(&self) -> Option<&MemoryTransport> {
        match &self.inner.transport {
            Transport::InMemory(memory) => Some(memory),
            Transport::Mqtt(_) => None,
        }
    }

    /// Check if this broker talks to a real MQTT server
    pub fn is_mqtt(&self) -> bool {
        matches!(self.inner.transport, Transport::Mqtt(_))
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Register `sink` for every message matching `filter`.
    ///
    /// The bus-level subscribe is only issued for the first registration of
    /// a filter. If it fails, or this future is dropped before it completes,
    /// the registration is removed again.
    pub async fn subscribe(&self, filter: &str, sink: MessageSink) -> BrokerResult<SubscriptionId> {
        table::validate_filter(filter)?;
        if self.state().is_shut_down() {
            return Err(BrokerError::Closed);
        }

        let (id, first) = self.inner.table.insert(filter, sink);
        let mut guard = SubscriptionGuard::new(self, id);

        if first {
            match &self.inner.transport {
                Transport::Mqtt(mqtt) => mqtt.subscribe(filter).await?,
                Transport::InMemory(memory) => memory.subscribe(filter)?,
            }
        }

        tracing::debug!(%id, filter, first, "Subscribed");
        guard.disarm();
        Ok(id)
    }

    /// Remove a registration.
    ///
    /// Idempotent: unknown or already removed ids are a no-op. Returns
    /// whether the id was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some((filter, last)) = self.inner.table.remove(id) else {
            return false;
        };

        if last && !self.state().is_shut_down() {
            match &self.inner.transport {
                Transport::Mqtt(mqtt) => mqtt.unsubscribe(&filter),
                Transport::InMemory(memory) => memory.unsubscribe(&filter),
            }
        }

        tracing::debug!(%id, filter = %filter, last, "Unsubscribed");
        true
    }

    /// Publish a message
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> BrokerResult<()> {
        table::validate_topic(topic)?;
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Closing | ConnectionState::Closed => return Err(BrokerError::Closed),
            _ => return Err(BrokerError::Disconnected),
        }

        let payload = payload.into();
        match &self.inner.transport {
            Transport::Mqtt(mqtt) => mqtt.publish(topic, payload).await,
            Transport::InMemory(memory) => memory.publish(topic, payload),
        }
    }

    /// Close the connection.
    ///
    /// Every registration is dropped, which ends the streams reading from
    /// their sinks. Calling it again is a no-op.
    pub async fn close(&self) {
        let started = self.inner.state.send_if_modified(|state| {
            if state.is_shut_down() {
                false
            } else {
                *state = ConnectionState::Closing;
                true
            }
        });
        if !started {
            return;
        }

        tracing::info!("Closing broker connection");
        if let Transport::Mqtt(mqtt) = &self.inner.transport {
            mqtt.close().await;
        }
        self.inner.table.clear();
        set_state(&self.inner.state, ConnectionState::Closed);
        tracing::info!("Broker connection closed");
    }

    /// Number of registrations for an exact filter
    pub fn subscription_count(&self, filter: &str) -> usize {
        self.inner.table.count(filter)
    }

    /// Total number of registrations
    pub fn active_subscriptions(&self) -> usize {
        self.inner.table.len()
    }

    fn close_on_interrupt(&self) {
        let shared: Weak<BrokerShared> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                tracing::warn!("Unable to listen for interrupt signal");
                return;
            }
            if let Some(inner) = shared.upgrade() {
                tracing::info!("Interrupt received");
                Broker { inner }.close().await;
            }
        });
    }
}

/// Removes a registration when dropped
pub struct SubscriptionGuard {
    broker: Broker,
    id: Option<SubscriptionId>,
}

impl SubscriptionGuard {
    pub fn new(broker: &Broker, id: SubscriptionId) -> Self {
        Self {
            broker: broker.clone(),
            id: Some(id),
        }
    }

    /// Subscribe and tie the registration to the returned guard
    pub async fn subscribe(broker: &Broker, filter: &str, sink: MessageSink) -> BrokerResult<Self> {
        let id = broker.subscribe(filter, sink).await?;
        Ok(Self::new(broker, id))
    }

    pub fn id(&self) -> Option<SubscriptionId> {
        self.id
    }

    /// Keep the registration past the guard's lifetime
    fn disarm(&mut self) {
        self.id = None;
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.broker.unsubscribe(id);
        }
    }
}
