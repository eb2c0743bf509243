//! Bus-to-stream bridge
//!
//! Every bus subscription the bridge holds delivers into one ingest
//! channel, drained by a single task so per-light event order is the
//! broker's arrival order. Command replies are delivered into the same
//! channel, so a reply and the events around it are merged in the order
//! they arrived. The ingest task and registry operations all write the
//! store through one serialized apply step, which is also where fan-out
//! happens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot};

use super::reply::{PendingReply, ReplyWaiter};
use super::stream::{LightStream, Registration};
use super::StreamKind;
use crate::broker::{Broker, BusMessage, MessageSink, SubscriptionId};
use crate::error::{DeviceError, DeviceResult};
use crate::models::{message, Light, LightEvent, LightPatch, Reply};
use crate::repositories::LightRepository;
use crate::topics::Topics;

/// Shared bridge state
#[derive(Clone)]
pub struct SubscriptionBridge {
    inner: Arc<BridgeInner>,
}

struct Client {
    kind: StreamKind,
    pattern: Option<String>,
    sender: mpsc::UnboundedSender<LightEvent>,
}

struct PatternHold {
    subscription: SubscriptionId,
    holders: usize,
}

pub(crate) struct BridgeInner {
    broker: Broker,
    topics: Topics,
    store: LightRepository,
    ingest: MessageSink,
    clients: DashMap<u64, Client>,
    patterns: Mutex<HashMap<String, PatternHold>>,
    tracked: DashSet<String>,
    replies: DashMap<String, PendingReply>,
    merge_lock: tokio::sync::Mutex<()>,
    next_client: AtomicU64,
}

impl SubscriptionBridge {
    /// Create the bridge and start its ingest task.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(broker: Broker, store: LightRepository, topics: Topics) -> Self {
        let (ingest, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(BridgeInner {
            broker,
            topics,
            store,
            ingest,
            clients: DashMap::new(),
            patterns: Mutex::new(HashMap::new()),
            tracked: DashSet::new(),
            replies: DashMap::new(),
            merge_lock: tokio::sync::Mutex::new(()),
            next_client: AtomicU64::new(1),
        });

        spawn_ingest(Arc::downgrade(&inner), receiver);
        Self { inner }
    }

    pub fn store(&self) -> &LightRepository {
        &self.inner.store
    }

    /// Merge a patch for a registered light and fan out what changed
    pub async fn apply(&self, id: &str, patch: &LightPatch) -> DeviceResult<Light> {
        self.inner.apply(id, patch).await
    }

    /// Route the reply to a call for light `id` through the ingest task.
    ///
    /// Returns the sink to subscribe `reply_topic` with and a future that
    /// resolves once the reply has been merged.
    pub fn expect_reply(&self, id: &str, reply_topic: &str) -> (MessageSink, ReplyWaiter) {
        let (merged, waiter) = oneshot::channel();
        self.inner.replies.insert(
            reply_topic.to_string(),
            PendingReply {
                id: id.to_string(),
                merged,
            },
        );
        (
            self.inner.ingest.clone(),
            ReplyWaiter::new(waiter, Arc::clone(&self.inner), reply_topic.to_string()),
        )
    }

    /// Calls still waiting for a reply
    pub fn pending_replies(&self) -> usize {
        self.inner.replies.len()
    }

    /// Register a light with defaults, start tracking its topics and
    /// announce it on the added stream
    pub async fn register_light(&self, id: &str) -> DeviceResult<Light> {
        let inner = &self.inner;
        let _merge = inner.merge_lock.lock().await;

        if inner.store.contains(id).await? {
            return Err(DeviceError::AlreadyExists(id.to_string()));
        }
        inner.track(id).await?;

        let light = match inner.store.insert_default(id).await {
            Ok(light) => light,
            Err(e) => {
                inner.untrack(id);
                return Err(e);
            }
        };

        tracing::info!(id, "Light registered");
        inner.fan_out(&LightEvent::Added {
            light: light.clone(),
        });
        Ok(light)
    }

    /// Forget a light, stop tracking its topics and announce it on the
    /// removed stream. Returns the last known state.
    pub async fn deregister_light(&self, id: &str) -> DeviceResult<Light> {
        let inner = &self.inner;
        let _merge = inner.merge_lock.lock().await;

        let light = inner
            .store
            .get(id)
            .await?
            .ok_or_else(|| DeviceError::unknown(id))?;
        inner.store.remove(id).await?;
        inner.untrack(id);

        tracing::info!(id, "Light removed");
        inner.fan_out(&LightEvent::Removed { id: id.to_string() });
        Ok(light)
    }

    /// Keep the store current for a light that is already stored
    pub async fn track(&self, id: &str) -> DeviceResult<()> {
        self.inner.track(id).await
    }

    /// Open a client stream
    pub async fn open_stream(&self, kind: StreamKind) -> DeviceResult<LightStream> {
        let inner = &self.inner;
        let pattern = kind.topic_pattern(&inner.topics);
        if let Some(pattern) = &pattern {
            inner.acquire(pattern).await?;
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let id = inner.next_client.fetch_add(1, Ordering::Relaxed);
        inner.clients.insert(
            id,
            Client {
                kind: kind.clone(),
                pattern,
                sender,
            },
        );
        tracing::debug!(registration = id, kind = %kind, "Stream opened");

        Ok(LightStream::new(
            receiver,
            Registration {
                bridge: Arc::clone(inner),
                id,
                kind,
            },
        ))
    }

    /// Holders of a bus pattern (streams plus light tracking)
    pub fn pattern_holders(&self, pattern: &str) -> usize {
        self.inner
            .lock_patterns()
            .get(pattern)
            .map(|hold| hold.holders)
            .unwrap_or(0)
    }

    /// Number of open client streams
    pub fn stream_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// End every open stream
    pub fn close_streams(&self) {
        let count = self.inner.clients.len();
        self.inner.clients.clear();
        self.inner.lock_patterns().clear();
        self.inner.tracked.clear();
        self.inner.replies.clear();
        tracing::debug!(count, "Closed all light streams");
    }
}

impl BridgeInner {
    fn lock_patterns(&self) -> MutexGuard<'_, HashMap<String, PatternHold>> {
        self.patterns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn apply(&self, id: &str, patch: &LightPatch) -> DeviceResult<Light> {
        let _merge = self.merge_lock.lock().await;

        if !self.store.contains(id).await? {
            return Err(DeviceError::unknown(id));
        }
        let outcome = self.store.upsert_fields(id, patch).await?;

        if !outcome.changes.is_empty() {
            tracing::debug!(id, changes = ?outcome.changes, "Light changed");
            self.fan_out(&LightEvent::Changed {
                light: outcome.light.clone(),
                changes: outcome.changes,
            });
        }
        Ok(outcome.light)
    }

    fn fan_out(&self, event: &LightEvent) {
        let mut delivered = 0;
        for client in self.clients.iter() {
            if client.kind.accepts(event) && client.sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        tracing::trace!(id = event.id(), delivered, "Fanned out light event");
    }

    async fn ingest(&self, message: BusMessage) {
        if let Some((_, pending)) = self.replies.remove(&message.topic) {
            let merged = self.merge_reply(&pending.id, &message).await;
            // The caller may have given up in the meantime
            let _ = pending.merged.send(merged);
            return;
        }

        let parsed = match message::parse(&self.topics, &message.topic, &message.payload) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "Dropping malformed device event");
                return;
            }
        };

        let (id, patch) = parsed.into_patch();
        match self.apply(&id, &patch).await {
            Ok(_) => {}
            Err(DeviceError::UnknownDevice(_)) => {
                tracing::debug!(id = %id, topic = %message.topic, "Dropping event for unregistered light");
            }
            Err(e) => e.log(),
        }
    }

    async fn merge_reply(&self, id: &str, reply: &BusMessage) -> DeviceResult<Light> {
        match message::parse_reply(id, &reply.topic, &reply.payload)? {
            Reply::Rejected(reason) => Err(DeviceError::DeviceRejected {
                id: id.to_string(),
                reason,
            }),
            Reply::State(patch) => self.apply(id, &patch).await,
        }
    }

    pub(crate) fn forget_reply(&self, reply_topic: &str) {
        self.replies.remove(reply_topic);
    }

    async fn track(&self, id: &str) -> DeviceResult<()> {
        if !self.tracked.insert(id.to_string()) {
            return Ok(());
        }
        if let Err(e) = self.acquire(&self.topics.light_pattern(id)).await {
            self.tracked.remove(id);
            return Err(e);
        }
        Ok(())
    }

    fn untrack(&self, id: &str) {
        if self.tracked.remove(id).is_some() {
            self.release(&self.topics.light_pattern(id));
        }
    }

    /// Take a reference on a bus pattern, subscribing for the first holder
    async fn acquire(&self, pattern: &str) -> DeviceResult<()> {
        if let Some(hold) = self.lock_patterns().get_mut(pattern) {
            hold.holders += 1;
            return Ok(());
        }

        let subscription = self.broker.subscribe(pattern, self.ingest.clone()).await?;

        let mut patterns = self.lock_patterns();
        match patterns.get_mut(pattern) {
            Some(hold) => {
                // Another holder subscribed while we were waiting
                hold.holders += 1;
                drop(patterns);
                self.broker.unsubscribe(subscription);
            }
            None => {
                patterns.insert(
                    pattern.to_string(),
                    PatternHold {
                        subscription,
                        holders: 1,
                    },
                );
                tracing::debug!(pattern, "Bus pattern subscribed");
            }
        }
        Ok(())
    }

    /// Drop a reference on a bus pattern, unsubscribing after the last one
    fn release(&self, pattern: &str) {
        let released = {
            let mut patterns = self.lock_patterns();
            match patterns.get_mut(pattern) {
                Some(hold) if hold.holders > 1 => {
                    hold.holders -= 1;
                    None
                }
                Some(_) => patterns.remove(pattern).map(|hold| hold.subscription),
                None => None,
            }
        };

        if let Some(subscription) = released {
            self.broker.unsubscribe(subscription);
            tracing::debug!(pattern, "Bus pattern released");
        }
    }

    pub(crate) fn close_registration(&self, id: u64) {
        if let Some((_, client)) = self.clients.remove(&id) {
            if let Some(pattern) = &client.pattern {
                self.release(pattern);
            }
            tracing::debug!(registration = id, kind = %client.kind, "Stream closed");
        }
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        let patterns = std::mem::take(self.patterns.get_mut().unwrap_or_else(PoisonError::into_inner));
        for hold in patterns.into_values() {
            self.broker.unsubscribe(hold.subscription);
        }
    }
}

fn spawn_ingest(bridge: Weak<BridgeInner>, mut receiver: mpsc::UnboundedReceiver<BusMessage>) {
    tokio::spawn(async move {
        while let Some(message) = receiver.recv().await {
            let Some(inner) = bridge.upgrade() else {
                break;
            };
            inner.ingest(message).await;
        }
        tracing::debug!("Subscription bridge ingest stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PowerState;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn bridge() -> (Broker, SubscriptionBridge) {
        let broker = Broker::in_memory();
        let bridge = SubscriptionBridge::new(
            broker.clone(),
            LightRepository::new_in_memory(),
            Topics::default(),
        );
        (broker, bridge)
    }

    #[tokio::test]
    async fn test_register_tracks_pattern() {
        let (broker, bridge) = bridge();

        bridge.register_light("L1").await.unwrap();
        assert_eq!(bridge.pattern_holders("prysmalight/L1/+"), 1);
        assert_eq!(broker.subscription_count("prysmalight/L1/+"), 1);

        bridge.deregister_light("L1").await.unwrap();
        assert_eq!(bridge.pattern_holders("prysmalight/L1/+"), 0);
        assert_eq!(broker.subscription_count("prysmalight/L1/+"), 0);
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let (_broker, bridge) = bridge();
        bridge.register_light("L1").await.unwrap();

        let result = bridge.register_light("L1").await;
        assert!(matches!(result, Err(DeviceError::AlreadyExists(_))));
        assert_eq!(bridge.pattern_holders("prysmalight/L1/+"), 1);
    }

    #[tokio::test]
    async fn test_apply_unknown_light() {
        let (_broker, bridge) = bridge();
        let result = bridge.apply("ghost", &LightPatch::power(PowerState::On)).await;
        assert!(matches!(result, Err(DeviceError::UnknownDevice(_))));
        assert!(bridge.store().get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ingest_updates_store_and_streams() {
        let (broker, bridge) = bridge();
        bridge.register_light("L1").await.unwrap();
        let mut stream = bridge
            .open_stream(StreamKind::Light("L1".to_string()))
            .await
            .unwrap();

        broker
            .publish("prysmalight/L1/state", r#"{"id":"L1","state":"ON"}"#)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.light().unwrap().state, PowerState::On);
        assert_eq!(
            bridge.store().get("L1").await.unwrap().unwrap().state,
            PowerState::On
        );
    }

    #[tokio::test]
    async fn test_identical_patch_fans_out_once() {
        let (_broker, bridge) = bridge();
        bridge.register_light("L1").await.unwrap();
        let mut stream = bridge.open_stream(StreamKind::AllLights).await.unwrap();

        let patch = LightPatch::power(PowerState::On);
        bridge.apply("L1", &patch).await.unwrap();
        bridge.apply("L1", &patch).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), stream.next()).await;
        assert!(matches!(first, Ok(Some(LightEvent::Changed { .. }))));
        let second = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_malformed_events_are_dropped() {
        let (broker, bridge) = bridge();
        bridge.register_light("L1").await.unwrap();
        let mut stream = bridge.open_stream(StreamKind::AllLights).await.unwrap();

        for payload in [
            "not json",
            r#"{"state":"ON"}"#,
            r#"{"id":"L2","state":"ON"}"#,
            r#"{"id":"L1","brightness":150}"#,
        ] {
            broker.publish("prysmalight/L1/state", payload).await.unwrap();
        }
        broker
            .publish("prysmalight/ghost/state", r#"{"id":"ghost","state":"ON"}"#)
            .await
            .unwrap();
        broker
            .publish("prysmalight/L1/state", r#"{"id":"L1","speed":2}"#)
            .await
            .unwrap();

        // Only the valid event for the registered light gets through
        let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.light().unwrap().speed, 2);
        let light = bridge.store().get("L1").await.unwrap().unwrap();
        assert_eq!(light.state, PowerState::Off);
        assert!(bridge.store().get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_pattern() {
        let (broker, bridge) = bridge();
        let stream = bridge.open_stream(StreamKind::AllLights).await.unwrap();
        assert_eq!(broker.subscription_count("prysmalight/+/+"), 1);
        assert_eq!(bridge.stream_count(), 1);

        drop(stream);

        assert_eq!(broker.subscription_count("prysmalight/+/+"), 0);
        assert_eq!(bridge.stream_count(), 0);
    }
}
