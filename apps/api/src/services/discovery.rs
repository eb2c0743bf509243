//! Light discovery
//!
//! Broadcasts a discovery request and collects the id of every light that
//! answers on the hello topic within a fixed window.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::broker::{Broker, SubscriptionGuard};
use crate::error::DeviceResult;
use crate::models::message;
use crate::topics::Topics;

#[derive(Clone)]
pub struct DiscoveryService {
    broker: Broker,
    topics: Topics,
    window: Duration,
}

impl DiscoveryService {
    pub fn new(broker: Broker, topics: Topics, window: Duration) -> Self {
        Self {
            broker,
            topics,
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Run one discovery round and return every announcing id, sorted
    pub async fn discover(&self) -> DeviceResult<Vec<String>> {
        let (sink, mut announcements) = mpsc::unbounded_channel();
        let hello = self.topics.hello();
        let _subscription = SubscriptionGuard::subscribe(&self.broker, &hello, sink).await?;

        self.broker.publish(&self.topics.discovery(), "{}").await?;
        tracing::debug!(window_ms = self.window.as_millis() as u64, "Discovery request sent");

        let deadline = Instant::now() + self.window;
        let mut found = BTreeSet::new();

        loop {
            tokio::select! {
                announcement = announcements.recv() => match announcement {
                    Some(announcement) => {
                        match message::parse_hello(&announcement.topic, &announcement.payload) {
                            Ok(id) => {
                                found.insert(id);
                            }
                            Err(e) => tracing::warn!(error = %e, "Ignoring malformed discovery announcement"),
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        tracing::info!(count = found.len(), "Discovery round finished");
        Ok(found.into_iter().collect())
    }
}
