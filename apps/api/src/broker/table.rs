//! Local subscription dispatch table
//!
//! Every `subscribe` call registers a (filter, sink) entry here. The table
//! counts entries per filter so the broker only talks to the bus on the
//! first registration and the last removal of a filter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{BrokerError, BrokerResult};

/// A message received from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Where matching messages are delivered
pub type MessageSink = mpsc::UnboundedSender<BusMessage>;

/// Handle for one registration in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Entry {
    filter: String,
    sink: MessageSink,
}

#[derive(Default)]
struct TableInner {
    entries: HashMap<SubscriptionId, Entry>,
    filters: HashMap<String, usize>,
}

#[derive(Clone, Default)]
pub(crate) struct SubscriptionTable {
    inner: Arc<Mutex<TableInner>>,
    next_id: Arc<AtomicU64>,
}

impl SubscriptionTable {
    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a sink; the flag is true for the first entry of `filter`
    pub(crate) fn insert(&self, filter: &str, sink: MessageSink) -> (SubscriptionId, bool) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.lock();
        let count = inner.filters.entry(filter.to_string()).or_insert(0);
        *count += 1;
        let first = *count == 1;
        inner.entries.insert(
            id,
            Entry {
                filter: filter.to_string(),
                sink,
            },
        );
        (id, first)
    }

    /// Remove a registration; the flag is true when it was the last one for
    /// its filter. Unknown ids return `None`.
    pub(crate) fn remove(&self, id: SubscriptionId) -> Option<(String, bool)> {
        let mut inner = self.lock();
        let entry = inner.entries.remove(&id)?;
        let last = match inner.filters.get_mut(&entry.filter) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            _ => {
                inner.filters.remove(&entry.filter);
                true
            }
        };
        Some((entry.filter, last))
    }

    /// Every filter with at least one registration
    pub(crate) fn filters(&self) -> Vec<String> {
        self.lock().filters.keys().cloned().collect()
    }

    pub(crate) fn count(&self, filter: &str) -> usize {
        self.lock().filters.get(filter).copied().unwrap_or(0)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Drop every registration, closing the sinks
    pub(crate) fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.filters.clear();
    }

    /// Deliver a message once to every distinct sink with a matching filter.
    ///
    /// Returns the number of sinks reached.
    pub(crate) fn dispatch(&self, topic: &str, payload: Bytes) -> usize {
        let mut sinks: Vec<MessageSink> = Vec::new();
        {
            let inner = self.lock();
            for entry in inner.entries.values() {
                if topic_matches(&entry.filter, topic)
                    && !sinks.iter().any(|s| s.same_channel(&entry.sink))
                {
                    sinks.push(entry.sink.clone());
                }
            }
        }

        let mut delivered = 0;
        for sink in sinks {
            let message = BusMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if sink.send(message).is_ok() {
                delivered += 1;
            }
        }

        if delivered == 0 {
            tracing::trace!(topic, "No local subscriber for message");
        }
        delivered
    }
}

/// MQTT filter matching with `+` (one level) and `#` (rest) wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub(crate) fn validate_filter(filter: &str) -> BrokerResult<()> {
    let invalid = || BrokerError::InvalidTopic(filter.to_string());
    if filter.is_empty() {
        return Err(invalid());
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(invalid());
        }
        if level.contains('+') && *level != "+" {
            return Err(invalid());
        }
    }
    Ok(())
}

pub(crate) fn validate_topic(topic: &str) -> BrokerResult<()> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(BrokerError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}
