//! Loopback backend
//!
//! Publishing dispatches straight into the local table. Used by tests and
//! single-process development, with controls to simulate bus faults.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;

use super::table::SubscriptionTable;
use super::{set_state, BrokerError, BrokerResult, ConnectionState, StateSender};

pub struct MemoryTransport {
    table: SubscriptionTable,
    state: StateSender,
    rejected_prefixes: Mutex<Vec<String>>,
    published: AtomicU64,
}

impl MemoryTransport {
    pub(crate) fn new(table: SubscriptionTable, state: StateSender) -> Self {
        Self {
            table,
            state,
            rejected_prefixes: Mutex::new(Vec::new()),
            published: AtomicU64::new(0),
        }
    }

    pub(crate) fn subscribe(&self, filter: &str) -> BrokerResult<()> {
        let rejected = self
            .rejected_prefixes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|prefix| filter.starts_with(prefix.as_str()));

        if rejected {
            return Err(BrokerError::Subscribe {
                filter: filter.to_string(),
                reason: "rejected by broker".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn unsubscribe(&self, _filter: &str) {}

    pub(crate) fn publish(&self, topic: &str, payload: Bytes) -> BrokerResult<()> {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.table.dispatch(topic, payload);
        Ok(())
    }

    /// Drop the connection; registrations survive
    pub fn simulate_disconnect(&self) {
        if set_state(&self.state, ConnectionState::Disconnected) {
            tracing::info!("Simulated broker disconnect");
        }
    }

    /// Restore the connection
    pub fn simulate_reconnect(&self) {
        set_state(&self.state, ConnectionState::Connecting);
        if set_state(&self.state, ConnectionState::Connected) {
            tracing::info!("Simulated broker reconnect");
        }
    }

    /// Reject every future subscribe whose filter starts with `prefix`
    pub fn reject_subscriptions(&self, prefix: impl Into<String>) {
        self.rejected_prefixes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prefix.into());
    }

    /// Accept subscriptions again
    pub fn accept_subscriptions(&self) {
        self.rejected_prefixes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Messages published since creation
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}
