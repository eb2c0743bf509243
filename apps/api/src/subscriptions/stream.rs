//! Client-facing light event stream

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::bridge::BridgeInner;
use super::StreamKind;
use crate::models::LightEvent;

/// A lazy, infinite stream of light events.
///
/// Dropping it stops delivery, removes its registration and releases its
/// bus pattern.
pub struct LightStream {
    events: UnboundedReceiverStream<LightEvent>,
    registration: Registration,
}

/// Removes the registration when the stream goes away
pub(crate) struct Registration {
    pub(crate) bridge: Arc<BridgeInner>,
    pub(crate) id: u64,
    pub(crate) kind: StreamKind,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.bridge.close_registration(self.id);
    }
}

impl LightStream {
    pub(crate) fn new(
        events: tokio::sync::mpsc::UnboundedReceiver<LightEvent>,
        registration: Registration,
    ) -> Self {
        Self {
            events: UnboundedReceiverStream::new(events),
            registration,
        }
    }

    pub fn kind(&self) -> &StreamKind {
        &self.registration.kind
    }

    /// Stop the stream
    pub fn close(self) {}
}

impl Stream for LightStream {
    type Item = LightEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl std::fmt::Debug for LightStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightStream")
            .field("kind", &self.registration.kind)
            .field("registration", &self.registration.id)
            .finish()
    }
}
