//! Command replies routed through the bridge's ingest task

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::bridge::BridgeInner;
use crate::error::{DeviceError, DeviceResult};
use crate::models::Light;

/// A call waiting for its reply to be merged
pub(crate) struct PendingReply {
    pub(crate) id: String,
    pub(crate) merged: oneshot::Sender<DeviceResult<Light>>,
}

/// Resolves with the light state after the reply was merged.
///
/// Dropping it forgets the pending reply; a reply that shows up later is
/// ignored by the ingest task.
pub struct ReplyWaiter {
    merged: oneshot::Receiver<DeviceResult<Light>>,
    bridge: Arc<BridgeInner>,
    reply_topic: String,
}

impl ReplyWaiter {
    pub(crate) fn new(
        merged: oneshot::Receiver<DeviceResult<Light>>,
        bridge: Arc<BridgeInner>,
        reply_topic: String,
    ) -> Self {
        Self {
            merged,
            bridge,
            reply_topic,
        }
    }
}

impl Future for ReplyWaiter {
    type Output = DeviceResult<Light>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.merged).poll(cx).map(|merged| {
            merged.unwrap_or_else(|_| {
                Err(DeviceError::BrokerUnavailable(
                    "light streams closed".to_string(),
                ))
            })
        })
    }
}

impl Drop for ReplyWaiter {
    fn drop(&mut self) {
        self.bridge.forget_reply(&self.reply_topic);
    }
}
