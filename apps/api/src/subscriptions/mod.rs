//! Subscription Bridge
//!
//! Re-exposes reference-counted bus subscriptions as lazy, cancelable
//! per-client event streams, and owns the only write path into the light
//! store.

mod bridge;
mod reply;
mod stream;

pub use bridge::SubscriptionBridge;
pub use reply::ReplyWaiter;
pub use stream::LightStream;

use crate::models::LightEvent;
use crate::topics::Topics;

/// What a stream delivers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Changes of one light
    Light(String),
    /// Changes of every light
    AllLights,
    /// Registrations
    Added,
    /// Deregistrations
    Removed,
}

impl StreamKind {
    /// Bus pattern this stream needs, if any.
    ///
    /// Registry streams are fed locally by add/remove and need none.
    pub fn topic_pattern(&self, topics: &Topics) -> Option<String> {
        match self {
            Self::Light(id) => Some(topics.light_pattern(id)),
            Self::AllLights => Some(topics.all_lights_pattern()),
            Self::Added | Self::Removed => None,
        }
    }

    pub fn accepts(&self, event: &LightEvent) -> bool {
        match (self, event) {
            (Self::Light(id), LightEvent::Changed { light, .. }) => &light.id == id,
            (Self::AllLights, LightEvent::Changed { .. }) => true,
            (Self::Added, LightEvent::Added { .. }) => true,
            (Self::Removed, LightEvent::Removed { .. }) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Light(id) => write!(f, "light:{}", id),
            Self::AllLights => write!(f, "all-lights"),
            Self::Added => write!(f, "lights-added"),
            Self::Removed => write!(f, "lights-removed"),
        }
    }
}
