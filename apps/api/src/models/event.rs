//! Events delivered to light subscription streams

use serde::Serialize;

use super::light::{Light, LightPatch};

/// One event on a light stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LightEvent {
    /// A tracked light changed; `changes` holds only the fields that moved
    Changed { light: Light, changes: LightPatch },
    /// A light was registered
    Added { light: Light },
    /// A light was deregistered
    Removed { id: String },
}

impl LightEvent {
    pub fn id(&self) -> &str {
        match self {
            Self::Changed { light, .. } | Self::Added { light } => &light.id,
            Self::Removed { id } => id,
        }
    }

    /// The light state after this event, if it still exists
    pub fn light(&self) -> Option<&Light> {
        match self {
            Self::Changed { light, .. } | Self::Added { light } => Some(light),
            Self::Removed { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::light::PowerState;

    #[test]
    fn test_event_accessors() {
        let changed = LightEvent::Changed {
            light: Light::new("L1"),
            changes: LightPatch::power(PowerState::On),
        };
        assert_eq!(changed.id(), "L1");
        assert!(changed.light().is_some());

        let removed = LightEvent::Removed {
            id: "L2".to_string(),
        };
        assert_eq!(removed.id(), "L2");
        assert!(removed.light().is_none());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(LightEvent::Removed {
            id: "L1".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "removed");
        assert_eq!(json["id"], "L1");
    }
}
