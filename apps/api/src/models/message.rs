//! Bus payload parse boundary
//!
//! Inbound payloads are decoded here into a fixed tagged schema per topic
//! and validated before anything touches the store. Outbound command bodies
//! are built here too, so the JSON encoding never leaks past this module.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::light::{Color, ConnectionStatus, LightPatch, PowerState};
use crate::topics::{TopicKind, Topics};

/// A validated event published by a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    /// `{base}/{id}/connected`
    Connection { id: String, status: ConnectionStatus },
    /// `{base}/{id}/state`
    State { id: String, patch: LightPatch },
    /// `{base}/{id}/effects`
    Effects { id: String, effects: Vec<String> },
}

impl DeviceMessage {
    pub fn id(&self) -> &str {
        match self {
            Self::Connection { id, .. } | Self::State { id, .. } | Self::Effects { id, .. } => id,
        }
    }

    /// The store update this event carries
    pub fn into_patch(self) -> (String, LightPatch) {
        match self {
            Self::Connection { id, status } => (id, LightPatch::connection(status)),
            Self::State { id, patch } => (id, patch),
            Self::Effects { id, effects } => (id, LightPatch::effects(effects)),
        }
    }
}

/// What a device answered on a reply topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Acknowledged state (partial or full)
    State(LightPatch),
    /// The device refused the command
    Rejected(String),
}

/// Errors raised at the parse boundary
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("payload on '{topic}' is not valid: {source}")]
    Decode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("payload on '{0}' carries no device id")]
    MissingId(String),

    #[error("payload id '{payload}' does not match '{expected}'")]
    IdMismatch { expected: String, payload: String },

    #[error("payload on '{topic}' is invalid: {reason}")]
    Invalid { topic: String, reason: String },
}

/// Everything a device may put in a report, before per-topic validation
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReport {
    #[serde(default, alias = "name")]
    id: Option<String>,
    #[serde(default, alias = "connection")]
    connected: Option<ConnectionStatus>,
    #[serde(default)]
    state: Option<PowerState>,
    #[serde(default)]
    brightness: Option<u8>,
    #[serde(default)]
    color: Option<Color>,
    #[serde(default)]
    effect: Option<String>,
    #[serde(default)]
    speed: Option<u8>,
    #[serde(default, alias = "effectList")]
    supported_effects: Option<Vec<String>>,
    #[serde(default)]
    error: Option<String>,
}

impl RawReport {
    fn decode(topic: &str, payload: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(payload).map_err(|source| MessageError::Decode {
            topic: topic.to_string(),
            source,
        })
    }

    /// The payload id, which must be present and agree with `expected`
    fn require_id(&mut self, topic: &str, expected: &str) -> Result<String, MessageError> {
        let id = self
            .id
            .take()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| MessageError::MissingId(topic.to_string()))?;
        check_id(expected, &id)?;
        Ok(id)
    }

    fn state_patch(&self) -> LightPatch {
        LightPatch {
            connected: self.connected,
            state: self.state,
            brightness: self.brightness,
            color: self.color,
            effect: self.effect.clone(),
            speed: self.speed,
            supported_effects: None,
        }
    }
}

fn check_id(expected: &str, payload: &str) -> Result<(), MessageError> {
    if payload != expected {
        return Err(MessageError::IdMismatch {
            expected: expected.to_string(),
            payload: payload.to_string(),
        });
    }
    Ok(())
}

fn validated(topic: &str, patch: LightPatch) -> Result<LightPatch, MessageError> {
    patch.validate().map_err(|e| MessageError::Invalid {
        topic: topic.to_string(),
        reason: e.to_string(),
    })?;
    Ok(patch)
}

/// Parse a message received on `topic`.
///
/// Returns `Ok(None)` for topics that carry no device event (commands,
/// replies, discovery traffic).
pub fn parse(
    topics: &Topics,
    topic: &str,
    payload: &[u8],
) -> Result<Option<DeviceMessage>, MessageError> {
    let Some((topic_id, kind)) = topics.classify(topic) else {
        return Ok(None);
    };
    if !kind.is_device_event() {
        return Ok(None);
    }

    let mut raw = RawReport::decode(topic, payload)?;
    let id = raw.require_id(topic, topic_id)?;

    let message = match kind {
        TopicKind::Connected => {
            let status = raw.connected.ok_or_else(|| MessageError::Invalid {
                topic: topic.to_string(),
                reason: "missing connection status".to_string(),
            })?;
            DeviceMessage::Connection { id, status }
        }
        TopicKind::Effects => {
            let effects = raw
                .supported_effects
                .take()
                .ok_or_else(|| MessageError::Invalid {
                    topic: topic.to_string(),
                    reason: "missing effect list".to_string(),
                })?;
            let patch = validated(topic, LightPatch::effects(effects))?;
            DeviceMessage::Effects {
                id,
                effects: patch.supported_effects.unwrap_or_default(),
            }
        }
        _ => {
            let patch = validated(topic, raw.state_patch())?;
            if patch.is_empty() {
                return Err(MessageError::Invalid {
                    topic: topic.to_string(),
                    reason: "no state fields".to_string(),
                });
            }
            DeviceMessage::State { id, patch }
        }
    };

    Ok(Some(message))
}

/// Parse a command reply from light `id`.
///
/// The reply topic already identifies the light, so the payload id is
/// optional, but it must match when present.
pub fn parse_reply(id: &str, topic: &str, payload: &[u8]) -> Result<Reply, MessageError> {
    let raw = RawReport::decode(topic, payload)?;
    if let Some(reason) = raw.error {
        return Ok(Reply::Rejected(reason));
    }
    if let Some(reported) = raw.id.as_deref() {
        check_id(id, reported)?;
    }

    let mut patch = raw.state_patch();
    patch.supported_effects = raw.supported_effects;
    validated(topic, patch).map(Reply::State)
}

/// Parse a discovery announcement and return the announcing id
pub fn parse_hello(topic: &str, payload: &[u8]) -> Result<String, MessageError> {
    let raw = RawReport::decode(topic, payload)?;
    raw.id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| MessageError::MissingId(topic.to_string()))
}

#[derive(Serialize)]
struct Tagged<'a> {
    id: &'a str,
    #[serde(flatten)]
    patch: &'a LightPatch,
}

/// Body of a `SET` command
pub fn set_command(id: &str, patch: &LightPatch) -> Result<Value, serde_json::Error> {
    serde_json::to_value(Tagged { id, patch })
}

/// Body of a state report or an acknowledging reply
pub fn state_report(id: &str, patch: &LightPatch) -> Result<Value, serde_json::Error> {
    serde_json::to_value(Tagged { id, patch })
}

/// Body of a reply refusing a command
pub fn rejection(id: &str, reason: &str) -> Value {
    serde_json::json!({ "id": id, "error": reason })
}

/// Body of a `GET` command
pub fn get_command(id: &str) -> Value {
    serde_json::json!({ "id": id })
}

/// Body of a connectivity announcement
pub fn connection_event(id: &str, status: ConnectionStatus) -> Value {
    serde_json::json!({ "id": id, "connection": u8::from(status) })
}

/// Body of an effect list announcement
pub fn effects_event(id: &str, effects: &[String]) -> Value {
    serde_json::json!({ "id": id, "effectList": effects })
}
