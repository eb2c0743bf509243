//! Bus topic layout
//!
//! All topics live under one base prefix:
//!
//! - `{base}/{id}/connected`, `{base}/{id}/state`, `{base}/{id}/effects`: device events
//! - `{base}/{id}/command`, `{base}/{id}/get`: commands to a device
//! - `{base}/{id}/reply/{correlation}`: per-call reply topics
//! - `{base}/discovery`, `{base}/hello`: discovery round

use prysmalight_shared_config::DEFAULT_BASE_TOPIC;

/// What a device-scoped topic carries, keyed by its last segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Connected,
    State,
    Effects,
    Command,
    Get,
}

impl TopicKind {
    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "connected" => Some(Self::Connected),
            "state" => Some(Self::State),
            "effects" => Some(Self::Effects),
            "command" => Some(Self::Command),
            "get" => Some(Self::Get),
            _ => None,
        }
    }

    /// Whether devices publish on this topic
    pub fn is_device_event(&self) -> bool {
        matches!(self, Self::Connected | Self::State | Self::Effects)
    }
}

/// Topic builder for one base prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_TOPIC)
    }
}

impl Topics {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn connected(&self, id: &str) -> String {
        format!("{}/{}/connected", self.base, id)
    }

    pub fn state(&self, id: &str) -> String {
        format!("{}/{}/state", self.base, id)
    }

    pub fn effects(&self, id: &str) -> String {
        format!("{}/{}/effects", self.base, id)
    }

    pub fn command(&self, id: &str) -> String {
        format!("{}/{}/command", self.base, id)
    }

    pub fn get(&self, id: &str) -> String {
        format!("{}/{}/get", self.base, id)
    }

    /// Prefix under which each call picks its own reply topic
    pub fn reply_prefix(&self, id: &str) -> String {
        format!("{}/{}/reply", self.base, id)
    }

    /// Every event topic of one light
    pub fn light_pattern(&self, id: &str) -> String {
        format!("{}/{}/+", self.base, id)
    }

    /// Every event topic of every light
    pub fn all_lights_pattern(&self) -> String {
        format!("{}/+/+", self.base)
    }

    pub fn discovery(&self) -> String {
        format!("{}/discovery", self.base)
    }

    pub fn hello(&self) -> String {
        format!("{}/hello", self.base)
    }

    /// Split a device-scoped topic into `(id, kind)`.
    ///
    /// Reply topics and anything outside the base prefix return `None`.
    pub fn classify<'a>(&self, topic: &'a str) -> Option<(&'a str, TopicKind)> {
        let rest = topic.strip_prefix(self.base.as_str())?.strip_prefix('/')?;
        let (id, segment) = rest.split_once('/')?;
        if id.is_empty() || segment.contains('/') {
            return None;
        }
        TopicKind::from_segment(segment).map(|kind| (id, kind))
    }
}

/// Check that a light id can be embedded in a topic
pub fn validate_light_id(id: &str) -> Result<(), String> {
    if id.trim().is_empty() {
        return Err("light id cannot be empty".to_string());
    }
    if id.contains(['/', '+', '#']) {
        return Err(format!(
            "light id '{}' cannot contain '/', '+' or '#'",
            id
        ));
    }
    if id == "discovery" || id == "hello" {
        return Err(format!("light id '{}' is reserved", id));
    }
    Ok(())
}
