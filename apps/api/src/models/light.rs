//! Light model
//!
//! A [`Light`] is the canonical view of one physical device. Every mutable
//! field is changed only through [`Light::merge`] with a patch that came
//! from the bus, so the returned change set is the single source for
//! subscription fan-out.

use serde::{Deserialize, Serialize};

/// Effect name devices report when no effect is running
pub const NO_EFFECT: &str = "None";

/// Lowest and highest animation speed a light accepts
pub const MIN_SPEED: u8 = 1;
pub const MAX_SPEED: u8 = 7;

/// Highest brightness percentage
pub const MAX_BRIGHTNESS: u8 = 100;

/// Device connectivity as reported on the `connected` topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ConnectionStatus {
    /// Unknown or offline
    #[default]
    Offline,
    Connecting,
    Online,
}

impl ConnectionStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }
}

impl TryFrom<u8> for ConnectionStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Offline),
            1 => Ok(Self::Connecting),
            2 => Ok(Self::Online),
            other => Err(format!("connection status must be 0, 1 or 2, got {}", other)),
        }
    }
}

impl From<ConnectionStatus> for u8 {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Offline => 0,
            ConnectionStatus::Connecting => 1,
            ConnectionStatus::Online => 2,
        }
    }
}

/// Power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PowerState {
    On,
    #[default]
    Off,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::On => write!(f, "ON"),
            Self::Off => write!(f, "OFF"),
        }
    }
}

/// RGB color, each channel 0-255
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::new(0, 1, 2)
    }
}

/// Canonical state of one light
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Light {
    #[serde(alias = "name")]
    pub id: String,
    pub connected: ConnectionStatus,
    pub state: PowerState,
    pub brightness: u8,
    pub color: Color,
    pub effect: Option<String>,
    pub speed: u8,
    pub supported_effects: Vec<String>,
}

impl Light {
    /// A newly registered light with default field values
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connected: ConnectionStatus::Offline,
            state: PowerState::Off,
            brightness: MAX_BRIGHTNESS,
            color: Color::default(),
            effect: None,
            speed: 4,
            supported_effects: Vec::new(),
        }
    }

    /// Merge a patch into this light.
    ///
    /// Only fields present in the patch are considered, and a field equal to
    /// the stored value is a no-op. The returned patch holds exactly the
    /// fields that changed; an empty result means nothing changed.
    ///
    /// `supported_effects` is only accepted while the stored list is empty.
    pub fn merge(&mut self, patch: &LightPatch) -> LightPatch {
        let mut changes = LightPatch::default();

        if let Some(connected) = patch.connected {
            if self.connected != connected {
                self.connected = connected;
                changes.connected = Some(connected);
            }
        }
        if let Some(state) = patch.state {
            if self.state != state {
                self.state = state;
                changes.state = Some(state);
            }
        }
        if let Some(brightness) = patch.brightness {
            if self.brightness != brightness {
                self.brightness = brightness;
                changes.brightness = Some(brightness);
            }
        }
        if let Some(color) = patch.color {
            if self.color != color {
                self.color = color;
                changes.color = Some(color);
            }
        }
        if let Some(effect) = &patch.effect {
            let next = (effect != NO_EFFECT).then(|| effect.clone());
            if self.effect != next {
                self.effect = next;
                changes.effect = Some(effect.clone());
            }
        }
        if let Some(speed) = patch.speed {
            if self.speed != speed {
                self.speed = speed;
                changes.speed = Some(speed);
            }
        }
        if let Some(effects) = &patch.supported_effects {
            if self.supported_effects.is_empty() && !effects.is_empty() {
                self.supported_effects = effects.clone();
                changes.supported_effects = Some(effects.clone());
            }
        }

        changes
    }

    /// Whether the light can run the named effect
    pub fn supports_effect(&self, effect: &str) -> bool {
        effect == NO_EFFECT
            || self.supported_effects.is_empty()
            || self.supported_effects.iter().any(|e| e == effect)
    }
}

/// A partial light: inbound events, command payloads and merge change sets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected: Option<ConnectionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PowerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_effects: Option<Vec<String>>,
}

/// Validation errors for light patches
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LightValidationError {
    #[error("brightness must be between 0 and 100, got {0}")]
    Brightness(u8),

    #[error("speed must be between 1 and 7, got {0}")]
    Speed(u8),

    #[error("effect name cannot be empty")]
    EmptyEffect,

    #[error("effect list cannot contain empty names")]
    EmptyEffectInList,
}

impl LightPatch {
    /// Patch that only sets the power state
    pub fn power(state: PowerState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// Patch that only sets connectivity
    pub fn connection(status: ConnectionStatus) -> Self {
        Self {
            connected: Some(status),
            ..Self::default()
        }
    }

    /// Patch that only sets the effect list
    pub fn effects(effects: Vec<String>) -> Self {
        Self {
            supported_effects: Some(effects),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.connected.is_none()
            && self.state.is_none()
            && self.brightness.is_none()
            && self.color.is_none()
            && self.effect.is_none()
            && self.speed.is_none()
            && self.supported_effects.is_none()
    }

    /// Check the ranges serde cannot express on its own
    pub fn validate(&self) -> Result<(), LightValidationError> {
        if let Some(brightness) = self.brightness {
            if brightness > MAX_BRIGHTNESS {
                return Err(LightValidationError::Brightness(brightness));
            }
        }
        if let Some(speed) = self.speed {
            if !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
                return Err(LightValidationError::Speed(speed));
            }
        }
        if let Some(effect) = &self.effect {
            if effect.trim().is_empty() {
                return Err(LightValidationError::EmptyEffect);
            }
        }
        if let Some(effects) = &self.supported_effects {
            if effects.iter().any(|e| e.trim().is_empty()) {
                return Err(LightValidationError::EmptyEffectInList);
            }
        }
        Ok(())
    }
}

impl From<&Light> for LightPatch {
    fn from(light: &Light) -> Self {
        Self {
            connected: Some(light.connected),
            state: Some(light.state),
            brightness: Some(light.brightness),
            color: Some(light.color),
            effect: Some(
                light
                    .effect
                    .clone()
                    .unwrap_or_else(|| NO_EFFECT.to_string()),
            ),
            speed: Some(light.speed),
            supported_effects: Some(light.supported_effects.clone()),
        }
    }
}
