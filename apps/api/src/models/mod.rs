//! Domain models for Prysmalight
//!
//! This module contains:
//! - The canonical light state and partial patches
//! - The bus payload parse boundary
//! - Events delivered to subscription streams

pub mod event;
pub mod light;
pub mod message;

pub use event::LightEvent;
pub use light::{
    Color, ConnectionStatus, Light, LightPatch, LightValidationError, PowerState, NO_EFFECT,
};
pub use message::{DeviceMessage, MessageError, Reply};
