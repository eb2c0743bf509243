//! Business logic services for Prysmalight
//!
//! This module contains:
//! - The light service façade consumed by resolvers
//! - Discovery of lights that are not registered yet

pub mod discovery;
pub mod light;

pub use discovery::DiscoveryService;
pub use light::{LightService, ServiceSettings};
