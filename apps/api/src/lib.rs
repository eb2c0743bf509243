//! Prysmalight device state synchronization layer
//!
//! Keeps a canonical record of every registered light in step with the
//! lights themselves over a publish/subscribe bus, and exposes that state
//! to resolvers as queries, acknowledged mutations and live streams.

pub mod broker;
pub mod config;
pub mod error;
pub mod models;
pub mod repositories;
pub mod rpc;
pub mod services;
pub mod simulator;
pub mod subscriptions;
pub mod topics;

// Re-export commonly used types
pub use broker::{Broker, BrokerError, ConnectionState};
pub use error::{DeviceError, DeviceResult};
pub use models::{Light, LightEvent, LightPatch};
pub use repositories::LightRepository;
pub use rpc::DisconnectPolicy;
pub use services::{LightService, ServiceSettings};
pub use simulator::SimulatedLight;
pub use subscriptions::{LightStream, StreamKind};
pub use topics::Topics;
