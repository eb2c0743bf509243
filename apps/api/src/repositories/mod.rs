//! Storage layer for Prysmalight
//!
//! The light repository is the single source of truth for queries. It is
//! only written through the subscription bridge, which keeps every store
//! change paired with its fan-out.

pub mod light;

pub use light::{LightRepository, MergeOutcome};
