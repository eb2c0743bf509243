//! Common test utilities for API integration tests
//!
//! This module provides shared test infrastructure for integration tests,
//! including a wired light service on a loopback broker and helpers for
//! reading light streams.

#![allow(unused_imports)]

pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;
