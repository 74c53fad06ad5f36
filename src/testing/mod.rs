//! Testing utilities and mock implementations
//!
//! This module provides mock implementations for testing the service
//! without requiring an external MQTT broker.

pub mod mocks;

pub use mocks::*;
