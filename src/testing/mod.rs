//! Testing utilities and mock implementations
//!
//! Lets the bridge be exercised end to end without an MQTT broker or TLS
//! material.

pub mod mocks;

pub use mocks::*;
