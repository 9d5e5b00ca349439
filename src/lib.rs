//! IoT Bridge - HTTP to MQTT for AWS IoT Core
//!
//! A small HTTP service that holds one mutually-authenticated MQTT session
//! with AWS IoT Core and lets web clients drive it.
//!
//! # Overview
//!
//! - Connection lifecycle (connect, disconnect, subscribe) behind `POST /api/*`
//! - Telemetry publishing on the value topic, fire-and-forget
//! - Command publishing with response correlation: the bridge waits for the
//!   server's reply on the response topic and returns it when its
//!   `command_id` is on the allow-list
//! - Health and metrics endpoints for liveness checks and dashboards
//!
//! # Quick Start
//!
//! ```rust
//! use iotbridge::command::build_command;
//! use serde_json::json;
//!
//! let envelope = build_command(&json!({
//!     "command_id": "CMD00010",
//!     "command_name": "CONTROL_DEVICE",
//!     "device_type": "light",
//!     "node_id": "N1",
//!     "value": 1
//! }))
//! .unwrap();
//!
//! let wire = serde_json::to_value(&envelope).unwrap();
//! assert_eq!(wire["command_name"], "CONTROL_DEVICE");
//! assert_eq!(wire["node_id"], "N1");
//! ```

pub mod api;
pub mod bridge;
pub mod command;
pub mod config;
pub mod correlation;
pub mod error;
pub mod observability;
pub mod testing;
pub mod transport;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use correlation::{Correlator, Resolution};
pub use error::{BridgeError, BridgeResult};
pub use transport::{ConnectPolicy, ConnectionManager};
