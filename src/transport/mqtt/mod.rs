//! rumqttc-backed broker link for AWS IoT Core
//!
//! The module separates pure functions from I/O operations:
//!
//! - [`connection`] - Connection state, TLS material and option building
//! - [`message_handler`] - Pure routing of polled rumqttc events
//! - [`client`] - The event loop task and the [`BrokerLink`](crate::transport::BrokerLink) implementation
//!
//! # Usage
//!
//! ```rust,no_run
//! use iotbridge::config::BrokerSection;
//! use iotbridge::transport::mqtt::MqttConnector;
//! use iotbridge::transport::Connector;
//!
//! # tokio_test::block_on(async {
//! let broker = BrokerSection {
//!     endpoint: "example-ats.iot.ap-southeast-1.amazonaws.com".to_string(),
//!     ..BrokerSection::default()
//! };
//!
//! let link = MqttConnector::new(broker).open().await?;
//! link.subscribe("server_to_client").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttConnector, MqttLink};
pub use connection::{ConnectionState, MqttError, ReconnectConfig, TlsMaterial};
pub use message_handler::{EventRoute, MessageHandler};
