//! Transport layer for the broker connection
//!
//! This module provides the transport abstraction the rest of the bridge is
//! written against, the rumqttc-backed implementation, and the
//! [`ConnectionManager`] that owns the single shared connection.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;

pub mod manager;
pub mod mqtt;

pub use manager::{ConnectPolicy, ConnectionManager};
pub use mqtt::{ConnectionState, MqttError};

/// A message delivered by the broker on any subscribed topic
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
            received_at: Utc::now(),
        }
    }
}

/// An established broker connection
///
/// Every call goes over the same session; implementations must be usable
/// from many tasks at once.
#[async_trait::async_trait]
pub trait BrokerLink: Send + Sync {
    /// Publish with at-least-once delivery
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError>;

    /// Subscribe with at-least-once delivery
    async fn subscribe(&self, topic: &str) -> Result<(), MqttError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError>;

    /// Close the session
    async fn disconnect(&self) -> Result<(), MqttError>;

    /// A fresh receiver for every message arriving after this call
    fn messages(&self) -> broadcast::Receiver<InboundMessage>;

    fn state(&self) -> ConnectionState;
}

/// Opens broker connections
///
/// Split from [`BrokerLink`] so the manager can be driven by a test double.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection; resolves once the broker accepted the session
    async fn open(&self) -> Result<Arc<dyn BrokerLink>, MqttError>;
}
