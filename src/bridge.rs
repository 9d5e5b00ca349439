//! The bridge service handed to every HTTP handler
//!
//! One [`Bridge`] is built in `main` and shared behind an `Arc`. It owns the
//! single [`ConnectionManager`] and the [`Correlator`] layered on it.

use crate::command::{build_command, Telemetry};
use crate::config::{BridgeConfig, TopicsSection};
use crate::correlation::Correlator;
use crate::error::BridgeError;
use crate::observability::HealthReport;
use crate::transport::{ConnectPolicy, ConnectionManager, Connector};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub struct Bridge {
    connections: Arc<ConnectionManager>,
    correlator: Correlator,
    topics: TopicsSection,
    client_id: String,
}

impl Bridge {
    pub fn new(config: &BridgeConfig, connector: Arc<dyn Connector>) -> Self {
        let connections = Arc::new(ConnectionManager::new(
            connector,
            config.topics.auto_subscribe(),
            ConnectPolicy::from_config(config.broker.reject_duplicate_connect),
        ));
        let correlator = Correlator::new(connections.clone(), &config.topics, &config.correlation);

        Self {
            connections,
            correlator,
            topics: config.topics.clone(),
            client_id: config.broker.client_id.clone(),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn topics(&self) -> &TopicsSection {
        &self.topics
    }

    pub async fn connect(&self) -> Result<(), BridgeError> {
        self.connections.connect().await.map(|_| ())
    }

    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        self.connections.disconnect().await
    }

    /// Subscribe the live connection to a caller-chosen topic
    ///
    /// The topic is pinned, so commands that reply on it never unsubscribe it.
    pub async fn subscribe(&self, topic: Option<&str>) -> Result<String, BridgeError> {
        let topic = topic
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(BridgeError::MissingTopic)?;

        let link = self.connections.subscribe(topic).await?;
        self.correlator.subscriptions().pin(&link, topic).await;
        Ok(topic.to_string())
    }

    /// Forward a telemetry reading; never waits for a reply
    pub async fn publish_telemetry(&self, body: &Value) -> Result<(), BridgeError> {
        let telemetry = Telemetry::from_body(body)?;
        self.correlator
            .publish(&self.topics.telemetry, &telemetry)
            .await?;
        Ok(())
    }

    /// Validate and publish a command, returning the correlated response
    pub async fn send_command(&self, body: &Value) -> Result<Option<Value>, BridgeError> {
        let envelope = build_command(body)?;
        debug!(
            command_id = %envelope.command_id,
            command_name = %envelope.command_name,
            "Command validated"
        );

        self.correlator
            .publish(&self.topics.command, &envelope)
            .await
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport::evaluate(&self.client_id, &self.connections.state().await)
    }
}
