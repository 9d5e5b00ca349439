//! Health reporting for container orchestration
//!
//! The bridge is healthy while its broker session is up. The report is
//! served by `GET /health` from the API layer.

use crate::observability::metrics::{current_timestamp, metrics};
use crate::transport::ConnectionState;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

/// Body of `GET /health`
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub connection: String,
    pub client_id: String,
    pub uptime_seconds: u64,
    pub timestamp: u64,
    pub checks: HashMap<String, HealthCheck>,
}

impl HealthReport {
    /// Build a report for the given connection state (pure apart from the clock)
    pub fn evaluate(client_id: &str, state: &ConnectionState) -> Self {
        let now = current_timestamp();
        let snapshot = metrics().get_metrics();

        let mut checks = HashMap::new();
        checks.insert("mqtt".to_string(), check_mqtt_health(state, now));
        checks.insert(
            "correlation".to_string(),
            HealthCheck {
                status: "healthy".to_string(),
                message: Some(format!(
                    "{} command(s) awaiting a response",
                    snapshot.correlation.waits_pending
                )),
                last_check: now,
            },
        );

        let overall_healthy = checks.values().all(|check| check.status == "healthy");

        Self {
            status: if overall_healthy { "healthy" } else { "degraded" }.to_string(),
            connection: state.as_str().to_string(),
            client_id: client_id.to_string(),
            uptime_seconds: snapshot.uptime_seconds,
            timestamp: now,
            checks,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

fn check_mqtt_health(state: &ConnectionState, now: u64) -> HealthCheck {
    let (status, message) = match state {
        ConnectionState::Connected => ("healthy", "MQTT connection established".to_string()),
        ConnectionState::Connecting => ("unhealthy", "MQTT handshake in progress".to_string()),
        ConnectionState::Reconnecting(attempt) => (
            "unhealthy",
            format!("MQTT session lost, reconnect attempt {attempt}"),
        ),
        ConnectionState::Disconnected => ("unhealthy", "No MQTT connection".to_string()),
    };

    HealthCheck {
        status: status.to_string(),
        message: Some(message),
        last_check: now,
    }
}
