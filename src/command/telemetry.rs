//! Telemetry values forwarded to the telemetry topic

use super::is_present;
use crate::error::BridgeError;
use serde::Serialize;
use serde_json::Value;

/// A single sensor reading; published fire-and-forget
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Telemetry {
    pub node_id: Value,
    pub value_type: Value,
    pub value: Value,
}

impl Telemetry {
    /// Pick the reading out of a request body
    ///
    /// `node_id` and `value_type` must be truthy; `value` only has to exist.
    pub fn from_body(body: &Value) -> Result<Self, BridgeError> {
        let node_id = body.get("node_id");
        let value_type = body.get("value_type");

        match (node_id, value_type, body.get("value")) {
            (Some(node_id), Some(value_type), Some(value))
                if is_present(Some(node_id)) && is_present(Some(value_type)) =>
            {
                Ok(Self {
                    node_id: node_id.clone(),
                    value_type: value_type.clone(),
                    value: value.clone(),
                })
            }
            _ => Err(BridgeError::InvalidTelemetry),
        }
    }
}
