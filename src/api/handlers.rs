//! Request handlers
//!
//! Each handler maps one route onto one [`Bridge`] call and formats the
//! outcome; validation lives in the command builders.

use super::response::{parse_body, ApiResponse};
use crate::bridge::Bridge;
use crate::error::BridgeError;
use crate::observability::{metrics, MetricsSnapshot};
use crate::request_span;
use bytes::Bytes;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{warn, Instrument};
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};

type Reply = Result<WithStatus<Json>, Infallible>;

/// Record and format the outcome of one API call
fn respond(route: &'static str, outcome: Result<ApiResponse, BridgeError>) -> WithStatus<Json> {
    metrics().api_request(route, outcome.is_ok());
    match outcome {
        Ok(response) => response.into_reply(),
        Err(e) => {
            if e.is_validation() {
                metrics().command_rejected();
            }
            warn!(route, "{}", e);
            ApiResponse::from_error(&e).into_reply()
        }
    }
}

pub async fn connect(bridge: Arc<Bridge>) -> Reply {
    let outcome = async {
        bridge.connect().await?;
        Ok::<_, BridgeError>(ApiResponse::success("Connected to AWS IoT successfully", None))
    }
    .instrument(request_span!(route = "connect"))
    .await;

    Ok(respond("connect", outcome))
}

pub async fn disconnect(bridge: Arc<Bridge>) -> Reply {
    let outcome = async {
        bridge.disconnect().await?;
        Ok::<_, BridgeError>(ApiResponse::success(
            "Disconnected from AWS IoT successfully",
            None,
        ))
    }
    .instrument(request_span!(route = "disconnect"))
    .await;

    Ok(respond("disconnect", outcome))
}

pub async fn subscribe(bridge: Arc<Bridge>, body: Bytes) -> Reply {
    let outcome = async {
        let body = parse_body(&body)?;
        let topic = bridge
            .subscribe(body.get("topic").and_then(Value::as_str))
            .await?;
        Ok::<_, BridgeError>(ApiResponse::success(
            format!("Subscribed to topic: {topic}"),
            None,
        ))
    }
    .instrument(request_span!(route = "subscribe"))
    .await;

    Ok(respond("subscribe", outcome))
}

pub async fn publish_value(bridge: Arc<Bridge>, body: Bytes) -> Reply {
    let outcome = async {
        let body = parse_body(&body)?;
        bridge.publish_telemetry(&body).await?;
        Ok::<_, BridgeError>(ApiResponse::success(
            format!("Message published to topic: {}", bridge.topics().telemetry),
            None,
        ))
    }
    .instrument(request_span!(route = "value"))
    .await;

    Ok(respond("value", outcome))
}

pub async fn publish_command(bridge: Arc<Bridge>, body: Bytes) -> Reply {
    let outcome = async {
        let body = parse_body(&body)?;
        let response = bridge.send_command(&body).await?;
        Ok::<_, BridgeError>(ApiResponse::success(
            format!("Message published to topic: {}", bridge.topics().command),
            response,
        ))
    }
    .instrument(request_span!(route = "client_to_server"))
    .await;

    Ok(respond("client_to_server", outcome))
}

/// `GET /health`: 200 while the broker session is up, 503 otherwise
pub async fn health(bridge: Arc<Bridge>) -> Reply {
    let report = bridge.health().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(warp::reply::with_status(warp::reply::json(&report), status))
}

/// `GET /metrics`: process-wide counters
pub async fn metrics_snapshot() -> Result<Json, Infallible> {
    let snapshot: MetricsSnapshot = metrics().get_metrics();
    Ok(warp::reply::json(&snapshot))
}
