//! HTTP API
//!
//! | Route | Purpose |
//! |---|---|
//! | `POST /api/connect` | open the shared broker connection |
//! | `POST /api/disconnect` | close it |
//! | `POST /api/subscribe` | subscribe to `{topic}` |
//! | `POST /api/value` | publish telemetry `{node_id, value_type, value}` |
//! | `POST /api/client_to_server` | publish a command and return its response |
//! | `GET /health` | connection health |
//! | `GET /metrics` | counters |
//!
//! Routes that read a body require a `Content-Length` header and cap the
//! body at 64 KiB. Chunked uploads without a length are answered with
//! `411 Length Required`; larger bodies with `413 Payload Too Large`.

pub mod handlers;
pub mod response;

pub use response::{handle_rejection, ApiResponse};

use crate::bridge::Bridge;
use std::sync::Arc;
use warp::{Filter, Rejection, Reply};

/// Largest request body accepted by the API
const MAX_BODY_BYTES: u64 = 64 * 1024;

fn with_bridge(
    bridge: Arc<Bridge>,
) -> impl Filter<Extract = (Arc<Bridge>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || bridge.clone())
}

/// The request body, bounded before any of it is buffered
fn raw_body() -> impl Filter<Extract = (bytes::Bytes,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::bytes())
}

/// All routes, with rejections rendered as API envelopes
pub fn routes(
    bridge: Arc<Bridge>,
) -> impl Filter<Extract = (impl Reply,), Error = std::convert::Infallible> + Clone {
    let connect = warp::path!("api" / "connect")
        .and(warp::post())
        .and(with_bridge(bridge.clone()))
        .and_then(handlers::connect);

    let disconnect = warp::path!("api" / "disconnect")
        .and(warp::post())
        .and(with_bridge(bridge.clone()))
        .and_then(handlers::disconnect);

    let subscribe = warp::path!("api" / "subscribe")
        .and(warp::post())
        .and(with_bridge(bridge.clone()))
        .and(raw_body())
        .and_then(handlers::subscribe);

    let value = warp::path!("api" / "value")
        .and(warp::post())
        .and(with_bridge(bridge.clone()))
        .and(raw_body())
        .and_then(handlers::publish_value);

    let command = warp::path!("api" / "client_to_server")
        .and(warp::post())
        .and(with_bridge(bridge.clone()))
        .and(raw_body())
        .and_then(handlers::publish_command);

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_bridge(bridge))
        .and_then(handlers::health);

    let metrics = warp::path!("metrics")
        .and(warp::get())
        .and_then(handlers::metrics_snapshot);

    connect
        .or(disconnect)
        .or(subscribe)
        .or(value)
        .or(command)
        .or(health)
        .or(metrics)
        .with(
            warp::cors()
                .allow_any_origin()
                .allow_methods(vec!["GET", "POST", "OPTIONS"])
                .allow_headers(vec!["content-type"]),
        )
        .recover(handle_rejection)
}
