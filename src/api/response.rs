//! JSON envelope shared by every API reply

use crate::error::BridgeError;
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use std::convert::Infallible;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::Rejection;

/// `{status, message, data}` as returned by every `/api` route
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub status: bool,
    pub message: String,
    pub data: Value,
}

impl ApiResponse {
    pub fn success(message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            status: true,
            message: message.into(),
            data: data.unwrap_or(Value::Null),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: false,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn from_error(error: &BridgeError) -> Self {
        Self::failure(error.user_message())
    }

    pub fn with_status(self, status: StatusCode) -> WithStatus<Json> {
        warp::reply::with_status(warp::reply::json(&self), status)
    }

    /// 200 for success, 400 for every failure
    pub fn into_reply(self) -> WithStatus<Json> {
        let status = if self.status {
            StatusCode::OK
        } else {
            StatusCode::BAD_REQUEST
        };
        self.with_status(status)
    }
}

/// Parse a request body leniently: an empty body is an empty object
pub fn parse_body(body: &Bytes) -> Result<Value, BridgeError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_slice(body).map_err(|e| BridgeError::InvalidBody(e.to_string()))
}

/// Turn warp rejections into the same envelope the handlers use
pub async fn handle_rejection(rejection: Rejection) -> Result<WithStatus<Json>, Infallible> {
    let (status, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "Route not found.".to_string())
    } else if rejection
        .find::<warp::reject::PayloadTooLarge>()
        .is_some()
    {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            "Request body too large.".to_string(),
        )
    } else if rejection.find::<warp::reject::LengthRequired>().is_some() {
        (
            StatusCode::LENGTH_REQUIRED,
            "Content-Length header required.".to_string(),
        )
    } else if rejection
        .find::<warp::reject::MethodNotAllowed>()
        .is_some()
    {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed.".to_string(),
        )
    } else {
        tracing::warn!("Unhandled rejection: {:?}", rejection);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "An unexpected error occurred.".to_string(),
        )
    };

    Ok(ApiResponse::failure(message).with_status(status))
}
