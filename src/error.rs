//! Error types for bridge operations
//!
//! Display strings are the user-facing messages returned in the HTTP
//! envelope, so they are phrased for API clients rather than operators.

use crate::command::CommandName;
use crate::transport::MqttError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Connect Fail: {0}")]
    ConnectFailed(#[source] MqttError),

    #[error("{}", no_connection_message(.disconnecting))]
    NoActiveConnection { disconnecting: bool },

    #[error("Already connected!")]
    AlreadyConnected,

    #[error("Subscribe Error: {0}")]
    SubscribeFailed(#[source] MqttError),

    #[error("Publish Error: {0}")]
    PublishFailed(#[source] MqttError),

    #[error("Disconnect Error: {0}")]
    DisconnectFailed(#[source] MqttError),

    #[error("Missing required fields: command_id, command_name.")]
    MissingRequiredFields,

    #[error("Invalid command_id: must be a string.")]
    InvalidCommandId,

    #[error("Invalid command_name.")]
    InvalidCommandName,

    #[error("Invalid type for command.")]
    InvalidCommandType,

    #[error("Invalid {0} payload.")]
    InvalidPayload(CommandName),

    #[error("Missing required fields: topic.")]
    MissingTopic,

    #[error("Request body must contain node_id, value_type, and value.")]
    InvalidTelemetry,

    #[error("Invalid JSON body: {0}")]
    InvalidBody(String),

    #[error("Failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl BridgeError {
    /// Publish/subscribe attempted without a live connection
    pub fn not_connected() -> Self {
        Self::NoActiveConnection {
            disconnecting: false,
        }
    }

    /// Disconnect requested without a live connection
    pub fn nothing_to_disconnect() -> Self {
        Self::NoActiveConnection {
            disconnecting: true,
        }
    }

    /// True for failures caused by the request content rather than the broker
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BridgeError::MissingRequiredFields
                | BridgeError::InvalidCommandId
                | BridgeError::InvalidCommandName
                | BridgeError::InvalidCommandType
                | BridgeError::InvalidPayload(_)
                | BridgeError::MissingTopic
                | BridgeError::InvalidTelemetry
                | BridgeError::InvalidBody(_)
        )
    }

    /// Message safe to hand back to API clients
    pub fn user_message(&self) -> String {
        sanitize_error_message(&strip_error_prefix(&self.to_string()))
    }
}

static ERROR_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|: )Error: ").expect("static regex"));

static SECRET_PAIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("static regex")
});

static CREDENTIAL_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|certs?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("static regex")
});

/// Remove `Error: ` wrappers that lead the message or one of its causes
///
/// Words that merely end in `Error: ` (as in `Publish Error: x`) are kept.
pub fn strip_error_prefix(message: &str) -> String {
    ERROR_PREFIX.replace_all(message, "${1}").into_owned()
}

/// Sanitize error messages to prevent sensitive data leakage
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PAIR.replace_all(message, "${1}=***").into_owned();

    sanitized = CREDENTIAL_PATH
        .replace_all(&sanitized, "/***REDACTED***/")
        .into_owned();

    // Truncate very long messages - ensure total length is <= 500
    const MAX_LEN: usize = 500;
    if sanitized.len() > MAX_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

fn no_connection_message(disconnecting: &bool) -> &'static str {
    if *disconnecting {
        "No connection to disconnect."
    } else {
        "No connection. Please connect first."
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
