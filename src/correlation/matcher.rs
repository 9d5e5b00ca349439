//! Content-based matching of command responses
//!
//! Responses carry no transport-level correlation id. A reply is accepted
//! when its `command_id` is one of the configured response ids, so two
//! commands in flight on the same reply topic can receive each other's
//! response.

use serde_json::Value;
use std::collections::HashSet;

/// How a single response wait ended
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// First message carried an allow-listed `command_id`
    Matched(Value),
    /// First message was valid JSON with another (or no) `command_id`
    Unmatched(Option<String>),
    /// First message was not JSON
    InvalidFormat,
    /// Nothing arrived before the deadline
    TimedOut,
    /// The connection went away while waiting
    ConnectionClosed,
}

impl Resolution {
    /// The response payload; every outcome but `Matched` yields nothing
    pub fn into_data(self) -> Option<Value> {
        match self {
            Resolution::Matched(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Matched(_) => "matched",
            Resolution::Unmatched(_) => "unmatched",
            Resolution::InvalidFormat => "invalid_format",
            Resolution::TimedOut => "timed_out",
            Resolution::ConnectionClosed => "connection_closed",
        }
    }
}

/// Allow-list of response command ids
#[derive(Debug, Clone)]
pub struct ResponseMatcher {
    response_ids: HashSet<String>,
}

impl ResponseMatcher {
    pub fn new<I, S>(response_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            response_ids: response_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn accepts(&self, command_id: &str) -> bool {
        self.response_ids.contains(command_id)
    }

    /// Decide the outcome for the first message seen on the reply topic
    pub fn classify(&self, payload: &[u8]) -> Resolution {
        let Ok(response) = serde_json::from_slice::<Value>(payload) else {
            return Resolution::InvalidFormat;
        };

        match response.get("command_id").and_then(Value::as_str) {
            Some(id) if self.accepts(id) => Resolution::Matched(response),
            id => Resolution::Unmatched(id.map(str::to_string)),
        }
    }
}
