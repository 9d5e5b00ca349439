//! Observability for the bridge
//!
//! Structured logging, process-wide metrics and the health report served
//! next to the API.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{HealthCheck, HealthReport};
pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{command_span, mqtt_span, request_span};
