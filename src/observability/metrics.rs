//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! operational statistics across the broker connection, command correlation
//! and the HTTP API.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Upper bound on retained response-time samples
const MAX_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // MQTT metrics
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    disconnects: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    connection_start_time: AtomicU64,

    // Correlation metrics
    commands_published: AtomicU64,
    commands_rejected: AtomicU64,
    waits_started: AtomicU64,
    waits_pending: AtomicU64,
    responses_matched: AtomicU64,
    responses_unmatched: AtomicU64,
    responses_invalid: AtomicU64,
    responses_timed_out: AtomicU64,
    waits_aborted: AtomicU64,
    response_times: Mutex<Vec<u64>>, // in milliseconds

    // Per-route HTTP statistics
    route_stats: Mutex<HashMap<String, RouteStats>>,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            commands_published: AtomicU64::new(0),
            commands_rejected: AtomicU64::new(0),
            waits_started: AtomicU64::new(0),
            waits_pending: AtomicU64::new(0),
            responses_matched: AtomicU64::new(0),
            responses_unmatched: AtomicU64::new(0),
            responses_invalid: AtomicU64::new(0),
            responses_timed_out: AtomicU64::new(0),
            waits_aborted: AtomicU64::new(0),
            response_times: Mutex::new(Vec::new()),
            route_stats: Mutex::new(HashMap::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.set_mqtt_connected(true);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.set_mqtt_connected(false);
    }

    pub fn mqtt_disconnected(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        self.set_mqtt_connected(false);
    }

    /// Track the live session flag; the event loop flips it on CONNACK and drops
    pub fn set_mqtt_connected(&self, connected: bool) {
        let was_connected = self.mqtt_connected.swap(connected, Ordering::Relaxed);
        if connected && !was_connected {
            self.connection_start_time
                .store(current_timestamp(), Ordering::Relaxed);
        } else if !connected {
            self.connection_start_time.store(0, Ordering::Relaxed);
        }
    }

    pub fn mqtt_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    // Command and correlation metrics
    pub fn command_published(&self) {
        self.commands_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn wait_started(&self) {
        self.waits_started.fetch_add(1, Ordering::Relaxed);
        self.waits_pending.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_matched(&self, elapsed: Duration) {
        self.responses_matched.fetch_add(1, Ordering::Relaxed);
        self.wait_finished(elapsed);
    }

    pub fn response_unmatched(&self, elapsed: Duration) {
        self.responses_unmatched.fetch_add(1, Ordering::Relaxed);
        self.wait_finished(elapsed);
    }

    pub fn response_invalid(&self, elapsed: Duration) {
        self.responses_invalid.fetch_add(1, Ordering::Relaxed);
        self.wait_finished(elapsed);
    }

    pub fn response_timed_out(&self, elapsed: Duration) {
        self.responses_timed_out.fetch_add(1, Ordering::Relaxed);
        self.wait_finished(elapsed);
    }

    /// The connection closed underneath a waiter
    pub fn wait_aborted(&self, elapsed: Duration) {
        self.waits_aborted.fetch_add(1, Ordering::Relaxed);
        self.wait_finished(elapsed);
    }

    fn wait_finished(&self, elapsed: Duration) {
        // Saturate so a reset during an in-flight wait cannot wrap the gauge
        let _ = self
            .waits_pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });

        if let Ok(mut times) = self.response_times.lock() {
            times.push(elapsed.as_millis() as u64);
            if times.len() > MAX_SAMPLES {
                times.remove(0);
            }
        }
    }

    // HTTP metrics
    pub fn api_request(&self, route: &str, success: bool) {
        if let Ok(mut stats) = self.route_stats.lock() {
            let entry = stats
                .entry(route.to_string())
                .or_insert_with(|| RouteStats {
                    requests: 0,
                    failures: 0,
                });
            entry.requests += 1;
            if !success {
                entry.failures += 1;
            }
        }
    }

    pub fn pending_waits(&self) -> u64 {
        self.waits_pending.load(Ordering::Relaxed)
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.disconnects,
            &self.messages_published,
            &self.publish_failures,
            &self.messages_received,
            &self.connection_start_time,
            &self.commands_published,
            &self.commands_rejected,
            &self.waits_started,
            &self.waits_pending,
            &self.responses_matched,
            &self.responses_unmatched,
            &self.responses_invalid,
            &self.responses_timed_out,
            &self.waits_aborted,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);

        if let Ok(mut times) = self.response_times.lock() {
            times.clear();
        }
        if let Ok(mut stats) = self.route_stats.lock() {
            stats.clear();
        }
    }

    /// Calculate response time statistics (pure function)
    fn calculate_response_time_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.response_times.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted_times = times.clone();
        sorted_times.sort_unstable();

        let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
        (
            avg,
            percentile(&sorted_times, 50.0),
            percentile(&sorted_times, 95.0),
            percentile(&sorted_times, 99.0),
        )
    }

    /// Calculate connection duration (pure function)
    fn calculate_connection_duration(&self, now: u64) -> u64 {
        if !self.mqtt_connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95, p99) = self.calculate_response_time_statistics();
        let routes = self
            .route_stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default();

        MetricsSnapshot {
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                disconnects: self.disconnects.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            correlation: CorrelationMetrics {
                commands_published: self.commands_published.load(Ordering::Relaxed),
                commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
                waits_started: self.waits_started.load(Ordering::Relaxed),
                waits_pending: self.waits_pending.load(Ordering::Relaxed),
                responses_matched: self.responses_matched.load(Ordering::Relaxed),
                responses_unmatched: self.responses_unmatched.load(Ordering::Relaxed),
                responses_invalid: self.responses_invalid.load(Ordering::Relaxed),
                responses_timed_out: self.responses_timed_out.load(Ordering::Relaxed),
                waits_aborted: self.waits_aborted.load(Ordering::Relaxed),
                avg_wait_time_ms: avg,
                wait_time_p50_ms: p50,
                wait_time_p95_ms: p95,
                wait_time_p99_ms: p99,
            },
            routes,
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub mqtt: MqttMetrics,
    pub correlation: CorrelationMetrics,
    pub routes: HashMap<String, RouteStats>,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub disconnects: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct CorrelationMetrics {
    pub commands_published: u64,
    pub commands_rejected: u64,
    pub waits_started: u64,
    pub waits_pending: u64,
    pub responses_matched: u64,
    pub responses_unmatched: u64,
    pub responses_invalid: u64,
    pub responses_timed_out: u64,
    pub waits_aborted: u64,
    pub avg_wait_time_ms: f64,
    pub wait_time_p50_ms: f64,
    pub wait_time_p95_ms: f64,
    pub wait_time_p99_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteStats {
    pub requests: u64,
    pub failures: u64,
}

// Helper functions
pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
