//! Pure connection state management for the broker link
//!
//! This module contains connection state, error types, TLS material loading
//! and the translation of the `[broker]` configuration into rumqttc options.

use crate::config::BrokerSection;
use rumqttc::{MqttOptions, Transport as RumqttcTransport};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// ALPN protocol AWS IoT Core requires for MQTT over port 443
pub const AWS_IOT_ALPN: &[u8] = b"x-amzn-mqtt-ca";

/// AWS IoT Core rejects payloads above 128 KiB
const MAX_PACKET_SIZE: usize = 128 * 1024;

/// Connection state of the shared broker link
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No link, or the link was closed
    Disconnected,
    /// Waiting for the broker's CONNACK
    Connecting,
    /// CONNACK received, publish/subscribe allowed
    Connected,
    /// Session dropped, event loop is restoring it (attempt count)
    Reconnecting(u32),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting(_) => "reconnecting",
        }
    }

    pub fn can_publish(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Backoff applied while an established session is being restored
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delays in milliseconds for the first attempts
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    /// Calculate backoff delay for given attempt using the pattern
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = (attempt.saturating_sub(1)) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Broker transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("failed to read {kind} from {path}: {source}")]
    TlsMaterial {
        kind: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid broker endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("{0}")]
    ConnectionFailed(String),
    #[error("no CONNACK received within {0:?}")]
    ConnAckTimeout(Duration),
    #[error("{0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
}

/// PEM material for mutual TLS
#[derive(Clone)]
pub struct TlsMaterial {
    pub ca: Vec<u8>,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca", &format_args!("{} bytes", self.ca.len()))
            .field("cert", &format_args!("{} bytes", self.cert.len()))
            .field("key", &"<redacted>")
            .finish()
    }
}

impl TlsMaterial {
    /// Read CA, device certificate and private key from the configured paths
    pub fn load(broker: &BrokerSection) -> Result<Self, MqttError> {
        Ok(Self {
            ca: read_material("CA certificate", &broker.ca_path)?,
            cert: read_material("client certificate", &broker.cert_path)?,
            key: read_material("private key", &broker.key_path)?,
        })
    }
}

fn read_material(kind: &'static str, path: &Path) -> Result<Vec<u8>, MqttError> {
    std::fs::read(path).map_err(|source| MqttError::TlsMaterial {
        kind,
        path: path.to_path_buf(),
        source,
    })
}

/// Split a configured endpoint into host and port
///
/// Accepts `host`, `host:port` and `scheme://host[:port]`.
pub fn parse_endpoint(endpoint: &str, default_port: u16) -> Result<(String, u16), MqttError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(MqttError::InvalidEndpoint("endpoint is empty".to_string()));
    }

    if endpoint.contains("://") {
        let url =
            Url::parse(endpoint).map_err(|_| MqttError::InvalidEndpoint(endpoint.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| MqttError::InvalidEndpoint(endpoint.to_string()))?;
        return Ok((host.to_string(), url.port().unwrap_or(default_port)));
    }

    match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| MqttError::InvalidEndpoint(endpoint.to_string()))?;
            if host.is_empty() {
                return Err(MqttError::InvalidEndpoint(endpoint.to_string()));
            }
            Ok((host.to_string(), port))
        }
        None => Ok((endpoint.to_string(), default_port)),
    }
}

/// Pure function to configure MQTT options from config and loaded TLS material
pub fn configure_mqtt_options(
    broker: &BrokerSection,
    tls: TlsMaterial,
) -> Result<MqttOptions, MqttError> {
    let (host, port) = parse_endpoint(&broker.endpoint, broker.port)?;

    let mut mqtt_options = MqttOptions::new(broker.client_id.clone(), host, port);

    // rumqttc refuses keep alives below 5 seconds
    mqtt_options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs.max(5)));

    // Persistent session: the broker keeps subscriptions and queued QoS 1 messages
    mqtt_options.set_clean_session(false);
    mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    let alpn = (port == 443).then(|| vec![AWS_IOT_ALPN.to_vec()]);
    let transport = RumqttcTransport::tls(tls.ca, Some((tls.cert, tls.key)), alpn);
    mqtt_options.set_transport(transport);

    Ok(mqtt_options)
}
