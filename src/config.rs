//! Bridge configuration
//!
//! Configuration is read from a TOML file and then overlaid with the
//! environment variables used by existing deployments (`IOT_ENDPOINT`,
//! `CLIENT_ID`, `CA_CERT_PATH`, `CERT_PATH`, `PRIVATE_KEY_PATH`,
//! `AWS_REGION`, `PORT`). Without a file the bridge starts from defaults plus
//! the environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main bridge configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerSection,
    pub broker: BrokerSection,
    #[serde(default)]
    pub topics: TopicsSection,
    #[serde(default)]
    pub correlation: CorrelationSection,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

/// AWS IoT Core broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker endpoint: bare host, `host:port` or `mqtts://host:port`
    #[serde(default)]
    pub endpoint: String,
    /// Port used when the endpoint does not carry one
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// MQTT client identifier (must be allowed by the IoT policy)
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Root CA certificate (PEM)
    #[serde(default)]
    pub ca_path: PathBuf,
    /// Device certificate (PEM)
    #[serde(default)]
    pub cert_path: PathBuf,
    /// Device private key (PEM)
    #[serde(default)]
    pub key_path: PathBuf,
    /// AWS region, informational only
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Upper bound on waiting for CONNACK
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Fail a second connect instead of reusing the live connection
    #[serde(default)]
    pub reject_duplicate_connect: bool,
}

fn default_broker_port() -> u16 {
    8883
}

fn default_client_id() -> String {
    "iotbridge".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            port: default_broker_port(),
            client_id: default_client_id(),
            ca_path: PathBuf::new(),
            cert_path: PathBuf::new(),
            key_path: PathBuf::new(),
            region: None,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            reject_duplicate_connect: false,
        }
    }
}

impl BrokerSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Topic names used by the bridge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicsSection {
    /// Fire-and-forget sensor values
    #[serde(default = "default_telemetry_topic")]
    pub telemetry: String,
    /// Outbound commands; publishing here waits for a response
    #[serde(default = "default_command_topic")]
    pub command: String,
    /// Where command responses arrive
    #[serde(default = "default_response_topic")]
    pub response: String,
}

fn default_telemetry_topic() -> String {
    "value".to_string()
}

fn default_command_topic() -> String {
    "client_to_server".to_string()
}

fn default_response_topic() -> String {
    "server_to_client".to_string()
}

impl Default for TopicsSection {
    fn default() -> Self {
        Self {
            telemetry: default_telemetry_topic(),
            command: default_command_topic(),
            response: default_response_topic(),
        }
    }
}

impl TopicsSection {
    /// Inbound topics subscribed right after a connection is established
    pub fn auto_subscribe(&self) -> Vec<String> {
        vec![self.telemetry.clone(), self.command.clone()]
    }
}

/// Response correlation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrelationSection {
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Command ids accepted as replies (request `CMD00010` pairs with `CMD00011`)
    #[serde(default = "default_response_ids")]
    pub response_ids: Vec<String>,
}

fn default_response_timeout_ms() -> u64 {
    5000
}

fn default_response_ids() -> Vec<String> {
    vec![
        "CMD00011".to_string(),
        "CMD00021".to_string(),
        "CMD00031".to_string(),
    ]
}

impl Default for CorrelationSection {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout_ms(),
            response_ids: default_response_ids(),
        }
    }
}

impl CorrelationSection {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            broker: BrokerSection::default(),
            topics: TopicsSection::default(),
            correlation: CorrelationSection::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from TOML file, overlay the process environment and validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: BridgeConfig = toml::from_str(&content)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from defaults and the process environment only
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = BridgeConfig::default();
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from an environment lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(endpoint) = non_empty("IOT_ENDPOINT") {
            self.broker.endpoint = endpoint;
        }
        if let Some(client_id) = non_empty("CLIENT_ID") {
            self.broker.client_id = client_id;
        }
        if let Some(path) = non_empty("CA_CERT_PATH") {
            self.broker.ca_path = PathBuf::from(path);
        }
        if let Some(path) = non_empty("CERT_PATH") {
            self.broker.cert_path = PathBuf::from(path);
        }
        if let Some(path) = non_empty("PRIVATE_KEY_PATH") {
            self.broker.key_path = PathBuf::from(path);
        }
        if let Some(region) = non_empty("AWS_REGION") {
            self.broker.region = Some(region);
        }
        if let Some(port) = non_empty("PORT").and_then(|p| p.trim().parse().ok()) {
            self.server.port = port;
        }
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.endpoint.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker endpoint is required (set [broker].endpoint or IOT_ENDPOINT)".to_string(),
            ));
        }

        validate_client_id(&self.broker.client_id)?;

        if self.broker.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.correlation.response_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "response_timeout_ms must be greater than zero".to_string(),
            ));
        }

        for (name, topic) in [
            ("telemetry", &self.topics.telemetry),
            ("command", &self.topics.command),
            ("response", &self.topics.response),
        ] {
            if topic.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "topic '{name}' must not be empty"
                )));
            }
        }

        Ok(())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
endpoint = "example-ats.iot.ap-southeast-1.amazonaws.com"
client_id = "test-bridge"
ca_path = "certs/AmazonRootCA1.pem"
cert_path = "certs/device.pem.crt"
key_path = "certs/private.pem.key"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Persistent sessions need a stable, non-empty client id
fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    if client_id.is_empty() || client_id.chars().any(char::is_whitespace) {
        return Err(ConfigError::InvalidClientId(format!(
            "Client ID '{client_id}' must be non-empty and contain no whitespace"
        )));
    }
    Ok(())
}
