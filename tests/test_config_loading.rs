//! Configuration loading and validation tests
//!
//! Tests focus on the observable outcome of loading a file, overlaying the
//! environment and validating the result.

use iotbridge::config::{BridgeConfig, ConfigError};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[server]
host = "127.0.0.1"
port = 8080

[broker]
endpoint = "example-ats.iot.ap-southeast-1.amazonaws.com"
client_id = "gateway-01"
ca_path = "certs/AmazonRootCA1.pem"
cert_path = "certs/device.pem.crt"
key_path = "certs/private.pem.key"
region = "ap-southeast-1"

[topics]
telemetry = "home/value"
command = "home/commands"
response = "home/responses"

[correlation]
response_timeout_ms = 1500
response_ids = ["ACK"]
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.broker.client_id, "gateway-01");
    assert_eq!(config.topics.command, "home/commands");
    assert_eq!(
        config.topics.auto_subscribe(),
        vec!["home/value".to_string(), "home/commands".to_string()]
    );
    assert_eq!(
        config.correlation.response_timeout(),
        Duration::from_millis(1500)
    );
    assert_eq!(config.correlation.response_ids, vec!["ACK".to_string()]);
}

#[test]
fn test_config_applies_defaults() {
    let temp_file = write_config(
        r#"
[broker]
endpoint = "example-ats.iot.ap-southeast-1.amazonaws.com"
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.broker.port, 8883);
    assert_eq!(config.broker.keep_alive_secs, 30);
    assert!(!config.broker.reject_duplicate_connect);
    assert_eq!(config.topics.telemetry, "value");
    assert_eq!(config.topics.command, "client_to_server");
    assert_eq!(config.topics.response, "server_to_client");
    assert_eq!(config.correlation.response_timeout_ms, 5000);
    assert_eq!(
        config.correlation.response_ids,
        vec!["CMD00011", "CMD00021", "CMD00031"]
    );
}

#[test]
fn test_missing_file_is_reported() {
    let result = BridgeConfig::load_from_file(&PathBuf::from("/nonexistent/iotbridge.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_reported() {
    let temp_file = write_config("[broker\nendpoint = ");
    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_environment_overrides_file_values() {
    let mut config = BridgeConfig::default();
    config.broker.endpoint = "from-file.iot.amazonaws.com".to_string();

    config.apply_env_overrides(env(&[
        ("IOT_ENDPOINT", "from-env-ats.iot.eu-west-1.amazonaws.com"),
        ("CLIENT_ID", "env-client"),
        ("CA_CERT_PATH", "/etc/iot/ca.pem"),
        ("CERT_PATH", "/etc/iot/cert.pem"),
        ("PRIVATE_KEY_PATH", "/etc/iot/key.pem"),
        ("AWS_REGION", "eu-west-1"),
        ("PORT", "4000"),
    ]));

    assert_eq!(
        config.broker.endpoint,
        "from-env-ats.iot.eu-west-1.amazonaws.com"
    );
    assert_eq!(config.broker.client_id, "env-client");
    assert_eq!(config.broker.ca_path, PathBuf::from("/etc/iot/ca.pem"));
    assert_eq!(config.broker.cert_path, PathBuf::from("/etc/iot/cert.pem"));
    assert_eq!(config.broker.key_path, PathBuf::from("/etc/iot/key.pem"));
    assert_eq!(config.broker.region.as_deref(), Some("eu-west-1"));
    assert_eq!(config.server.port, 4000);
    assert!(config.validate().is_ok());
}

#[test]
fn test_blank_or_invalid_environment_values_are_ignored() {
    let mut config = BridgeConfig::default();
    config.broker.endpoint = "from-file.iot.amazonaws.com".to_string();

    config.apply_env_overrides(env(&[("IOT_ENDPOINT", "  "), ("PORT", "not-a-port")]));

    assert_eq!(config.broker.endpoint, "from-file.iot.amazonaws.com");
    assert_eq!(config.server.port, 3000);
}

#[test]
fn test_validation_requires_endpoint() {
    let config = BridgeConfig::default();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidConfig(message)) if message.contains("endpoint")
    ));
}

#[test]
fn test_validation_rejects_bad_values() {
    let mut base = BridgeConfig::default();
    base.broker.endpoint = "example-ats.iot.ap-southeast-1.amazonaws.com".to_string();
    assert!(base.validate().is_ok());

    let mut config = base.clone();
    config.broker.client_id = "has space".to_string();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidClientId(_))
    ));

    let mut config = base.clone();
    config.correlation.response_timeout_ms = 0;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidConfig(_))
    ));

    let mut config = base.clone();
    config.topics.response = String::new();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidConfig(message)) if message.contains("response")
    ));
}

#[test]
fn test_config_round_trips_through_toml() {
    let mut config = BridgeConfig::default();
    config.broker.endpoint = "example-ats.iot.ap-southeast-1.amazonaws.com".to_string();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let parsed: BridgeConfig = toml::from_str(&rendered).unwrap();

    assert_eq!(parsed, config);
}
