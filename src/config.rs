//! Agent configuration loaded from TOML
//!
//! Only `[device]` is mandatory; every other section falls back to defaults.
//! The access token may be given inline or through an environment variable,
//! which is resolved when the session options are built.

use crate::session::ReconnectConfig;
use crate::telemetry::PublisherSettings;
use crate::transport::mqtt::parse_broker_url;
use crate::transport::{Credentials, QoS, SessionOptions};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Config files tried when no path is given
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["tbagent.toml", "config/tbagent.toml"];

/// Main agent configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub rpc: RpcSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub health: HealthSection,
}

/// Broker connection and device identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// `mqtt://host[:port]` or `mqtts://host[:port]`
    pub broker_url: String,
    /// Device access token, sent as the MQTT username
    pub access_token: Option<String>,
    /// Environment variable holding the access token
    pub access_token_env: Option<String>,
    /// MQTT client id, generated when absent
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySection {
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    #[serde(default)]
    pub include_timestamp: bool,
    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<String>,
    /// Values merged under every submission, in publish order
    #[serde(default = "default_field_values")]
    pub defaults: Map<String, Value>,
}

fn default_qos() -> u8 {
    1
}

fn default_ack_timeout_secs() -> u64 {
    10
}

fn default_required_fields() -> Vec<String> {
    vec![
        "temperature".to_string(),
        "humidity".to_string(),
        "pressure".to_string(),
    ]
}

fn default_field_values() -> Map<String, Value> {
    let mut defaults = Map::new();
    defaults.insert("temperature".to_string(), Value::from(24.5));
    defaults.insert("humidity".to_string(), Value::from(45.0));
    defaults.insert("pressure".to_string(), Value::from(1012.0));
    defaults
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            qos: default_qos(),
            ack_timeout_secs: default_ack_timeout_secs(),
            include_timestamp: false,
            required_fields: default_required_fields(),
            defaults: default_field_values(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcSection {
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
    /// Inbound request queue between the session and the dispatcher
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_handler_timeout_ms() -> u64 {
    5000
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            handler_timeout_ms: default_handler_timeout_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

fn default_health_port() -> u16 {
    8080
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_health_port(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("No configuration file found (tried {0})")]
    NotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Load configuration from TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// First existing file among [`DEFAULT_CONFIG_PATHS`]
    pub fn find_default_file() -> Result<PathBuf, ConfigError> {
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_file())
            .ok_or_else(|| ConfigError::NotFound(DEFAULT_CONFIG_PATHS.join(", ")))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_broker_url(&self.device.broker_url)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        if self.device.access_token.is_none() && self.device.access_token_env.is_none() {
            return Err(ConfigError::InvalidConfig(
                "[device] needs access_token or access_token_env".to_string(),
            ));
        }
        if let Some(client_id) = &self.device.client_id {
            if client_id.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "client_id must not be empty".to_string(),
                ));
            }
        }
        if self.device.keep_alive_secs == 0 || self.device.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "keep_alive_secs and connect_timeout_secs must be greater than zero".to_string(),
            ));
        }

        QoS::try_from(self.telemetry.qos).map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        if self.telemetry.ack_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "telemetry.ack_timeout_secs must be greater than zero".to_string(),
            ));
        }
        for (name, value) in &self.telemetry.defaults {
            let finite = value.as_f64().is_some_and(f64::is_finite);
            if name.is_empty() || !finite {
                return Err(ConfigError::InvalidConfig(format!(
                    "telemetry default '{name}' must be a finite number"
                )));
            }
        }

        if self.rpc.handler_timeout_ms == 0 || self.rpc.queue_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "rpc.handler_timeout_ms and rpc.queue_capacity must be greater than zero"
                    .to_string(),
            ));
        }

        self.reconnect_config()
            .validate()
            .map_err(ConfigError::InvalidConfig)?;

        Ok(())
    }

    /// Access token, inline value first, then the environment variable
    pub fn access_token(&self) -> Result<String, ConfigError> {
        if let Some(token) = &self.device.access_token {
            return Ok(token.clone());
        }
        match &self.device.access_token_env {
            Some(name) => {
                std::env::var(name).map_err(|_| ConfigError::EnvVarNotFound(name.clone()))
            }
            None => Err(ConfigError::InvalidConfig(
                "no access token configured".to_string(),
            )),
        }
    }

    /// Session options with the access token resolved
    pub fn session_options(&self) -> Result<SessionOptions, ConfigError> {
        let endpoint = parse_broker_url(&self.device.broker_url)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        let mut options = SessionOptions::new(endpoint.host, endpoint.port);
        options.tls = endpoint.tls;
        options.credentials = Some(Credentials::access_token(self.access_token()?));
        options.keep_alive = Duration::from_secs(self.device.keep_alive_secs);
        options.connect_timeout = Duration::from_secs(self.device.connect_timeout_secs);
        if let Some(client_id) = &self.device.client_id {
            options.client_id = client_id.clone();
        }
        Ok(options)
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            jitter: self.reconnect.jitter,
        }
    }

    pub fn publisher_settings(&self) -> PublisherSettings {
        PublisherSettings {
            required_fields: self.telemetry.required_fields.clone(),
            ack_timeout: Duration::from_secs(self.telemetry.ack_timeout_secs),
            include_timestamp: self.telemetry.include_timestamp,
        }
    }

    /// Telemetry QoS; validated at load time
    pub fn telemetry_qos(&self) -> QoS {
        QoS::try_from(self.telemetry.qos).unwrap_or(QoS::AtLeastOnce)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.handler_timeout_ms)
    }

    /// Copy with the inline token masked, for display
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.device.access_token.is_some() {
            config.device.access_token = Some("***".to_string());
        }
        config
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
broker_url = "mqtt://localhost:1883"
access_token = "test-token"
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = AgentConfig::test_config();

        assert_eq!(config.device.keep_alive_secs, 60);
        assert_eq!(config.device.connect_timeout_secs, 10);
        assert_eq!(config.telemetry.qos, 1);
        assert_eq!(config.telemetry.ack_timeout_secs, 10);
        assert_eq!(config.rpc.handler_timeout_ms, 5000);
        assert_eq!(config.reconnect.base_delay_ms, 1000);
        assert_eq!(config.reconnect.max_delay_ms, 60_000);
        assert!(config.reconnect.jitter);
        assert!(!config.health.enabled);

        let keys: Vec<&String> = config.telemetry.defaults.keys().collect();
        assert_eq!(keys, vec!["temperature", "humidity", "pressure"]);
    }

    #[test]
    fn test_session_options_from_config() {
        let config = AgentConfig::from_toml_str(
            r#"
[device]
broker_url = "mqtts://demo.thingsboard.io"
access_token = "sfayhp1be225522tkrx8"
client_id = "panel-01"
"#,
        )
        .unwrap();

        let options = config.session_options().unwrap();
        assert_eq!(options.host, "demo.thingsboard.io");
        assert_eq!(options.port, 8883);
        assert!(options.tls);
        assert_eq!(options.client_id, "panel-01");
        assert_eq!(
            options.credentials.unwrap().username,
            "sfayhp1be225522tkrx8"
        );
    }

    #[test]
    fn test_missing_env_token() {
        let config = AgentConfig::from_toml_str(
            r#"
[device]
broker_url = "mqtt://localhost"
access_token_env = "TBAGENT_TEST_TOKEN_THAT_IS_NOT_SET"
"#,
        )
        .unwrap();

        assert!(matches!(
            config.session_options(),
            Err(ConfigError::EnvVarNotFound(name)) if name == "TBAGENT_TEST_TOKEN_THAT_IS_NOT_SET"
        ));
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            r#"
[device]
broker_url = "http://localhost"
access_token = "t"
"#,
            r#"
[device]
broker_url = "mqtt://localhost"
"#,
            r#"
[device]
broker_url = "mqtt://localhost"
access_token = "t"
[telemetry]
qos = 3
"#,
            r#"
[device]
broker_url = "mqtt://localhost"
access_token = "t"
[reconnect]
base_delay_ms = 5000
max_delay_ms = 1000
"#,
            r#"
[device]
broker_url = "mqtt://localhost"
access_token = "t"
[telemetry.defaults]
temperature = "warm"
"#,
        ];

        for case in cases {
            assert!(
                matches!(
                    AgentConfig::from_toml_str(case),
                    Err(ConfigError::InvalidConfig(_))
                ),
                "expected validation failure for {case}"
            );
        }
    }

    #[test]
    fn test_redacted_hides_token() {
        let config = AgentConfig::test_config().redacted();
        assert_eq!(config.device.access_token.as_deref(), Some("***"));
    }
}
