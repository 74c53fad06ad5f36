//! Service configuration
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then command line / `EVENTBUS_*` environment overrides, then validation.
//! The result is immutable and handed to components through a
//! [`tokio::sync::watch`] channel so each worker reads one snapshot per start.

use crate::routing::{join_topic, validate_topic};
use crate::transport::Endpoint;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Default file locations probed when no `--config` is given
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["service.toml", "config/service.toml"];

/// Receiving side of the configuration channel
pub type ConfigWatch = watch::Receiver<Arc<ServiceConfig>>;

/// Main service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    /// Service name (must match [a-zA-Z0-9._-]+)
    #[serde(default = "default_name")]
    pub name: String,
    /// Force debug-level logging
    #[serde(default)]
    pub debug: bool,
    /// Base topic for history messages
    #[serde(default = "default_history_topic")]
    pub history_topic: String,
    /// Seconds between publishes; zero or negative disables the publisher
    #[serde(default = "default_publish_interval")]
    pub publish_interval_secs: f64,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub shutdown: ShutdownSection,
}

fn default_name() -> String {
    "eventbus-service".to_string()
}

fn default_history_topic() -> String {
    "brewcast/history".to_string()
}

fn default_publish_interval() -> f64 {
    5.0
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            debug: false,
            history_topic: default_history_topic(),
            publish_interval_secs: default_publish_interval(),
            mqtt: MqttSection::default(),
            reconnect: ReconnectSection::default(),
            http: HttpSection::default(),
            shutdown: ShutdownSection::default(),
        }
    }
}

/// Transport security of the broker connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MqttProtocol {
    #[default]
    Mqtt,
    Mqtts,
}

/// MQTT section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttSection {
    pub protocol: MqttProtocol,
    pub host: String,
    pub port: u16,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    pub keep_alive_secs: u64,
    /// Upper bound for a single connect attempt, ConnAck included
    pub connect_timeout_secs: u64,
    /// Publishes queued while connecting; 0 turns the outbox off
    pub outbox_capacity: usize,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            protocol: MqttProtocol::Mqtt,
            host: "eventbus".to_string(),
            port: 1883,
            username_env: None,
            password_env: None,
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            outbox_capacity: 0,
        }
    }
}

/// Reconnection backoff settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSection {
    /// Retries after the first failed attempt (None = unlimited)
    pub max_retries: Option<u32>,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

/// HTTP listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpSection {
    pub host: String,
    pub port: u16,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShutdownSection {
    /// Time each worker gets to stop after cancellation
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 5,
        }
    }
}

/// Command line overrides, each also readable from the environment
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigOverrides {
    /// Service name
    #[arg(long, env = "EVENTBUS_NAME")]
    pub name: Option<String>,

    /// Force debug logging
    #[arg(long, env = "EVENTBUS_DEBUG")]
    pub debug: Option<bool>,

    /// Base topic for history messages
    #[arg(long, env = "EVENTBUS_HISTORY_TOPIC")]
    pub history_topic: Option<String>,

    /// Publish interval in seconds (0 disables publishing)
    #[arg(long, env = "EVENTBUS_PUBLISH_INTERVAL", allow_negative_numbers = true)]
    pub publish_interval: Option<f64>,

    /// Broker protocol
    #[arg(long, env = "EVENTBUS_MQTT_PROTOCOL", value_enum)]
    pub mqtt_protocol: Option<MqttProtocol>,

    /// Broker host
    #[arg(long, env = "EVENTBUS_MQTT_HOST")]
    pub mqtt_host: Option<String>,

    /// Broker port
    #[arg(long, env = "EVENTBUS_MQTT_PORT")]
    pub mqtt_port: Option<u16>,

    /// HTTP listen port
    #[arg(long, env = "EVENTBUS_HTTP_PORT")]
    pub http_port: Option<u16>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Invalid service name: {0}")]
    InvalidName(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ServiceConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ServiceConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or the first existing default location, or defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load_from_file(path);
        }

        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.exists())
            .map(|found| Self::load_from_file(&found))
            .unwrap_or_else(|| Ok(Self::default()))
    }

    /// Apply overrides and re-validate
    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        if let Some(name) = &overrides.name {
            self.name = name.clone();
        }
        if let Some(debug) = overrides.debug {
            self.debug = debug;
        }
        if let Some(history_topic) = &overrides.history_topic {
            self.history_topic = history_topic.clone();
        }
        if let Some(interval) = overrides.publish_interval {
            self.publish_interval_secs = interval;
        }
        if let Some(protocol) = overrides.mqtt_protocol {
            self.mqtt.protocol = protocol;
        }
        if let Some(host) = &overrides.mqtt_host {
            self.mqtt.host = host.clone();
        }
        if let Some(port) = overrides.mqtt_port {
            self.mqtt.port = port;
        }
        if let Some(port) = overrides.http_port {
            self.http.port = port;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_service_name(&self.name)?;

        validate_topic(&self.history_topic).map_err(|e| {
            ConfigError::InvalidConfig(format!("history_topic '{}': {e}", self.history_topic))
        })?;

        if self.publish_interval_secs.is_nan() {
            return Err(ConfigError::InvalidConfig(
                "publish_interval_secs must be a number".to_string(),
            ));
        }
        if self.publish_interval_secs > 0.0
            && Duration::try_from_secs_f64(self.publish_interval_secs).is_err()
        {
            return Err(ConfigError::InvalidConfig(format!(
                "publish_interval_secs {} is too large",
                self.publish_interval_secs
            )));
        }
        if self.mqtt.host.is_empty() {
            return Err(ConfigError::InvalidConfig("mqtt.host must not be empty".to_string()));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::InvalidConfig("mqtt.port must be non-zero".to_string()));
        }
        if self.reconnect.initial_backoff_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.initial_backoff_ms must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.max_backoff_ms < self.reconnect.initial_backoff_ms {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_backoff_ms must not be below reconnect.initial_backoff_ms"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Publish interval, or None when publishing is disabled or the value
    /// cannot be represented
    pub fn publish_interval(&self) -> Option<Duration> {
        if self.publish_interval_secs > 0.0 {
            Duration::try_from_secs_f64(self.publish_interval_secs).ok()
        } else {
            None
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown.drain_timeout_secs)
    }

    /// Topic this service publishes its history events on
    pub fn publish_topic(&self) -> String {
        join_topic(&self.history_topic, &self.name)
    }

    /// Pattern covering every history event on the bus
    pub fn history_pattern(&self) -> String {
        join_topic(&self.history_topic, "#")
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.mqtt.host.clone(),
            port: self.mqtt.port,
            tls: self.mqtt.protocol == MqttProtocol::Mqtts,
        }
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Wrap into a watch channel; the sender can swap snapshots in tests
    pub fn into_watch(self) -> (watch::Sender<Arc<ServiceConfig>>, ConfigWatch) {
        watch::channel(Arc::new(self))
    }
}

/// Validate service name format
pub fn validate_service_name(name: &str) -> Result<(), ConfigError> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if name.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidName(format!(
            "Service name '{name}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
