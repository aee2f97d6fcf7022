//! Configuration loading — TOML file with environment variable overrides.
//!
//! Looks for `senses.toml` in the working directory (or the file named by
//! `SENSES_CONFIG`). Every field has a sensible default so the file is
//! optional. Environment variables take precedence over file values.

use std::time::Duration;

use senses_adapter_mqtt::MqttConfig;
use senses_app::discovery::DiscoveryConfig;
use senses_domain::automation::AutomationConfig;
use senses_domain::device::DeviceConfig;
use senses_domain::scene::SceneConfig;
use senses_domain::sun::Position;
use senses_domain::time::human_duration;
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection settings.
    pub mqtt: MqttConfig,
    /// Local identity and presence settings.
    pub discovery: DiscoveryConfig,
    /// Availability watcher settings.
    pub watcher: WatcherConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Home location for solar triggers and conditions.
    pub position: Position,
    /// Statically configured devices.
    pub devices: Vec<DeviceConfig>,
    /// Named scenes.
    pub scenes: Vec<SceneConfig>,
    /// Automation rules.
    pub automations: Vec<AutomationConfig>,
}

/// Availability watcher configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// How often keepalive timeouts are re-evaluated. Zero disables the watcher.
    #[serde(with = "human_duration")]
    pub interval: Duration,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

impl Config {
    /// Load configuration from `senses.toml` (if present) then apply
    /// environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but is malformed, or if the
    /// result fails validation.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("SENSES_CONFIG").unwrap_or_else(|_| "senses.toml".to_string());
        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SENSES_MQTT_HOST") {
            self.mqtt.host = val;
        }
        if let Ok(val) = std::env::var("SENSES_MQTT_PORT") {
            if let Ok(port) = val.parse() {
                self.mqtt.port = port;
            }
        }
        if let Ok(val) = std::env::var("SENSES_MQTT_CLIENT_ID") {
            self.mqtt.client_id = val;
        }
        if let Ok(val) = std::env::var("SENSES_UID") {
            self.discovery.uid = val;
        }
        if let Ok(val) = std::env::var("SENSES_LOG") {
            self.logging.filter = val;
        }
        if let Ok(val) = std::env::var("RUST_LOG") {
            self.logging.filter = val;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.port == 0 {
            return Err(ConfigError::Validation(
                "mqtt port must be non-zero".to_string(),
            ));
        }
        if self.mqtt.client_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "mqtt client_id must not be empty".to_string(),
            ));
        }
        if self.discovery.uid.trim().is_empty() {
            return Err(ConfigError::Validation(
                "discovery uid must not be empty".to_string(),
            ));
        }
        if !(-90.0..=90.0).contains(&self.position.lat) || !(-180.0..=180.0).contains(&self.position.lon) {
            return Err(ConfigError::Validation(format!(
                "position {},{} is outside latitude/longitude range",
                self.position.lat, self.position.lon
            )));
        }
        Ok(())
    }

    /// Return the `host:port` broker address.
    #[must_use]
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.mqtt.host, self.mqtt.port)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "sensesd=info,senses_app=info,senses_adapter_mqtt=info".to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}
