//! MQTT connection configuration.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the MQTT connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// MQTT broker hostname or IP address.
    pub host: String,
    /// MQTT broker port.
    pub port: u16,
    /// MQTT client identifier.
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u16,
    /// Capacity of the request and inbound queues. Inbound messages beyond
    /// it are dropped while the hub lags behind.
    pub capacity: usize,
    /// Pause before polling again after a connection error, in milliseconds.
    pub reconnect_delay_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "senses".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            capacity: 64,
            reconnect_delay_ms: 2000,
        }
    }
}

impl MqttConfig {
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keep_alive_secs.max(1)))
    }

    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
