//! MQTT adapter error types.

use senses_domain::error::SensesError;

/// Errors specific to the MQTT adapter.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// The rumqttc client rejected a request.
    #[error("MQTT client error")]
    Client(#[source] rumqttc::ClientError),

    /// The connection to the broker failed.
    #[error("MQTT connection error")]
    Connection(#[source] rumqttc::ConnectionError),

    /// An incoming payload was not valid UTF-8.
    #[error("MQTT payload on {topic:?} is not UTF-8")]
    InvalidPayload {
        topic: String,
        #[source]
        source: std::string::FromUtf8Error,
    },

    /// A domain-level error (validation, not-found, etc.).
    #[error("domain error")]
    Domain(#[source] SensesError),
}

impl MqttError {
    /// Convert into a [`SensesError::Bus`] for propagation across port
    /// boundaries.
    pub fn into_domain(self) -> SensesError {
        match self {
            Self::Domain(err) => err,
            other => SensesError::bus(other),
        }
    }
}

impl From<MqttError> for SensesError {
    fn from(err: MqttError) -> Self {
        err.into_domain()
    }
}
