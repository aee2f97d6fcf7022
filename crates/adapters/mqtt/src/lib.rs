//! # senses-adapter-mqtt
//!
//! MQTT adapter: the production [`MessageBus`](senses_app::ports::MessageBus)
//! backed by a rumqttc client.
//!
//! ## Responsibilities
//! - Publish and subscribe through an [`MqttBus`] handle
//! - Drive the rumqttc event loop in a background task, translating
//!   `ConnAck` and `Publish` packets into [`BusEvent`](senses_app::ports::BusEvent)s
//! - Keep polling through connection errors so the client reconnects on its own
//!
//! ## Dependency rule
//! Depends on `senses-domain` and `senses-app`. Never imported by domain or app.

pub mod bus;
pub mod config;
pub mod error;

pub use bus::{MqttBus, connect};
pub use config::MqttConfig;
pub use error::MqttError;
