//! Message bus port — the publish/subscribe transport devices talk over.

use std::future::Future;

use senses_domain::error::SensesError;

/// Something that happened on the bus connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// The connection was (re-)established; subscriptions must be renewed.
    Connected,
    /// An inbound message on a subscribed topic.
    Message { topic: String, payload: String },
}

/// Outbound side of the bus connection.
///
/// Inbound traffic is delivered separately as a stream of [`BusEvent`]s.
pub trait MessageBus {
    /// Publish `payload` on a concrete `topic`.
    fn publish(
        &self,
        topic: String,
        payload: String,
        qos: u8,
    ) -> impl Future<Output = Result<(), SensesError>> + Send;

    /// Subscribe to bus-level topic patterns.
    fn subscribe(
        &self,
        patterns: Vec<String>,
    ) -> impl Future<Output = Result<(), SensesError>> + Send;
}

impl<T: MessageBus + Send + Sync> MessageBus for std::sync::Arc<T> {
    fn publish(
        &self,
        topic: String,
        payload: String,
        qos: u8,
    ) -> impl Future<Output = Result<(), SensesError>> + Send {
        (**self).publish(topic, payload, qos)
    }

    fn subscribe(
        &self,
        patterns: Vec<String>,
    ) -> impl Future<Output = Result<(), SensesError>> + Send {
        (**self).subscribe(patterns)
    }
}
