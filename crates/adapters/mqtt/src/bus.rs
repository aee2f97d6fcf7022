//! rumqttc-backed message bus and its event-loop task.

use std::future::Future;
use std::time::Duration;

use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter,
};
use senses_app::ports::{BusEvent, MessageBus};
use senses_domain::error::SensesError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MqttConfig;
use crate::error::MqttError;

/// Outbound handle on the broker connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    #[must_use]
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }

    /// Send a DISCONNECT to the broker once queued requests are flushed.
    ///
    /// # Errors
    ///
    /// Returns [`MqttError::Client`] if the event loop is gone.
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        self.client.disconnect().await.map_err(MqttError::Client)
    }
}

/// Map a numeric QoS level onto rumqttc's enum. Levels above 2 clamp to 2.
#[must_use]
pub fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

impl MessageBus for MqttBus {
    fn publish(
        &self,
        topic: String,
        payload: String,
        qos_level: u8,
    ) -> impl Future<Output = Result<(), SensesError>> + Send {
        let client = self.client.clone();
        async move {
            client
                .publish(topic, qos(qos_level), false, payload.into_bytes())
                .await
                .map_err(|err| MqttError::Client(err).into_domain())
        }
    }

    fn subscribe(
        &self,
        patterns: Vec<String>,
    ) -> impl Future<Output = Result<(), SensesError>> + Send {
        let client = self.client.clone();
        async move {
            if patterns.is_empty() {
                return Ok(());
            }
            let filters = patterns
                .into_iter()
                .map(|pattern| SubscribeFilter::new(pattern, QoS::AtMostOnce));
            client
                .subscribe_many(filters)
                .await
                .map_err(|err| MqttError::Client(err).into_domain())
        }
    }
}

/// Decode an inbound PUBLISH into a [`BusEvent::Message`].
///
/// # Errors
///
/// Returns [`MqttError::InvalidPayload`] when the payload is not UTF-8.
pub fn decode_publish(topic: &str, payload: &[u8]) -> Result<BusEvent, MqttError> {
    let payload = String::from_utf8(payload.to_vec()).map_err(|source| {
        MqttError::InvalidPayload {
            topic: topic.to_string(),
            source,
        }
    })?;
    Ok(BusEvent::Message {
        topic: topic.to_string(),
        payload,
    })
}

/// Build the client and spawn the event-loop task.
///
/// Inbound [`BusEvent`]s arrive on the returned receiver. The task ends when
/// `shutdown` fires, the receiver is dropped or a DISCONNECT has been sent.
#[must_use]
pub fn connect(
    config: &MqttConfig,
    shutdown: CancellationToken,
) -> (MqttBus, mpsc::Receiver<BusEvent>, JoinHandle<()>) {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(config.keep_alive());
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }

    let capacity = config.capacity.max(1);
    let (client, eventloop) = AsyncClient::new(options, capacity);
    let (tx, rx) = mpsc::channel(capacity);

    tracing::info!(
        host = %config.host,
        port = config.port,
        client_id = %config.client_id,
        "connecting to MQTT broker"
    );
    let handle = tokio::spawn(event_loop(
        eventloop,
        tx,
        config.reconnect_delay(),
        shutdown,
    ));
    (MqttBus::new(client), rx, handle)
}

/// Hand `event` to the hub without waiting, so the poll loop keeps the
/// connection alive while the hub is busy.
///
/// A full channel drops messages. Connection notices are never dropped
/// since they renew the subscriptions; they are delivered from a side task.
/// Returns `false` once the receiver is gone.
fn forward(tx: &mpsc::Sender<BusEvent>, event: BusEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(BusEvent::Message { topic, .. })) => {
            tracing::warn!(%topic, "hub is lagging, dropping MQTT message");
            true
        }
        Err(TrySendError::Full(event @ BusEvent::Connected)) => {
            let tx = tx.clone();
            tokio::spawn(async move {
                if tx.send(event).await.is_err() {
                    tracing::debug!("bus event receiver dropped before connection notice");
                }
            });
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

async fn event_loop(
    mut eventloop: EventLoop,
    tx: mpsc::Sender<BusEvent>,
    reconnect_delay: Duration,
    shutdown: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        let polled = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        let event = match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if attempt > 0 {
                    tracing::info!(attempt, "reconnected to MQTT broker");
                } else {
                    tracing::info!("connected to MQTT broker");
                }
                attempt = 0;
                BusEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match decode_publish(&publish.topic, &publish.payload) {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping MQTT message");
                        continue;
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::info!("disconnected from MQTT broker");
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let err = MqttError::Connection(err);
                tracing::warn!(
                    error = %err,
                    cause = ?std::error::Error::source(&err),
                    attempt,
                    delay_ms = u64::try_from(reconnect_delay.as_millis()).unwrap_or(u64::MAX),
                    "MQTT connection lost, retrying"
                );
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(reconnect_delay) => {}
                }
                continue;
            }
        };

        if !forward(&tx, event) {
            tracing::debug!("bus event receiver dropped, stopping MQTT loop");
            break;
        }
    }

    tracing::debug!("MQTT event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── QoS ──

    #[test]
    fn should_map_qos_levels() {
        assert_eq!(qos(0), QoS::AtMostOnce);
        assert_eq!(qos(1), QoS::AtLeastOnce);
        assert_eq!(qos(2), QoS::ExactlyOnce);
        assert_eq!(qos(7), QoS::ExactlyOnce);
    }

    // ── Decoding ──

    #[test]
    fn should_decode_utf8_publish() {
        let event = decode_publish("light-desk/state", br#"{"state":1}"#).unwrap();
        assert_eq!(
            event,
            BusEvent::Message {
                topic: "light-desk/state".to_string(),
                payload: r#"{"state":1}"#.to_string(),
            }
        );
    }

    #[test]
    fn should_reject_non_utf8_publish() {
        let err = decode_publish("a/b", &[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, MqttError::InvalidPayload { ref topic, .. } if topic == "a/b"));
    }

    // ── Client ──

    #[tokio::test]
    async fn should_queue_requests_while_event_loop_is_alive() {
        let options = MqttOptions::new("test", "localhost", 1883);
        let (client, _eventloop) = AsyncClient::new(options, 4);
        let bus = MqttBus::new(client);

        bus.publish("a/b".to_string(), "1".to_string(), 0)
            .await
            .unwrap();
        bus.subscribe(vec!["a/#".to_string()]).await.unwrap();
    }

    #[tokio::test]
    async fn should_accept_empty_subscription_list() {
        let options = MqttOptions::new("test", "localhost", 1883);
        let (client, eventloop) = AsyncClient::new(options, 4);
        drop(eventloop);
        let bus = MqttBus::new(client);

        bus.subscribe(Vec::new()).await.unwrap();
    }

    #[tokio::test]
    async fn should_fail_with_bus_error_once_event_loop_is_gone() {
        let options = MqttOptions::new("test", "localhost", 1883);
        let (client, eventloop) = AsyncClient::new(options, 4);
        drop(eventloop);
        let bus = MqttBus::new(client);

        let err = bus
            .publish("a/b".to_string(), "1".to_string(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SensesError::Bus(_)));
    }

    // ── Event loop ──

    #[tokio::test]
    async fn should_drop_message_instead_of_waiting_when_channel_is_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let first = decode_publish("a/b", b"first").unwrap();

        assert!(forward(&tx, first.clone()));
        assert!(forward(&tx, decode_publish("a/b", b"late").unwrap()));

        assert_eq!(rx.recv().await, Some(first));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn should_still_deliver_connection_notice_when_channel_is_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let first = decode_publish("a/b", b"first").unwrap();

        assert!(forward(&tx, first.clone()));
        assert!(forward(&tx, BusEvent::Connected));
        assert!(forward(&tx, decode_publish("a/b", b"late").unwrap()));

        assert_eq!(rx.recv().await, Some(first));
        assert_eq!(rx.recv().await, Some(BusEvent::Connected));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn should_stop_forwarding_once_receiver_is_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(!forward(&tx, BusEvent::Connected));
    }

    #[tokio::test]
    async fn should_stop_event_loop_on_shutdown() {
        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            reconnect_delay_ms: 50,
            ..MqttConfig::default()
        };
        let shutdown = CancellationToken::new();
        let (_bus, _rx, handle) = connect(&config, shutdown.clone());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
