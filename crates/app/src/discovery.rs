//! Discovery protocol — presence and handshakes over the bus.
//!
//! Topics:
//! - `discovery/handshake` broadcast handshakes
//! - `discovery/handshake/<uid>` directed replies
//! - `discovery/alive/<uid>` and `discovery/death/<uid>` presence
//!
//! An *announcement* carries no reply topic; a *query* carries
//! `discovery/handshake/<localUid>` and every peer answers it exactly once
//! with an announcement, so handshakes never ping-pong.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use senses_domain::error::SensesError;
use senses_domain::event::{Event, EventKind};
use senses_domain::handshake::Handshake;
use senses_domain::time::{Timestamp, duration_ms, now, parse_timestamp};

use crate::ports::{EventPublisher, MessageBus};

pub const DISCOVERY_PREFIX: &str = "discovery";
pub const HANDSHAKE_TOPIC: &str = "discovery/handshake";

const SUBSCRIPTIONS: [&str; 2] = ["discovery/+", "discovery/+/+"];
const LOCAL_TYPE: &str = "application/assistant";

/// Local identity and presence settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct DiscoveryConfig {
    pub uid: String,
    pub name: String,
    pub product: String,
    pub vendor: Option<String>,
    /// Announce liveness with periodic `discovery/alive/<uid>` messages.
    pub keepalive: bool,
    #[serde(with = "duration_ms")]
    pub keepalive_interval: Duration,
    /// Query (expect replies) instead of announcing on connect.
    pub query_on_connect: bool,
    /// Create devices from incoming device handshakes.
    pub devices: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            uid: "AC-local-senses".to_string(),
            name: "senses".to_string(),
            product: "Senses".to_string(),
            vendor: None,
            keepalive: true,
            keepalive_interval: Duration::from_millis(2000),
            query_on_connect: false,
            devices: true,
        }
    }
}

/// Whether `topic` belongs to the discovery family.
#[must_use]
pub fn is_discovery_topic(topic: &str) -> bool {
    topic
        .split_once('/')
        .is_some_and(|(prefix, _)| prefix == DISCOVERY_PREFIX)
}

/// Discovery endpoint for the local hub.
pub struct Discovery<B, P> {
    config: DiscoveryConfig,
    bus: B,
    publisher: P,
}

impl<B, P> Discovery<B, P>
where
    B: MessageBus + Send + Sync,
    P: EventPublisher + Send + Sync,
{
    pub fn new(config: DiscoveryConfig, bus: B, publisher: P) -> Self {
        Self {
            config,
            bus,
            publisher,
        }
    }

    #[must_use]
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    #[must_use]
    pub fn uid(&self) -> &str {
        &self.config.uid
    }

    /// Handshake describing this hub.
    #[must_use]
    pub fn local_handshake(&self) -> Handshake {
        let mut shake = Handshake::new(self.config.uid.clone(), LOCAL_TYPE);
        shake.alias = Some(self.config.name.clone());
        shake.product = Some(self.config.product.clone());
        shake.vendor.clone_from(&self.config.vendor);
        shake.keepalive = self.config.keepalive;
        // Peers consider us gone after missing a couple of heartbeats.
        shake.keepalive_timeout = self.config.keepalive_interval * 3;
        shake
    }

    fn reply_topic(&self) -> String {
        format!("{HANDSHAKE_TOPIC}/{}", self.config.uid)
    }

    /// Subscribe the discovery family and introduce ourselves.
    ///
    /// # Errors
    ///
    /// Returns [`SensesError::Bus`] when subscribing or publishing fails.
    pub async fn on_connect(&self) -> Result<(), SensesError> {
        self.bus
            .subscribe(SUBSCRIPTIONS.iter().map(ToString::to_string).collect())
            .await?;
        self.handshake(self.config.query_on_connect, None).await
    }

    /// Publish the local handshake on `topic`, or the broadcast topic.
    ///
    /// A query (`expect_reply`) carries our reply topic.
    ///
    /// # Errors
    ///
    /// Returns [`SensesError::Bus`] when the publish fails.
    #[tracing::instrument(skip(self))]
    pub async fn handshake(&self, expect_reply: bool, topic: Option<&str>) -> Result<(), SensesError> {
        let mut shake = self.local_handshake();
        if expect_reply {
            shake.reply_topic = Some(self.reply_topic());
        }
        let payload = serde_json::to_string(&shake)
            .map_err(|err| SensesError::Decode(err.into()))?;
        let topic = topic.unwrap_or(HANDSHAKE_TOPIC).to_string();
        tracing::debug!(%topic, "sending handshake");
        self.bus.publish(topic, payload, 0).await
    }

    /// Publish a liveness heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`SensesError::Bus`] when the publish fails.
    pub async fn heartbeat(&self) -> Result<(), SensesError> {
        self.bus
            .publish(
                format!("{DISCOVERY_PREFIX}/alive/{}", self.config.uid),
                now().timestamp_millis().to_string(),
                0,
            )
            .await
    }

    /// Announce that the local hub is leaving.
    ///
    /// # Errors
    ///
    /// Returns [`SensesError::Bus`] when the publish fails.
    pub async fn goodbye(&self) -> Result<(), SensesError> {
        self.bus
            .publish(
                format!("{DISCOVERY_PREFIX}/death/{}", self.config.uid),
                now().timestamp_millis().to_string(),
                0,
            )
            .await
    }

    /// Handle a message of the discovery family.
    ///
    /// The presence events derived from the message are published on the
    /// event feed first; a query is answered afterwards. Malformed payloads
    /// and unknown subtypes are logged and produce nothing.
    pub async fn handle_message(&self, topic: &str, payload: &str) -> Received {
        let mut segments = topic.split('/');
        if segments.next() != Some(DISCOVERY_PREFIX) {
            return Received::default();
        }
        let subtype = segments.next().unwrap_or_default();
        let target = segments.next();

        let (events, reply_to) = match (subtype, target) {
            ("alive", Some(uid)) if !uid.is_empty() => (
                vec![EventKind::DiscoveryAlive {
                    uid: uid.to_string(),
                    at: presence_time(payload),
                }],
                None,
            ),
            ("death", Some(uid)) if !uid.is_empty() => (
                vec![EventKind::DiscoveryDeath {
                    uid: uid.to_string(),
                    at: presence_time(payload),
                    cascade: false,
                }],
                None,
            ),
            ("handshake", None) => self.read_handshake(payload),
            ("handshake", Some(uid)) if uid == self.config.uid => self.read_handshake(payload),
            ("handshake", Some(_)) => (Vec::new(), None),
            _ => {
                tracing::debug!(%topic, "unknown discovery message");
                (Vec::new(), None)
            }
        };

        for kind in &events {
            if let Err(err) = self.publisher.publish(Event::new(kind.clone())).await {
                tracing::warn!(error = %err, "unable to publish discovery event");
            }
        }
        let reply = match reply_to {
            Some(reply_topic) => self.handshake(false, Some(&reply_topic)).await,
            None => Ok(()),
        };
        Received { events, reply }
    }

    /// Decode a handshake into its events and the topic a query wants answered on.
    fn read_handshake(&self, payload: &str) -> (Vec<EventKind>, Option<String>) {
        let shake: Handshake = match serde_json::from_str(payload) {
            Ok(shake) => shake,
            Err(err) => {
                tracing::warn!(error = %err, "malformed handshake dropped");
                return (Vec::new(), None);
            }
        };
        if let Err(err) = shake.validate() {
            tracing::warn!(uid = %shake.uid, error = %err, "invalid handshake dropped");
            return (Vec::new(), None);
        }
        if shake.uid == self.config.uid {
            tracing::trace!("ignoring own handshake");
            return (Vec::new(), None);
        }

        tracing::debug!(uid = %shake.uid, r#type = %shake.fully_qualified_type, "handshake received");
        let at = now();
        let uid = shake.uid.clone();
        let presence = if shake.available {
            EventKind::DiscoveryAlive { uid, at }
        } else {
            EventKind::DiscoveryDeath {
                uid,
                at,
                cascade: false,
            }
        };
        let reply_to = shake.reply_topic.clone();
        (
            vec![
                EventKind::DiscoveryHandshake {
                    handshake: Box::new(shake),
                },
                presence,
            ],
            reply_to,
        )
    }
}

/// Outcome of one discovery message.
#[derive(Debug)]
pub struct Received {
    /// Presence events, already published on the event feed.
    pub events: Vec<EventKind>,
    /// Result of answering a query. `Ok` when no answer was due.
    pub reply: Result<(), SensesError>,
}

impl Default for Received {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            reply: Ok(()),
        }
    }
}

/// Presence messages carry their send time as epoch milliseconds or
/// RFC 3339; anything else counts as received now.
fn presence_time(payload: &str) -> Timestamp {
    parse_timestamp(&Value::String(payload.trim().to_string())).unwrap_or_else(now)
}
