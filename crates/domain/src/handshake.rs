//! Handshake — the presence and description packet exchanged during discovery.
//!
//! A handshake is built fresh for every exchange and never mutated after it
//! has been sent. Receivers turn it into a [`Device`](crate::device::Device)
//! through the [`DriverRegistry`](crate::device::DriverRegistry).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::device::TopicRoute;
use crate::error::ValidationError;

/// Protocol version written into every outgoing handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Purpose of a communication channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    /// Device publishes its state here.
    State,
    /// Device accepts state changes here.
    #[serde(alias = "command")]
    Set,
    /// Device reports its own liveness here.
    Availability,
    /// Publishing here asks the device to report its state.
    Fetch,
}

/// One entry of a device's communication contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommChannel {
    #[serde(alias = "type")]
    pub role: ChannelRole,
    /// Body published on `fetch` channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(flatten)]
    pub route: TopicRoute,
}

impl CommChannel {
    #[must_use]
    pub fn new(role: ChannelRole, route: TopicRoute) -> Self {
        Self {
            role,
            payload: None,
            route,
        }
    }
}

/// Presence and description record of a bus participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Mime-like type such as `device/light, dimmable`.
    #[serde(rename = "type", alias = "fullyQualifiedType")]
    pub fully_qualified_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, alias = "serialNo", skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub available: bool,
    #[serde(default)]
    pub keepalive: bool,
    #[serde(
        default,
        alias = "keepaliveInterval",
        with = "crate::time::duration_ms"
    )]
    pub keepalive_timeout: Duration,
    #[serde(default, alias = "comm")]
    pub comm_channels: Vec<CommChannel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
    /// Set only when the sender expects a reply.
    #[serde(default, alias = "_thread", skip_serializing_if = "Option::is_none")]
    pub reply_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub additional: Map<String, Value>,
    #[serde(rename = "_version", default = "default_version")]
    pub version: String,
}

fn default_true() -> bool {
    true
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl Handshake {
    /// Start a handshake with the mandatory fields.
    #[must_use]
    pub fn new(uid: impl Into<String>, fully_qualified_type: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            alias: None,
            display_name: None,
            fully_qualified_type: fully_qualified_type.into(),
            vendor: None,
            product: None,
            model: None,
            serial_number: None,
            driver: None,
            description: None,
            available: true,
            keepalive: false,
            keepalive_timeout: Duration::ZERO,
            comm_channels: Vec::new(),
            location: None,
            groups: Vec::new(),
            tags: Vec::new(),
            features: Vec::new(),
            via: None,
            reply_topic: None,
            additional: Map::new(),
            version: default_version(),
        }
    }

    /// Decode the [`DeviceType`] carried in `fully_qualified_type`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidDeviceType`] when the type has no
    /// `kind/type` part.
    pub fn device_type(&self) -> Result<DeviceType, ValidationError> {
        DeviceType::parse(&self.fully_qualified_type)
    }

    /// Read a boolean flag out of `additional`.
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.additional
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Channels with the given role, in declaration order.
    pub fn channels(&self, role: ChannelRole) -> impl Iterator<Item = &CommChannel> {
        self.comm_channels
            .iter()
            .filter(move |channel| channel.role == role)
    }

    /// Check the packet carries an identity.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyUid`] or an invalid type error.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.uid.trim().is_empty() {
            return Err(ValidationError::EmptyUid);
        }
        self.device_type().map(|_| ())
    }
}

/// Decoded `kind/type, class` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceType {
    pub kind: String,
    pub type_name: String,
    pub class: Option<String>,
}

impl DeviceType {
    /// Parse `device/light, dimmable` into its parts.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidDeviceType`] when either the kind or
    /// the type is missing.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let (mime, class) = match raw.split_once(',') {
            Some((mime, class)) => (mime, Some(class.trim()).filter(|c| !c.is_empty())),
            None => (raw, None),
        };
        let (kind, type_name) = mime
            .split_once('/')
            .map(|(kind, type_name)| (kind.trim(), type_name.trim()))
            .filter(|(kind, type_name)| !kind.is_empty() && !type_name.is_empty())
            .ok_or_else(|| ValidationError::InvalidDeviceType(raw.to_string()))?;
        Ok(Self {
            kind: kind.to_string(),
            type_name: type_name.to_string(),
            class: class.map(str::to_string),
        })
    }

    /// Whether the packet describes a device (rather than an application).
    #[must_use]
    pub fn is_device(&self) -> bool {
        self.kind == "device"
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.type_name)?;
        if let Some(class) = &self.class {
            write!(f, ", {class}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::device::Format;

    #[test]
    fn should_decode_full_device_type() {
        let ty = DeviceType::parse("device/light, dimmable").unwrap();
        assert_eq!(ty.kind, "device");
        assert_eq!(ty.type_name, "light");
        assert_eq!(ty.class.as_deref(), Some("dimmable"));
        assert!(ty.is_device());
        assert_eq!(ty.to_string(), "device/light, dimmable");
    }

    #[test]
    fn should_decode_device_type_without_class() {
        let ty = DeviceType::parse("application/assistant").unwrap();
        assert!(ty.class.is_none());
        assert!(!ty.is_device());
    }

    #[test]
    fn should_reject_device_type_without_slash() {
        assert!(DeviceType::parse("light").is_err());
        assert!(DeviceType::parse("device/").is_err());
    }

    #[test]
    fn should_deserialize_wire_handshake() {
        let shake: Handshake = serde_json::from_value(json!({
            "uid": "lamp-1",
            "alias": "lamp",
            "type": "device/light, dimmable",
            "available": true,
            "keepalive": true,
            "keepaliveTimeout": 5000,
            "commChannels": [
                {"role": "state", "topic": "lamp-1/state"},
                {"role": "set", "topic": "lamp-1/+name/set", "format": "number"},
                {"role": "fetch", "topic": "lamp-1/get", "payload": "now"}
            ],
            "via": "bridge",
            "replyTopic": "discovery/handshake/lamp-1",
            "additional": {"incremental": true}
        }))
        .unwrap();

        assert_eq!(shake.uid, "lamp-1");
        assert_eq!(shake.keepalive_timeout, Duration::from_secs(5));
        assert_eq!(shake.comm_channels.len(), 3);
        assert_eq!(shake.comm_channels[1].route.format, Format::Number);
        assert_eq!(shake.comm_channels[2].payload.as_deref(), Some("now"));
        assert_eq!(shake.channels(ChannelRole::State).count(), 1);
        assert!(shake.flag("incremental"));
        assert!(!shake.flag("optimistic"));
        assert_eq!(shake.version, PROTOCOL_VERSION);
    }

    #[test]
    fn should_accept_legacy_field_names() {
        let shake: Handshake = serde_json::from_value(json!({
            "uid": "x",
            "name": "Senses Home",
            "fullyQualifiedType": "application/assistant",
            "keepaliveInterval": 2000,
            "_thread": "discovery/handshake/x",
            "comm": [{"type": "command", "topic": "x/set"}]
        }))
        .unwrap();
        assert_eq!(shake.display_name.as_deref(), Some("Senses Home"));
        assert_eq!(shake.reply_topic.as_deref(), Some("discovery/handshake/x"));
        assert_eq!(shake.comm_channels[0].role, ChannelRole::Set);
    }

    #[test]
    fn should_omit_reply_topic_when_not_expecting_reply() {
        let shake = Handshake::new("hub", "application/assistant");
        let value = serde_json::to_value(&shake).unwrap();
        assert!(value.get("replyTopic").is_none());
        assert_eq!(value["type"], "application/assistant");
    }

    #[test]
    fn should_reject_handshake_with_blank_uid() {
        let shake = Handshake::new("  ", "device/light");
        assert_eq!(shake.validate(), Err(ValidationError::EmptyUid));
    }
}
