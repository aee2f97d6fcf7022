//! Statically configured devices.
//!
//! A configuration entry is turned into a synthesized handshake so that
//! static and discovered devices go through the same driver resolution.

use serde::Deserialize;
use serde_json::Value;

use crate::device::{Format, TopicRoute};
use crate::error::ValidationError;
use crate::handshake::{ChannelRole, CommChannel, Handshake};
use crate::topic::TopicPattern;

/// One `[[devices]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub name: String,
    /// Type tag resolved through the driver registry (`light`, `sensor`, …).
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub state_topic: Option<String>,
    #[serde(default)]
    pub set_topic: Option<String>,
    #[serde(default)]
    pub get_topic: Option<String>,
    #[serde(default)]
    pub format: Format,
    /// Sensor value field.
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub optimistic: bool,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub features: Vec<String>,
    /// Extra routes, appended after the topic shorthands.
    #[serde(default)]
    pub channels: Vec<CommChannel>,
}

impl DeviceConfig {
    /// Uid used when none is configured: `<type>-<name>`.
    #[must_use]
    pub fn resolved_uid(&self) -> String {
        self.uid
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.device_type, self.name))
    }

    /// Build the handshake describing this device.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty name or an invalid topic.
    pub fn to_handshake(&self) -> Result<Handshake, ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        let fully_qualified_type = match &self.class {
            Some(class) => format!("device/{}, {class}", self.device_type),
            None => format!("device/{}", self.device_type),
        };
        let mut shake = Handshake::new(self.resolved_uid(), fully_qualified_type);
        shake.alias = Some(self.name.clone());
        shake.display_name = Some(self.title.clone().unwrap_or_else(|| self.name.clone()));
        shake.product = Some(self.product.clone().unwrap_or_else(|| "Senses device".to_string()));
        shake.vendor = Some(self.vendor.clone().unwrap_or_else(|| "Senses".to_string()));
        shake.location.clone_from(&self.room);
        shake.description.clone_from(&self.description);
        shake.tags.clone_from(&self.tags);
        shake.groups.clone_from(&self.groups);
        shake.features.clone_from(&self.features);

        let shorthands = [
            (ChannelRole::State, &self.state_topic, self.format),
            (ChannelRole::Set, &self.set_topic, self.format),
            (ChannelRole::Fetch, &self.get_topic, Format::Void),
        ];
        for (role, topic, format) in shorthands {
            if let Some(topic) = topic {
                let route = TopicRoute::new(TopicPattern::parse(topic)?).with_format(format);
                shake.comm_channels.push(CommChannel::new(role, route));
            }
        }
        shake.comm_channels.extend(self.channels.iter().cloned());

        if let Some(field) = &self.field {
            shake
                .additional
                .insert("field".to_string(), Value::from(field.clone()));
        }
        shake
            .additional
            .insert("optimistic".to_string(), Value::from(self.optimistic));
        shake
            .additional
            .insert("incremental".to_string(), Value::from(self.incremental));
        Ok(shake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml_like: serde_json::Value) -> DeviceConfig {
        serde_json::from_value(toml_like).unwrap()
    }

    #[test]
    fn should_synthesize_handshake_with_topics() {
        let cfg = config(serde_json::json!({
            "name": "desk",
            "type": "light",
            "class": "dimmable",
            "room": "office",
            "stateTopic": "desk/state",
            "setTopic": "desk/set",
            "getTopic": "desk/get",
            "optimistic": true
        }));
        let shake = cfg.to_handshake().unwrap();
        assert_eq!(shake.uid, "light-desk");
        assert_eq!(shake.fully_qualified_type, "device/light, dimmable");
        assert_eq!(shake.location.as_deref(), Some("office"));
        assert_eq!(shake.comm_channels.len(), 3);
        assert_eq!(shake.comm_channels[2].role, ChannelRole::Fetch);
        assert!(shake.flag("optimistic"));
        assert!(!shake.keepalive);
    }

    #[test]
    fn should_keep_explicit_uid_and_sensor_field() {
        let cfg = config(serde_json::json!({
            "name": "outdoor",
            "type": "sensor",
            "uid": "th-17",
            "field": "temperature",
            "format": "number"
        }));
        let shake = cfg.to_handshake().unwrap();
        assert_eq!(shake.uid, "th-17");
        assert_eq!(shake.additional["field"], "temperature");
        assert!(shake.comm_channels.is_empty());
    }

    #[test]
    fn should_reject_empty_name() {
        let cfg = config(serde_json::json!({"name": "", "type": "light"}));
        assert_eq!(cfg.to_handshake().unwrap_err(), ValidationError::EmptyName);
    }

    #[test]
    fn should_reject_invalid_topic() {
        let cfg = config(serde_json::json!({"name": "x", "type": "light", "stateTopic": "a/#/b"}));
        assert!(cfg.to_handshake().is_err());
    }
}
