//! Scene — a named preset announced on the bus when activated.
//!
//! Activating a scene publishes its name on the scene topic; devices or
//! other peers listening there apply whatever the scene means to them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// Scene declaration as read from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub name: String,
    pub uid: Option<String>,
    pub title: Option<String>,
    pub topic: Option<String>,
    pub icon: Option<String>,
    pub room: Option<String>,
}

/// A registered scene.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub uid: String,
    pub name: String,
    pub title: String,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub room: Option<String>,
}

impl Scene {
    /// Build a scene, deriving the missing uid, title and topic.
    ///
    /// The topic defaults to `<prefix>/scene[/<room>]` and the uid to
    /// `scene-[<room>-]<name>`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyName`] for a blank name.
    pub fn from_config(config: &SceneConfig, prefix: &str) -> Result<Self, ValidationError> {
        let name = config.name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        let room = config.room.clone().filter(|room| !room.trim().is_empty());
        let topic = config.topic.clone().unwrap_or_else(|| match &room {
            Some(room) => format!("{prefix}/scene/{room}"),
            None => format!("{prefix}/scene"),
        });
        let uid = config.uid.clone().unwrap_or_else(|| match &room {
            Some(room) => format!("scene-{room}-{name}"),
            None => format!("scene-{name}"),
        });
        Ok(Self {
            uid,
            name: name.to_string(),
            title: config.title.clone().unwrap_or_else(|| name.to_string()),
            topic,
            icon: config.icon.clone(),
            room,
        })
    }

    /// JSON view used for attribute matching and automation contexts.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Selects scenes by uid, or by a set of attributes that must all match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SceneSelector {
    Uid(String),
    Attributes(Map<String, Value>),
}

impl SceneSelector {
    #[must_use]
    pub fn matches(&self, scene: &Scene) -> bool {
        match self {
            Self::Uid(uid) => scene.uid == *uid,
            Self::Attributes(wanted) => {
                let actual = scene.to_json();
                wanted
                    .iter()
                    .all(|(key, value)| actual.get(key).unwrap_or(&Value::Null) == value)
            }
        }
    }
}

impl std::fmt::Display for SceneSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uid(uid) => f.write_str(uid),
            Self::Attributes(wanted) => {
                let keys: Vec<&str> = wanted.keys().map(String::as_str).collect();
                write!(f, "{{{}}}", keys.join(","))
            }
        }
    }
}
