//! Action — the effect performed when an automation fires.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::one_or_many;
use crate::scene::SceneSelector;
use crate::time::human_duration;

/// One step of an automation's action sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "do", rename_all = "snake_case")]
pub enum Action {
    /// Send a partial state to one or more devices.
    #[serde(alias = "setState")]
    SetState {
        /// Device uids or entity ids.
        #[serde(deserialize_with = "one_or_many")]
        device: Vec<String>,
        #[serde(alias = "payload")]
        state: Map<String, Value>,
    },
    /// Invoke a registered service.
    #[serde(alias = "callService")]
    CallService {
        /// Service name, e.g. `"device.request_state"`.
        service: String,
        /// Additional parameters for the service call.
        #[serde(default)]
        data: Value,
    },
    /// Publish a raw bus message. The payload is rendered as a template
    /// against the firing context.
    Publish {
        topic: String,
        #[serde(default)]
        payload: String,
        #[serde(default)]
        qos: u8,
    },
    /// Wait before continuing to the next action.
    Delay {
        #[serde(with = "human_duration")]
        duration: Duration,
    },
    /// Stop the remaining actions of this run.
    Cancel,
    /// Activate the first registered scene the selector matches.
    #[serde(alias = "activateScene", alias = "scene.activate")]
    ActivateScene { scene: SceneSelector },
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SetState { device, .. } => write!(f, "set_state({})", device.join(",")),
            Self::CallService { service, .. } => write!(f, "call_service({service})"),
            Self::Publish { topic, .. } => write!(f, "publish({topic})"),
            Self::Delay { duration } => {
                write!(f, "delay({})", humantime::format_duration(*duration))
            }
            Self::Cancel => f.write_str("cancel"),
            Self::ActivateScene { scene } => write!(f, "activate_scene({scene})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn should_display_action_variants() {
        let a = Action::CallService {
            service: "device.request_state".to_string(),
            data: Value::Null,
        };
        assert_eq!(a.to_string(), "call_service(device.request_state)");
        let a = Action::Delay {
            duration: Duration::from_secs(30),
        };
        assert_eq!(a.to_string(), "delay(30s)");
        assert_eq!(Action::Cancel.to_string(), "cancel");
    }

    #[test]
    fn should_deserialize_set_state_alias_and_single_device() {
        let a: Action = serde_json::from_value(json!({
            "do": "setState",
            "device": "light.hall",
            "payload": {"state": "on", "brightness": 80}
        }))
        .unwrap();
        match a {
            Action::SetState { device, state } => {
                assert_eq!(device, vec!["light.hall".to_string()]);
                assert_eq!(state["brightness"], 80);
            }
            other => panic!("expected SetState, got {other:?}"),
        }
    }

    #[test]
    fn should_deserialize_call_service_with_default_data() {
        let a: Action = serde_json::from_value(json!({
            "do": "call_service",
            "service": "device.request_state"
        }))
        .unwrap();
        assert!(matches!(a, Action::CallService { data: Value::Null, .. }));
    }

    #[test]
    fn should_deserialize_delay_from_millis_or_text() {
        let a: Action = serde_json::from_value(json!({"do": "delay", "duration": 1500})).unwrap();
        assert_eq!(
            a,
            Action::Delay {
                duration: Duration::from_millis(1500)
            }
        );
        let a: Action = serde_json::from_value(json!({"do": "delay", "duration": "1m"})).unwrap();
        assert_eq!(
            a,
            Action::Delay {
                duration: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn should_default_publish_qos_to_zero() {
        let a: Action = serde_json::from_value(json!({
            "do": "publish",
            "topic": "notify/hall",
            "payload": "motion"
        }))
        .unwrap();
        assert!(matches!(a, Action::Publish { qos: 0, .. }));
    }

    #[test]
    fn should_deserialize_scene_activation_by_uid_or_attributes() {
        let a: Action = serde_json::from_value(json!({"do": "activate_scene", "scene": "scene-movie"})).unwrap();
        assert_eq!(
            a,
            Action::ActivateScene {
                scene: SceneSelector::Uid("scene-movie".to_string())
            }
        );
        assert_eq!(a.to_string(), "activate_scene(scene-movie)");

        let a: Action = serde_json::from_value(json!({
            "do": "scene.activate",
            "scene": {"name": "movie", "room": "living"}
        }))
        .unwrap();
        assert_eq!(a.to_string(), "activate_scene({name,room})");
    }
}
