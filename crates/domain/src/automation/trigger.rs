//! Trigger — the event pattern that activates an automation.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{one_or_many, option_one_or_many};
use crate::device::StateChange;
use crate::scene::{Scene, SceneSelector};
use crate::schedule::CronSchedule;
use crate::sun::SunEvent;
use crate::time::{human_duration, offset};
use crate::topic::TopicPattern;

/// Describes what activates an automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "on", rename_all = "snake_case")]
pub enum Trigger {
    /// Fires when watched attributes of a device change.
    State {
        /// Device uids or entity ids; empty means every device.
        #[serde(default, deserialize_with = "one_or_many")]
        device: Vec<String>,
        /// Watched keys; empty means every key of either snapshot.
        #[serde(default, deserialize_with = "one_or_many")]
        attribute: Vec<String>,
        /// Only match when the old value is one of these.
        #[serde(default, deserialize_with = "option_one_or_many")]
        from: Option<Vec<Value>>,
        /// Only match when the new value is one of these.
        #[serde(default, deserialize_with = "option_one_or_many")]
        to: Option<Vec<Value>>,
        /// Hold time before firing; a further change cancels it.
        #[serde(default, rename = "for", with = "human_duration::option")]
        hold: Option<Duration>,
    },
    /// Fires when a numeric attribute enters the `(above, below)` window.
    #[serde(alias = "state.numeric")]
    NumericState {
        #[serde(default, deserialize_with = "one_or_many")]
        device: Vec<String>,
        #[serde(default, deserialize_with = "one_or_many")]
        attribute: Vec<String>,
        #[serde(default)]
        above: Option<f64>,
        #[serde(default)]
        below: Option<f64>,
        #[serde(default, rename = "for", with = "human_duration::option")]
        hold: Option<Duration>,
    },
    /// Fires on a raw bus message.
    Mqtt {
        topic: TopicPattern,
        /// Expected payload, compared after trimming.
        #[serde(default)]
        payload: Option<String>,
        #[serde(default, with = "human_duration::option")]
        delay: Option<Duration>,
    },
    /// Fires periodically.
    Interval {
        #[serde(with = "human_duration")]
        every: Duration,
    },
    /// Fires on a cron schedule, optionally after a delay.
    Schedule {
        /// Cron expression; every minute when omitted.
        #[serde(default)]
        cron: Option<CronSchedule>,
        #[serde(default, with = "human_duration::option")]
        delay: Option<Duration>,
    },
    /// Fires at a solar event, shifted by `offset`.
    Sun {
        event: SunEvent,
        #[serde(default = "TimeDelta::zero", with = "offset")]
        offset: TimeDelta,
        /// Overrides the configured latitude.
        #[serde(default)]
        lat: Option<f64>,
        /// Overrides the configured longitude.
        #[serde(default, alias = "long")]
        lon: Option<f64>,
    },
    /// Fires when a matching scene is activated.
    Scene {
        #[serde(deserialize_with = "one_or_many")]
        scene: Vec<SceneSelector>,
    },
    /// Fires when a device is registered.
    DeviceAdded {
        /// Restrict to a uid, an entity id or a device type.
        #[serde(default)]
        device: Option<String>,
    },
    /// Fires only when triggered by name.
    Manual,
}

/// Outcome of checking a state transition against a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transition {
    /// A watched value moved; any pending hold is invalidated.
    pub changed: bool,
    /// The new state satisfies the trigger.
    pub matched: bool,
}

impl Transition {
    /// Whether the trigger should fire for this transition.
    #[must_use]
    pub fn fires(self) -> bool {
        self.changed && self.matched
    }
}

/// Open interval test; missing bounds are unbounded.
#[must_use]
pub fn between(value: f64, above: Option<f64>, below: Option<f64>) -> bool {
    above.is_none_or(|above| value > above) && below.is_none_or(|below| value < below)
}

/// Numeric view of a state value (numbers and numeric strings).
fn as_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn watched_keys(attribute: &[String], change: &StateChange) -> Vec<String> {
    if !attribute.is_empty() {
        return attribute.to_vec();
    }
    let keys: BTreeSet<&String> = change
        .old
        .fields
        .keys()
        .chain(change.new.fields.keys())
        .collect();
    keys.into_iter().cloned().collect()
}

fn one_of(expected: Option<&Vec<Value>>, actual: Option<&Value>) -> bool {
    expected.is_none_or(|values| actual.is_some_and(|actual| values.iter().any(|v| loosely_equal(v, actual))))
}

/// Equality that lets `"on"` in configuration match a stored `"on"` and a
/// configured `80` match a stored `"80"`.
fn loosely_equal(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::String(e), Value::Number(a)) | (Value::Number(a), Value::String(e)) => {
            e.trim().parse::<f64>().ok() == a.as_f64()
        }
        _ => expected == actual,
    }
}

impl Trigger {
    /// Whether this trigger listens to state changes of the device known as
    /// `uid` / `entity_id`.
    #[must_use]
    pub fn watches(&self, uid: &str, entity_id: &str) -> bool {
        match self {
            Self::State { device: ids, .. } | Self::NumericState { device: ids, .. } => {
                ids.is_empty() || ids.iter().any(|id| id == uid || id == entity_id)
            }
            _ => false,
        }
    }

    /// Evaluate a state transition.
    ///
    /// Returns `None` for triggers that do not react to state changes.
    #[must_use]
    pub fn evaluate_change(&self, change: &StateChange) -> Option<Transition> {
        match self {
            Self::State {
                attribute, from, to, ..
            } => {
                let mut transition = Transition::default();
                for key in watched_keys(attribute, change) {
                    let old = change.old.value(&key);
                    let new = change.new.value(&key);
                    transition.changed |= old != new;
                    transition.matched |=
                        one_of(from.as_ref(), old.as_ref()) && one_of(to.as_ref(), new.as_ref());
                }
                Some(transition)
            }
            Self::NumericState {
                attribute,
                above,
                below,
                ..
            } => {
                let mut transition = Transition::default();
                for key in watched_keys(attribute, change) {
                    let old = as_number(change.old.value(&key).as_ref())
                        .is_some_and(|v| between(v, *above, *below));
                    let new = as_number(change.new.value(&key).as_ref())
                        .is_some_and(|v| between(v, *above, *below));
                    transition.changed |= old != new;
                    transition.matched |= new;
                }
                Some(transition)
            }
            _ => None,
        }
    }

    /// Whether a bus message activates this trigger.
    #[must_use]
    pub fn matches_message(&self, topic: &str, payload: &str) -> bool {
        match self {
            Self::Mqtt {
                topic: pattern,
                payload: expected,
                ..
            } => {
                pattern.matches(topic)
                    && expected
                        .as_deref()
                        .is_none_or(|expected| expected.trim() == payload.trim())
            }
            _ => false,
        }
    }

    /// Whether a newly registered device activates this trigger.
    #[must_use]
    pub fn matches_device_added(&self, uid: &str, entity_id: &str, device_type: &str) -> bool {
        match self {
            Self::DeviceAdded { device: wanted } => wanted.as_deref().is_none_or(|wanted| {
                wanted == uid || wanted == entity_id || wanted == device_type
            }),
            _ => false,
        }
    }

    /// Whether activating `scene` fires this trigger.
    #[must_use]
    pub fn matches_scene(&self, scene: &Scene) -> bool {
        match self {
            Self::Scene { scene: selectors } => selectors.iter().any(|selector| selector.matches(scene)),
            _ => false,
        }
    }

    /// Delay between matching and firing.
    #[must_use]
    pub fn hold(&self) -> Option<Duration> {
        match self {
            Self::State { hold, .. } | Self::NumericState { hold, .. } => *hold,
            Self::Mqtt { delay, .. } => *delay,
            _ => None,
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::State { device, .. } => write!(f, "state({})", device.join(",")),
            Self::NumericState { device, .. } => write!(f, "numeric_state({})", device.join(",")),
            Self::Mqtt { topic, .. } => write!(f, "mqtt({topic})"),
            Self::Interval { every } => {
                write!(f, "interval({})", humantime::format_duration(*every))
            }
            Self::Schedule { cron, .. } => match cron {
                Some(cron) => write!(f, "schedule({cron})"),
                None => f.write_str("schedule"),
            },
            Self::Sun { event, offset, .. } => {
                if offset.is_zero() {
                    write!(f, "sun({event})")
                } else {
                    write!(f, "sun({event} {:+}s)", offset.num_seconds())
                }
            }
            Self::Scene { scene } => {
                let selectors: Vec<String> = scene.iter().map(ToString::to_string).collect();
                write!(f, "scene({})", selectors.join(","))
            }
            Self::DeviceAdded { device } => match device {
                Some(device) => write!(f, "device_added({device})"),
                None => f.write_str("device_added"),
            },
            Self::Manual => f.write_str("manual"),
        }
    }
}
