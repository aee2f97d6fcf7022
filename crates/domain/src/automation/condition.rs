//! Condition — a guard that must be true for the automation to proceed.

use std::sync::Arc;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{between, one_or_many};
use crate::device::StateSnapshot;
use crate::error::ValidationError;
use crate::sun::{Position, SunEvent, is_sun_between};
use crate::time::{Timestamp, offset};

fn default_attribute() -> String {
    "state".to_string()
}

/// A predicate that must hold for the automation actions to execute.
///
/// Conditions are evaluated *after* the trigger fires. All top-level
/// conditions of an automation must be satisfied (logical AND).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum Condition {
    /// Requires a device attribute to equal one of the given values.
    State {
        device: String,
        #[serde(default = "default_attribute")]
        attribute: String,
        #[serde(deserialize_with = "one_or_many")]
        value: Vec<Value>,
    },
    /// Requires a numeric attribute inside the open `(above, below)` window.
    #[serde(alias = "state.numeric")]
    NumericState {
        device: String,
        #[serde(default = "default_attribute")]
        attribute: String,
        #[serde(default)]
        above: Option<f64>,
        #[serde(default)]
        below: Option<f64>,
    },
    /// Every nested condition holds.
    And {
        #[serde(deserialize_with = "one_or_many")]
        conditions: Vec<Condition>,
    },
    /// At least one nested condition holds.
    Or {
        #[serde(deserialize_with = "one_or_many")]
        conditions: Vec<Condition>,
    },
    /// No nested condition holds.
    Not {
        #[serde(deserialize_with = "one_or_many")]
        conditions: Vec<Condition>,
    },
    /// Requires the current time to be within a window.
    TimeRange {
        /// Start of the window, `HH:MM` in 24-hour format.
        after: String,
        /// End of the window, `HH:MM` in 24-hour format.
        before: String,
    },
    /// Requires the device to be currently available.
    Available { device: String },
    /// Requires the sun to be between two solar events of the current day.
    Sun {
        #[serde(default)]
        after: Option<SunEvent>,
        #[serde(default = "TimeDelta::zero", with = "offset", alias = "afterOffset")]
        after_offset: TimeDelta,
        #[serde(default)]
        before: Option<SunEvent>,
        #[serde(default = "TimeDelta::zero", with = "offset", alias = "beforeOffset")]
        before_offset: TimeDelta,
        /// Overrides the configured latitude.
        #[serde(default)]
        lat: Option<f64>,
        /// Overrides the configured longitude.
        #[serde(default, alias = "long")]
        lon: Option<f64>,
    },
}

/// Whether `now` (`HH:MM`) falls inside `[after, before]`.
///
/// A window whose end is before its start wraps around midnight.
#[must_use]
pub fn in_time_range(after: &str, before: &str, now: &str) -> bool {
    if after <= before {
        now >= after && now <= before
    } else {
        now >= after || now <= before
    }
}

impl Condition {
    /// Evaluate the condition.
    ///
    /// `lookup` resolves a device uid or entity id to its current snapshot.
    /// Unknown devices make device conditions false. Sun conditions are
    /// evaluated at `home` unless they name their own coordinates.
    pub fn evaluate<F>(&self, lookup: &F, now: Timestamp, home: Position) -> bool
    where
        F: Fn(&str) -> Option<Arc<StateSnapshot>>,
    {
        match self {
            Self::State {
                device,
                attribute,
                value,
            } => lookup(device)
                .and_then(|state| state.value(attribute))
                .is_some_and(|current| value.contains(&current)),
            Self::NumericState {
                device,
                attribute,
                above,
                below,
            } => lookup(device)
                .and_then(|state| state.value(attribute))
                .and_then(|current| match current {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                })
                .is_some_and(|current| between(current, *above, *below)),
            Self::And { conditions } => conditions.iter().all(|c| c.evaluate(lookup, now, home)),
            Self::Or { conditions } => conditions.iter().any(|c| c.evaluate(lookup, now, home)),
            Self::Not { conditions } => !conditions.iter().any(|c| c.evaluate(lookup, now, home)),
            Self::TimeRange { after, before } => {
                let now = now.format("%H:%M").to_string();
                in_time_range(after, before, &now)
            }
            Self::Available { device } => lookup(device).is_some_and(|state| state.available),
            Self::Sun {
                after,
                after_offset,
                before,
                before_offset,
                lat,
                lon,
            } => is_sun_between(
                now,
                home.or_override(*lat, *lon),
                after.map(|event| (event, *after_offset)),
                before.map(|event| (event, *before_offset)),
            ),
        }
    }

    /// Check the parts serde cannot, recursively.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptySunWindow`] for a sun condition
    /// without any bound.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Sun {
                after: None,
                before: None,
                ..
            } => Err(ValidationError::EmptySunWindow),
            Self::And { conditions } | Self::Or { conditions } | Self::Not { conditions } => {
                conditions.iter().try_for_each(Self::validate)
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::State {
                device, attribute, ..
            } => write!(f, "state({device}.{attribute})"),
            Self::NumericState {
                device, attribute, ..
            } => write!(f, "numeric_state({device}.{attribute})"),
            Self::And { conditions } => write!(f, "and({})", conditions.len()),
            Self::Or { conditions } => write!(f, "or({})", conditions.len()),
            Self::Not { conditions } => write!(f, "not({})", conditions.len()),
            Self::TimeRange { after, before } => write!(f, "time_range({after}..{before})"),
            Self::Available { device } => write!(f, "available({device})"),
            Self::Sun { after, before, .. } => {
                let after = after.map_or("midnight", SunEvent::as_str);
                let before = before.map_or("midnight", SunEvent::as_str);
                write!(f, "sun({after}..{before})")
            }
        }
    }
}
