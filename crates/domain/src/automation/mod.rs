//! Automation — trigger → condition → action rules.
//!
//! This module holds the declarative side of an automation: what fires it
//! ([`Trigger`]), what must hold ([`Condition`]), what it does ([`Action`])
//! and how overlapping runs are handled ([`Mode`]). The runtime lives in the
//! application layer.

mod action;
mod condition;
mod trigger;

pub use action::Action;
pub use condition::{Condition, in_time_range};
pub use trigger::{Trigger, between};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{SensesError, ValidationError};

/// Concurrency policy for overlapping executions of one automation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// One run at a time; new firings are rejected while running.
    #[default]
    Single,
    /// Up to `max_concurrency` runs; extra firings wait for a slot.
    Queued,
    /// Up to `max_concurrency` runs; extra firings are rejected.
    Parallel,
    /// One run at a time; a new firing cancels the running one.
    Restart,
}

impl Mode {
    /// Number of concurrent runs the mode allows.
    #[must_use]
    pub fn capacity(self, max_concurrency: usize) -> usize {
        match self {
            Self::Single | Self::Restart => 1,
            Self::Queued | Self::Parallel => max_concurrency.max(1),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Single => "single",
            Self::Queued => "queued",
            Self::Parallel => "parallel",
            Self::Restart => "restart",
        })
    }
}

/// Default bound for `queued` and `parallel` automations.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

/// Accept either a single item or a list of items.
///
/// # Errors
///
/// Propagates the item deserializer error.
pub fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(items) => items,
        OneOrMany::One(item) => vec![item],
    })
}

/// Same as [`one_or_many`] for optional lists.
///
/// # Errors
///
/// Propagates the item deserializer error.
pub fn option_one_or_many<'de, D, T>(deserializer: D) -> Result<Option<Vec<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<OneOrMany<T>>::deserialize(deserializer)?.map(|value| match value {
        OneOrMany::Many(items) => items,
        OneOrMany::One(item) => vec![item],
    }))
}

/// A named rule, as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationConfig {
    pub name: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_max_concurrency", alias = "maxConcurency")]
    pub max_concurrency: usize,
    #[serde(default, alias = "triggers", deserialize_with = "one_or_many")]
    pub trigger: Vec<Trigger>,
    #[serde(default, alias = "conditions", deserialize_with = "one_or_many")]
    pub condition: Vec<Condition>,
    #[serde(default, alias = "actions", deserialize_with = "one_or_many")]
    pub action: Vec<Action>,
}

impl AutomationConfig {
    /// Create a builder for constructing an [`AutomationConfig`].
    #[must_use]
    pub fn builder() -> AutomationBuilder {
        AutomationBuilder::default()
    }

    /// Check domain invariants.
    ///
    /// # Errors
    ///
    /// Returns [`SensesError::Validation`] when:
    /// - `name` is empty ([`ValidationError::EmptyName`])
    /// - `action` is empty ([`ValidationError::NoActions`])
    pub fn validate(&self) -> Result<(), SensesError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        if self.action.is_empty() {
            return Err(ValidationError::NoActions.into());
        }
        self.condition.iter().try_for_each(Condition::validate)?;
        Ok(())
    }

    /// Concurrent runs allowed by the configured mode.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mode.capacity(self.max_concurrency)
    }
}

/// Step-by-step builder for [`AutomationConfig`].
#[derive(Debug, Default)]
pub struct AutomationBuilder {
    name: Option<String>,
    mode: Option<Mode>,
    max_concurrency: Option<usize>,
    triggers: Vec<Trigger>,
    conditions: Vec<Condition>,
    actions: Vec<Action>,
}

impl AutomationBuilder {
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    #[must_use]
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    #[must_use]
    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    #[must_use]
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    #[must_use]
    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Consume the builder, validate, and return an [`AutomationConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`SensesError::Validation`] if required fields are missing or empty.
    pub fn build(self) -> Result<AutomationConfig, SensesError> {
        let config = AutomationConfig {
            name: self.name.unwrap_or_default(),
            mode: self.mode.unwrap_or_default(),
            max_concurrency: self.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY),
            trigger: self.triggers,
            condition: self.conditions,
            action: self.actions,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn sample_action() -> Action {
        Action::Delay {
            duration: Duration::from_secs(1),
        }
    }

    #[test]
    fn should_build_valid_automation() {
        let config = AutomationConfig::builder()
            .name("Hall light")
            .mode(Mode::Restart)
            .trigger(Trigger::Manual)
            .action(sample_action())
            .build()
            .unwrap();
        assert_eq!(config.name, "Hall light");
        assert_eq!(config.capacity(), 1);
        assert_eq!(config.max_concurrency, DEFAULT_MAX_CONCURRENCY);
    }

    #[test]
    fn should_reject_empty_name() {
        let result = AutomationConfig::builder().action(sample_action()).build();
        assert!(matches!(
            result,
            Err(SensesError::Validation(ValidationError::EmptyName))
        ));
    }

    #[test]
    fn should_reject_missing_actions() {
        let result = AutomationConfig::builder().name("x").build();
        assert!(matches!(
            result,
            Err(SensesError::Validation(ValidationError::NoActions))
        ));
    }

    #[test]
    fn should_reject_unbounded_sun_condition() {
        let config: AutomationConfig = serde_json::from_value(json!({
            "name": "Porch",
            "condition": [{"condition": "not", "conditions": [{"condition": "sun", "afterOffset": "1h"}]}],
            "action": [{"do": "cancel"}]
        }))
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(SensesError::Validation(ValidationError::EmptySunWindow))
        ));
    }

    #[test]
    fn should_compute_capacity_per_mode() {
        assert_eq!(Mode::Single.capacity(5), 1);
        assert_eq!(Mode::Restart.capacity(5), 1);
        assert_eq!(Mode::Queued.capacity(5), 5);
        assert_eq!(Mode::Parallel.capacity(0), 1);
    }

    #[test]
    fn should_deserialize_single_items_and_lists() {
        let config: AutomationConfig = serde_json::from_value(json!({
            "name": "Night light",
            "mode": "queued",
            "maxConcurency": 2,
            "trigger": {"on": "state", "device": "sensor.motion", "to": "on"},
            "condition": [{"condition": "time_range", "after": "22:00", "before": "06:00"}],
            "action": [
                {"do": "set_state", "device": ["light.hall"], "state": {"state": "on"}},
                {"do": "delay", "duration": "5m"}
            ]
        }))
        .unwrap();

        assert_eq!(config.mode, Mode::Queued);
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.trigger.len(), 1);
        assert_eq!(config.condition.len(), 1);
        assert_eq!(config.action.len(), 2);
        assert_eq!(
            config.action[1],
            Action::Delay {
                duration: Duration::from_secs(300)
            }
        );
    }

    #[test]
    fn should_reject_unknown_mode() {
        let result: Result<AutomationConfig, _> =
            serde_json::from_value(json!({"name": "x", "mode": "serial"}));
        assert!(result.is_err());
    }
}
