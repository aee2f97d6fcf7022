//! Cron schedules for time-based triggers.
//!
//! Expressions are evaluated in local time. Five fields
//! (`minute hour day month weekday`) fire at second zero; six or seven
//! fields start with seconds and may end with a year.

use std::str::FromStr;

use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::time::Timestamp;

/// Cron expression used when a schedule names none.
pub const EVERY_MINUTE: &str = "* * * * *";

#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// Parse a cron expression.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidCron`] for malformed expressions.
    pub fn parse(expression: &str) -> Result<Self, ValidationError> {
        let expression = expression.trim();
        let expanded = if expression.split_whitespace().count() == 5 {
            format!("0 {expression}")
        } else {
            expression.to_string()
        };
        let schedule = cron::Schedule::from_str(&expanded).map_err(|err| ValidationError::InvalidCron {
            expression: expression.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First firing strictly after `after`, or `None` once the schedule is exhausted.
    #[must_use]
    pub fn next_after(&self, after: Timestamp) -> Option<Timestamp> {
        self.schedule
            .after(&after.with_timezone(&Local))
            .next()
            .map(|at| at.with_timezone(&Utc))
    }
}

impl TryFrom<String> for CronSchedule {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CronSchedule> for String {
    fn from(value: CronSchedule) -> Self {
        value.expression
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl std::fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}
