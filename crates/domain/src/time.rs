//! Time, timestamp and duration helpers.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serializer};
use serde_json::Value;

use crate::error::ValidationError;

/// UTC timestamp used for `updated_at`, `last_alive`, event times, etc.
pub type Timestamp = DateTime<Utc>;

/// Return the current UTC time.
#[must_use]
pub fn now() -> Timestamp {
    Utc::now()
}

/// Interpret a payload timestamp.
///
/// Accepts epoch milliseconds (as a number or a numeric string), RFC 3339
/// dates and naive ISO dates (read as UTC). Returns `None` for anything else.
#[must_use]
pub fn parse_timestamp(value: &Value) -> Option<Timestamp> {
    match value {
        Value::Number(num) => num
            .as_i64()
            .or_else(|| num.as_f64().map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        Value::String(text) => parse_timestamp_str(text.trim()),
        _ => None,
    }
}

fn parse_timestamp_str(text: &str) -> Option<Timestamp> {
    if let Ok(millis) = text.parse::<i64>() {
        return DateTime::from_timestamp_millis(millis);
    }
    if let Ok(date) = DateTime::parse_from_rfc3339(text) {
        return Some(date.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Parse a human duration such as `"5s"`, `"1m 30s"` or a bare millisecond count.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidDuration`] when the text is neither.
pub fn parse_duration(text: &str) -> Result<Duration, ValidationError> {
    let text = text.trim();
    if let Ok(millis) = text.parse::<u64>() {
        return Ok(Duration::from_millis(millis));
    }
    humantime::parse_duration(text).map_err(|_| ValidationError::InvalidDuration(text.to_string()))
}

/// Parse an offset that may be negative, such as `"-30m"`, `"+1h"` or `-5000`.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidDuration`] when the magnitude does not parse.
pub fn parse_offset(text: &str) -> Result<TimeDelta, ValidationError> {
    let text = text.trim();
    let (negative, magnitude) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let magnitude = TimeDelta::from_std(parse_duration(magnitude)?)
        .map_err(|_| ValidationError::InvalidDuration(text.to_string()))?;
    Ok(if negative { -magnitude } else { magnitude })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOffset {
    Millis(i64),
    Text(String),
}

/// Serde adapter for signed offsets relative to an event.
pub mod offset {
    use super::{Deserialize, Deserializer, RawOffset, Serializer, TimeDelta, parse_offset};

    /// Serialize as a humantime string with a leading `-` when negative.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error> {
        let magnitude = value.abs().to_std().unwrap_or_default();
        let sign = if *value < TimeDelta::zero() { "-" } else { "" };
        serializer.collect_str(&format_args!("{sign}{}", humantime::format_duration(magnitude)))
    }

    /// Deserialize from signed milliseconds or an offset string.
    ///
    /// # Errors
    ///
    /// Fails on values that are neither.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimeDelta, D::Error> {
        match RawOffset::deserialize(deserializer)? {
            RawOffset::Millis(ms) => Ok(TimeDelta::milliseconds(ms)),
            RawOffset::Text(text) => parse_offset(&text).map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Millis(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration<E: serde::de::Error>(self) -> Result<Duration, E> {
        match self {
            Self::Millis(ms) => Ok(Duration::from_millis(ms)),
            Self::Text(text) => parse_duration(&text).map_err(E::custom),
        }
    }
}

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub mod duration_ms {
    use super::{Deserialize, Deserializer, Duration, RawDuration, Serializer};

    /// Serialize as milliseconds.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize from milliseconds or a human duration string.
    ///
    /// # Errors
    ///
    /// Fails on values that are neither.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        RawDuration::deserialize(deserializer)?.into_duration()
    }
}

/// Serde adapter storing a [`Duration`] as a human-readable string (`"1m 30s"`).
pub mod human_duration {
    use super::{Deserialize, Deserializer, Duration, RawDuration, Serializer};

    /// Serialize as a humantime string.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    /// Deserialize from milliseconds or a human duration string.
    ///
    /// # Errors
    ///
    /// Fails on values that are neither.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        RawDuration::deserialize(deserializer)?.into_duration()
    }

    /// Same as the parent module, for optional fields.
    pub mod option {
        use super::{Deserialize, Deserializer, Duration, RawDuration, Serializer};

        /// Serialize as a humantime string, or `null`.
        ///
        /// # Errors
        ///
        /// Propagates serializer errors.
        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => serializer.collect_str(&humantime::format_duration(*duration)),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional duration.
        ///
        /// # Errors
        ///
        /// Fails on values that are neither milliseconds nor a duration string.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<RawDuration>::deserialize(deserializer)?
                .map(RawDuration::into_duration)
                .transpose()
        }
    }
}
