//! Immutable device state snapshots.

use std::sync::Arc;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::time::Timestamp;

/// Reserved key carrying the derived availability.
pub const AVAILABLE_KEY: &str = "_available";
/// Reserved key carrying the update timestamp (epoch millis on the wire).
pub const UPDATED_AT_KEY: &str = "_updatedAt";

/// One immutable view of a device's state.
///
/// Snapshots are replaced as a whole, never edited in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    pub fields: Map<String, Value>,
    pub available: bool,
    pub updated_at: Option<Timestamp>,
}

impl StateSnapshot {
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            available: false,
            updated_at: None,
        }
    }

    /// Look up a field, including the two reserved keys.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<Value> {
        match key {
            AVAILABLE_KEY => Some(Value::Bool(self.available)),
            UPDATED_AT_KEY => self
                .updated_at
                .map(|ts| Value::from(ts.timestamp_millis())),
            _ => self.fields.get(key).cloned(),
        }
    }

    /// Field-level equality, ignoring the update timestamp.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        self.available == other.available && self.fields == other.fields
    }

    /// Flat JSON form with the reserved keys next to the fields.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert(AVAILABLE_KEY.to_string(), Value::Bool(self.available));
        object.insert(
            UPDATED_AT_KEY.to_string(),
            self.updated_at
                .map_or(Value::from(0), |ts| Value::from(ts.timestamp_millis())),
        );
        Value::Object(object)
    }
}

impl Serialize for StateSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// A state transition: the previous and the new snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub old: Arc<StateSnapshot>,
    pub new: Arc<StateSnapshot>,
}

impl StateChange {
    /// Keys whose value differs between the two snapshots.
    #[must_use]
    pub fn changed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .old
            .fields
            .keys()
            .chain(self.new.fields.keys())
            .filter(|key| self.old.fields.get(*key) != self.new.fields.get(*key))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        if self.old.available != self.new.available {
            keys.push(AVAILABLE_KEY.to_string());
        }
        keys
    }
}
