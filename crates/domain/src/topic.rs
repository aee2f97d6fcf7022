//! Topic patterns with named wildcard segments.
//!
//! A pattern is a `/`-separated list of segments. Each segment is a literal,
//! a single-level wildcard (`+` or `+name`) or, in last position only, a
//! multi-level wildcard (`#` or `#name`). Named wildcards work both ways:
//! [`TopicPattern::extract`] reads them out of a concrete topic and
//! [`TopicPattern::fill`] writes them into an outgoing one.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{TemplateError, ValidationError};

/// Named wildcard bindings, keyed by parameter name.
pub type Bindings = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    Single(Option<String>),
    Multi(Option<String>),
}

/// A parsed topic pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

fn name_of(rest: &str) -> Option<String> {
    (!rest.is_empty()).then(|| rest.to_string())
}

impl TopicPattern {
    /// Parse a pattern.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidPattern`] when the pattern is empty
    /// or a multi-level wildcard is not the last segment.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        if raw.is_empty() {
            return Err(ValidationError::InvalidPattern {
                pattern: raw.to_string(),
                reason: "pattern is empty",
            });
        }
        let parts: Vec<&str> = raw.split('/').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());
        for (index, part) in parts.into_iter().enumerate() {
            let segment = if let Some(rest) = part.strip_prefix('+') {
                Segment::Single(name_of(rest))
            } else if let Some(rest) = part.strip_prefix('#') {
                if index != last {
                    return Err(ValidationError::InvalidPattern {
                        pattern: raw.to_string(),
                        reason: "'#' must be the last segment",
                    });
                }
                Segment::Multi(name_of(rest))
            } else {
                Segment::Literal(part.to_string())
            };
            segments.push(segment);
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Names of every named wildcard, in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Single(Some(name)) | Segment::Multi(Some(name)) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Whether `topic` matches the pattern.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        self.extract(topic).is_some()
    }

    /// Named bindings extracted from `topic`, or `None` when it does not match.
    #[must_use]
    pub fn extract(&self, topic: &str) -> Option<Bindings> {
        let parts: Vec<&str> = topic.split('/').collect();
        let mut bindings = Bindings::new();
        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Multi(name) => {
                    if let Some(name) = name {
                        let rest = parts.get(index..).unwrap_or_default().join("/");
                        bindings.insert(name.clone(), rest);
                    }
                    return Some(bindings);
                }
                Segment::Single(name) => {
                    let part = parts.get(index)?;
                    if let Some(name) = name {
                        bindings.insert(name.clone(), (*part).to_string());
                    }
                }
                Segment::Literal(literal) => {
                    if parts.get(index) != Some(&literal.as_str()) {
                        return None;
                    }
                }
            }
        }
        (parts.len() == self.segments.len()).then_some(bindings)
    }

    /// Substitute every `+name` segment with `bindings[name]`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::MissingBinding`] when a wildcard has no
    /// binding (anonymous `+` never has one) and [`TemplateError::Wildcard`]
    /// when the pattern ends with `#`.
    pub fn fill(&self, bindings: &Bindings) -> Result<String, TemplateError> {
        let mut parts = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(literal) => parts.push(literal.as_str()),
                Segment::Single(name) => {
                    let name = name.as_deref().unwrap_or("+");
                    let value = bindings
                        .get(name)
                        .ok_or_else(|| TemplateError::MissingBinding(name.to_string()))?;
                    parts.push(value.as_str());
                }
                Segment::Multi(_) => return Err(TemplateError::Wildcard(self.raw.clone())),
            }
        }
        Ok(parts.join("/"))
    }

    /// The pattern with every named wildcard reduced to its bus-level form.
    #[must_use]
    pub fn normalize(&self) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(literal) => literal.as_str(),
                Segment::Single(_) => "+",
                Segment::Multi(_) => "#",
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for TopicPattern {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for TopicPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for TopicPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Shorthand for [`TopicPattern::matches`]; invalid patterns never match.
#[must_use]
pub fn matches(pattern: &str, topic: &str) -> bool {
    TopicPattern::parse(pattern).is_ok_and(|pattern| pattern.matches(topic))
}

/// Shorthand for [`TopicPattern::extract`]; invalid patterns never match.
#[must_use]
pub fn extract(pattern: &str, topic: &str) -> Option<Bindings> {
    TopicPattern::parse(pattern)
        .ok()
        .and_then(|pattern| pattern.extract(topic))
}
