//! Topic routes and the payload formats they speak.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value, json};

use crate::error::{DecodeError, SensesError};
use crate::template;
use crate::topic::{Bindings, TopicPattern};

/// Field name used when a scalar payload arrives on a route without a name.
pub const DEFAULT_FIELD: &str = "value";

const TRUTHY: &[&str] = &["true", "1", "on", "yes", "ok", "valid", "available", "online"];
const FALSY: &[&str] = &["false", "0", "off", "no", "unavailable", "offline", ""];

/// How a payload is turned into a value and back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    String,
    Number,
    Boolean,
    /// JSON when the text parses, the text itself otherwise.
    Raw,
    /// A JSON object whose keys become state fields.
    #[default]
    Json,
    List,
    /// Rendered through the route template.
    Template,
    /// Carries no data.
    Void,
}

impl Format {
    /// Decode a payload into a single value. `Void` yields `Null`.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] when the payload does not fit the format, or
    /// a template error when rendering fails.
    pub fn decode(self, payload: &str, template: Option<&str>) -> Result<Value, SensesError> {
        let value = match self {
            Self::String => Value::String(payload.to_string()),
            Self::Number => parse_number(payload.trim())?,
            Self::Boolean => Value::Bool(parse_bool(payload)?),
            Self::Raw => serde_json::from_str(payload)
                .unwrap_or_else(|_| Value::String(payload.to_string())),
            Self::Json => serde_json::from_str(payload).map_err(DecodeError::from)?,
            Self::List => match serde_json::from_str::<Value>(payload) {
                Ok(Value::Array(items)) => Value::Array(items),
                _ => payload
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(|item| Value::String(item.to_string()))
                    .collect(),
            },
            Self::Template => {
                let source = template.ok_or(DecodeError::MissingTemplate)?;
                let parsed = serde_json::from_str::<Value>(payload).unwrap_or(Value::Null);
                let rendered = template::render(source, json!({"value": payload, "json": parsed}))?;
                serde_json::from_str(&rendered).unwrap_or(Value::String(rendered))
            }
            Self::Void => Value::Null,
        };
        Ok(value)
    }

    /// Encode a value into an outgoing payload.
    ///
    /// `context` is only read by [`Format::Template`].
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] when the value cannot be represented in the
    /// format, or a template error when rendering fails.
    pub fn encode(
        self,
        value: &Value,
        template: Option<&str>,
        context: &Value,
    ) -> Result<String, SensesError> {
        let payload = match self {
            Self::Number => match value {
                Value::Number(num) => num.to_string(),
                Value::Bool(flag) => u8::from(*flag).to_string(),
                Value::String(text) => parse_number(text.trim())?.to_string(),
                other => return Err(DecodeError::Number(other.to_string()).into()),
            },
            Self::String | Self::Raw => match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            },
            Self::Boolean => match value {
                Value::Bool(flag) => flag.to_string(),
                Value::Number(num) => (num.as_f64() != Some(0.0)).to_string(),
                Value::String(text) => parse_bool(text)?.to_string(),
                other => return Err(DecodeError::Boolean(other.to_string()).into()),
            },
            Self::Json => serde_json::to_string(value).map_err(DecodeError::from)?,
            Self::List => match value {
                Value::Array(_) => value.to_string(),
                Value::Null => "[]".to_string(),
                other => Value::Array(vec![other.clone()]).to_string(),
            },
            Self::Template => {
                let source = template.ok_or(DecodeError::MissingTemplate)?;
                template::render(source, context)?
            }
            Self::Void => String::new(),
        };
        Ok(payload)
    }
}

fn parse_number(text: &str) -> Result<Value, DecodeError> {
    if let Ok(int) = text.parse::<i64>() {
        return Ok(Value::from(int));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| DecodeError::Number(text.to_string()))
}

fn parse_bool(text: &str) -> Result<bool, DecodeError> {
    let lowered = text.trim().to_ascii_lowercase();
    if TRUTHY.contains(&lowered.as_str()) {
        Ok(true)
    } else if FALSY.contains(&lowered.as_str()) {
        Ok(false)
    } else {
        Err(DecodeError::Boolean(text.to_string()))
    }
}

/// A bidirectional mapping between a topic pattern and device state fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicRoute {
    pub topic: TopicPattern,
    /// Single state field carried by this route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub format: Format,
    /// Only these field names are allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<Vec<String>>,
    /// These field names are refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_contains: Option<Vec<String>>,
    /// Keep only these fields after decoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pick: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default)]
    pub qos: u8,
}

impl TopicRoute {
    #[must_use]
    pub fn new(topic: TopicPattern) -> Self {
        Self {
            topic,
            name: None,
            format: Format::Json,
            contains: None,
            not_contains: None,
            pick: None,
            template: None,
            qos: 0,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_contains(mut self, fields: &[&str]) -> Self {
        self.contains = Some(fields.iter().map(ToString::to_string).collect());
        self
    }

    #[must_use]
    pub fn with_not_contains(mut self, fields: &[&str]) -> Self {
        self.not_contains = Some(fields.iter().map(ToString::to_string).collect());
        self
    }

    #[must_use]
    pub fn with_pick(mut self, fields: &[&str]) -> Self {
        self.pick = Some(fields.iter().map(ToString::to_string).collect());
        self
    }

    #[must_use]
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    /// Whether a single field name passes the include/exclude filters.
    #[must_use]
    pub fn allows(&self, field: &str) -> bool {
        let included = self
            .contains
            .as_ref()
            .is_none_or(|list| list.iter().any(|f| f == field));
        let excluded = self
            .not_contains
            .as_ref()
            .is_some_and(|list| list.iter().any(|f| f == field));
        included && !excluded
    }

    /// Whether every field name passes the filters.
    pub fn allows_all<'a>(&self, mut fields: impl Iterator<Item = &'a String>) -> bool {
        fields.all(|field| self.allows(field))
    }

    /// Field name for scalar formats: the route name, else the `name` topic
    /// binding, else [`DEFAULT_FIELD`].
    #[must_use]
    pub fn field_name<'a>(&'a self, bindings: &'a Bindings) -> &'a str {
        self.name
            .as_deref()
            .or_else(|| bindings.get("name").map(String::as_str))
            .unwrap_or(DEFAULT_FIELD)
    }

    /// Decode an inbound payload into state fields.
    ///
    /// Objects decoded by [`Format::Json`] contribute their keys, every
    /// other format contributes a single field named by
    /// [`TopicRoute::field_name`]. Unknown keys are kept; filtering is the
    /// caller's concern.
    ///
    /// # Errors
    ///
    /// Propagates [`Format::decode`] failures.
    pub fn decode(&self, payload: &str, bindings: &Bindings) -> Result<Map<String, Value>, SensesError> {
        let value = self.format.decode(payload, self.template.as_deref())?;
        let mut fields = Map::new();
        match (self.format, value) {
            (Format::Void, _) => {}
            (Format::Json, Value::Object(object)) if self.name.is_none() => fields = object,
            (Format::Json, other) if self.name.is_none() && !bindings.contains_key("name") => {
                return Err(DecodeError::NotAnObject(json_type(&other)).into());
            }
            (_, value) => {
                fields.insert(self.field_name(bindings).to_string(), value);
            }
        }
        Ok(fields)
    }

    /// Encode an outgoing value for this route.
    ///
    /// # Errors
    ///
    /// Propagates [`Format::encode`] failures.
    pub fn encode(&self, value: &Value, context: &Value) -> Result<String, SensesError> {
        self.format.encode(value, self.template.as_deref(), context)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(topic: &str) -> TopicRoute {
        TopicRoute::new(TopicPattern::parse(topic).unwrap())
    }

    #[test]
    fn should_decode_json_object_into_fields() {
        let fields = route("a/state")
            .decode(r#"{"state":"on","brightness":12}"#, &Bindings::new())
            .unwrap();
        assert_eq!(fields.get("state"), Some(&json!("on")));
        assert_eq!(fields.get("brightness"), Some(&json!(12)));
    }

    #[test]
    fn should_reject_json_scalar_without_field_name() {
        let err = route("a/state").decode("12", &Bindings::new()).unwrap_err();
        assert!(matches!(err, SensesError::Decode(DecodeError::NotAnObject("number"))));
    }

    #[test]
    fn should_reject_invalid_json() {
        let err = route("a/state").decode("{oops", &Bindings::new()).unwrap_err();
        assert!(matches!(err, SensesError::Decode(DecodeError::Json(_))));
    }

    #[test]
    fn should_decode_number_under_route_name() {
        let fields = route("a/temp")
            .with_name("temperature")
            .with_format(Format::Number)
            .decode(" 21.5 ", &Bindings::new())
            .unwrap();
        assert_eq!(fields.get("temperature"), Some(&json!(21.5)));
    }

    #[test]
    fn should_use_name_binding_then_default_field() {
        let mut bindings = Bindings::new();
        bindings.insert("name".to_string(), "humidity".to_string());
        let by_binding = route("a/+name")
            .with_format(Format::Number)
            .decode("40", &bindings)
            .unwrap();
        assert_eq!(by_binding.get("humidity"), Some(&json!(40)));

        let by_default = route("a/b")
            .with_format(Format::String)
            .decode("hello", &Bindings::new())
            .unwrap();
        assert_eq!(by_default.get(DEFAULT_FIELD), Some(&json!("hello")));
    }

    #[test]
    fn should_decode_booleans_from_common_words() {
        let r = route("a/b").with_name("on").with_format(Format::Boolean);
        assert_eq!(r.decode("ON", &Bindings::new()).unwrap()["on"], json!(true));
        assert_eq!(r.decode("off", &Bindings::new()).unwrap()["on"], json!(false));
        assert!(r.decode("maybe", &Bindings::new()).is_err());
    }

    #[test]
    fn should_decode_list_from_json_or_csv() {
        let r = route("a/b").with_name("items").with_format(Format::List);
        assert_eq!(r.decode("[1,2]", &Bindings::new()).unwrap()["items"], json!([1, 2]));
        assert_eq!(r.decode("a, b", &Bindings::new()).unwrap()["items"], json!(["a", "b"]));
    }

    #[test]
    fn should_decode_raw_as_json_or_text() {
        let r = route("a/b").with_name("raw").with_format(Format::Raw);
        assert_eq!(r.decode("12", &Bindings::new()).unwrap()["raw"], json!(12));
        assert_eq!(r.decode("text", &Bindings::new()).unwrap()["raw"], json!("text"));
    }

    #[test]
    fn should_decode_template_output() {
        let r = route("a/b")
            .with_name("temperature")
            .with_format(Format::Template)
            .with_template("{{ json.temp }}");
        let fields = r.decode(r#"{"temp": 19}"#, &Bindings::new()).unwrap();
        assert_eq!(fields["temperature"], json!(19));
    }

    #[test]
    fn should_decode_void_to_nothing() {
        let fields = route("a/b")
            .with_format(Format::Void)
            .decode("whatever", &Bindings::new())
            .unwrap();
        assert!(fields.is_empty());
    }

    #[test]
    fn should_encode_number_as_bare_text() {
        let r = route("a/b").with_format(Format::Number);
        assert_eq!(r.encode(&json!(80), &Value::Null).unwrap(), "80");
        assert_eq!(r.encode(&json!("80"), &Value::Null).unwrap(), "80");
        assert!(r.encode(&json!({"a": 1}), &Value::Null).is_err());
    }

    #[test]
    fn should_encode_string_without_quotes() {
        let r = route("a/b").with_format(Format::String);
        assert_eq!(r.encode(&json!("on"), &Value::Null).unwrap(), "on");
    }

    #[test]
    fn should_encode_json_and_void() {
        let json_route = route("a/b");
        assert_eq!(json_route.encode(&json!({"a": 1}), &Value::Null).unwrap(), r#"{"a":1}"#);
        let void = route("a/b").with_format(Format::Void);
        assert_eq!(void.encode(&json!(1), &Value::Null).unwrap(), "");
    }

    #[test]
    fn should_encode_template_against_context() {
        let r = route("a/b")
            .with_format(Format::Template)
            .with_template("{{ device.uid }}={{ value }}");
        let out = r
            .encode(&json!(3), &json!({"value": 3, "device": {"uid": "lamp"}}))
            .unwrap();
        assert_eq!(out, "lamp=3");
    }

    #[test]
    fn should_apply_include_and_exclude_filters() {
        let r = route("a/b")
            .with_contains(&["temperature", "humidity"])
            .with_not_contains(&["humidity"]);
        assert!(r.allows("temperature"));
        assert!(!r.allows("humidity"));
        assert!(!r.allows("pressure"));
        assert!(route("a/b").allows("anything"));
    }

    #[test]
    fn should_deserialize_route_with_defaults() {
        let r: TopicRoute = serde_json::from_value(json!({"topic": "a/+uid/set"})).unwrap();
        assert_eq!(r.format, Format::Json);
        assert_eq!(r.qos, 0);
    }
}
