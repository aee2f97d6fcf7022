//! Device kinds — per-type translation between wire fields and state.

use std::fmt;

use serde_json::{Map, Value};

use crate::handshake::Handshake;

/// Behaviour specific to one type of device.
///
/// Decoded payload fields go through [`DeviceKind::map_state`] before they
/// reach the snapshot, and outgoing partial state goes through
/// [`DeviceKind::create_payload`] before it is routed to topics.
pub trait DeviceKind: fmt::Debug + Send + Sync {
    /// Short type tag such as `light`.
    fn type_name(&self) -> &str;

    /// Fields a freshly created device starts with.
    fn initial_state(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Translate decoded wire fields into state fields.
    fn map_state(&self, fields: Map<String, Value>) -> Map<String, Value> {
        fields
    }

    /// Translate a partial state into wire fields.
    fn create_payload(&self, partial: Map<String, Value>) -> Map<String, Value> {
        partial
    }

    /// Whether the device accepts state changes at all.
    fn writable(&self) -> bool {
        true
    }
}

/// Pass-through kind for any device without dedicated handling.
#[derive(Debug, Clone)]
pub struct GenericKind {
    type_name: String,
}

impl GenericKind {
    #[must_use]
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
        }
    }
}

impl DeviceKind for GenericKind {
    fn type_name(&self) -> &str {
        &self.type_name
    }
}

fn on_off_from_wire(value: &Value) -> Value {
    match value {
        Value::Number(num) => match num.as_i64() {
            Some(0) => Value::from("off"),
            Some(1) => Value::from("on"),
            _ => Value::from("unknown"),
        },
        Value::Bool(true) => Value::from("on"),
        Value::Bool(false) => Value::from("off"),
        other => other.clone(),
    }
}

fn on_off_to_wire(value: &Value) -> Value {
    match value {
        Value::String(text) if text == "on" => Value::from(1),
        Value::String(text) if text == "off" => Value::from(0),
        Value::Bool(flag) => Value::from(u8::from(*flag)),
        other => other.clone(),
    }
}

/// Turnable light with optional brightness, effect and RGB colour.
#[derive(Debug, Clone, Default)]
pub struct LightKind;

impl DeviceKind for LightKind {
    fn type_name(&self) -> &str {
        "light"
    }

    fn initial_state(&self) -> Map<String, Value> {
        let mut state = Map::new();
        state.insert("state".to_string(), Value::from("unknown"));
        state.insert("brightness".to_string(), Value::from(0));
        state
    }

    fn map_state(&self, mut fields: Map<String, Value>) -> Map<String, Value> {
        if let Some(switch) = fields.remove("switch") {
            fields.insert("state".to_string(), on_off_from_wire(&switch));
        }
        if let Some(state) = fields.get_mut("state") {
            *state = on_off_from_wire(state);
        }
        if let Some(effect) = fields.get_mut("effect") {
            if let Some(float) = effect.as_f64() {
                #[allow(clippy::cast_possible_truncation)]
                let truncated = float.trunc() as i64;
                *effect = Value::from(truncated);
            }
        }
        if let (Some(r), Some(g), Some(b)) = (
            channel(&fields, "r"),
            channel(&fields, "g"),
            channel(&fields, "b"),
        ) {
            for key in ["r", "g", "b"] {
                fields.remove(key);
            }
            fields.insert(
                "rgbColor".to_string(),
                Value::from(format!("#{r:02x}{g:02x}{b:02x}")),
            );
        }
        fields
    }

    fn create_payload(&self, mut partial: Map<String, Value>) -> Map<String, Value> {
        if let Some(state) = partial.get_mut("state") {
            *state = on_off_to_wire(state);
        }
        if let Some(color) = partial.remove("rgbColor") {
            if let Some((r, g, b)) = color.as_str().and_then(parse_hex_color) {
                partial.insert("r".to_string(), Value::from(r));
                partial.insert("g".to_string(), Value::from(g));
                partial.insert("b".to_string(), Value::from(b));
            }
        }
        partial
    }
}

fn channel(fields: &Map<String, Value>, key: &str) -> Option<u8> {
    fields
        .get(key)
        .and_then(Value::as_f64)
        .filter(|value| (0.0..=255.0).contains(value))
        .map(|value| {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let byte = value as u8;
            byte
        })
}

fn parse_hex_color(text: &str) -> Option<(u8, u8, u8)> {
    let hex = text.strip_prefix('#')?;
    if hex.len() != 6 {
        return None;
    }
    let byte = |range: std::ops::Range<usize>| u8::from_str_radix(hex.get(range)?, 16).ok();
    Some((byte(0..2)?, byte(2..4)?, byte(4..6)?))
}

/// On/off switch.
#[derive(Debug, Clone, Default)]
pub struct SwitchKind;

impl DeviceKind for SwitchKind {
    fn type_name(&self) -> &str {
        "switch"
    }

    fn initial_state(&self) -> Map<String, Value> {
        let mut state = Map::new();
        state.insert("state".to_string(), Value::from("unknown"));
        state
    }

    fn map_state(&self, mut fields: Map<String, Value>) -> Map<String, Value> {
        if let Some(switch) = fields.remove("switch") {
            fields.insert("state".to_string(), on_off_from_wire(&switch));
        }
        if let Some(state) = fields.get_mut("state") {
            *state = on_off_from_wire(state);
        }
        fields
    }

    fn create_payload(&self, mut partial: Map<String, Value>) -> Map<String, Value> {
        if let Some(state) = partial.get_mut("state") {
            *state = on_off_to_wire(state);
        }
        partial
    }
}

/// Read-only sensor exposing a single numeric `value`.
#[derive(Debug, Clone)]
pub struct SensorKind {
    field: String,
    unit: Option<String>,
}

impl SensorKind {
    /// Sensor reading its value from `field` in incoming payloads.
    #[must_use]
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            unit: None,
        }
    }

    /// Sensor configured from the handshake's `additional.field` and `additional.unit`.
    #[must_use]
    pub fn from_handshake(shake: &Handshake) -> Self {
        let text = |key: &str| {
            shake
                .additional
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Self {
            field: text("field").unwrap_or_else(|| "value".to_string()),
            unit: text("unit"),
        }
    }

    #[must_use]
    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }
}

impl DeviceKind for SensorKind {
    fn type_name(&self) -> &str {
        "sensor"
    }

    fn initial_state(&self) -> Map<String, Value> {
        let mut state = Map::new();
        state.insert("value".to_string(), Value::from(0));
        state
    }

    fn map_state(&self, fields: Map<String, Value>) -> Map<String, Value> {
        let mut state = Map::new();
        let raw = fields.get(&self.field).or_else(|| fields.get("value"));
        let number = match raw {
            Some(Value::Number(num)) => Some(Value::Number(num.clone())),
            Some(Value::String(text)) => text.trim().parse::<f64>().ok().map(Value::from),
            Some(Value::Bool(flag)) => Some(Value::from(u8::from(*flag))),
            _ => None,
        };
        if let Some(number) = number {
            state.insert("value".to_string(), number);
        }
        state
    }

    fn create_payload(&self, _partial: Map<String, Value>) -> Map<String, Value> {
        Map::new()
    }

    fn writable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn should_map_light_switch_to_state() {
        let state = LightKind.map_state(map(json!({"switch": 1, "brightness": 80})));
        assert_eq!(state["state"], json!("on"));
        assert_eq!(state["brightness"], json!(80));
        assert!(!state.contains_key("switch"));
    }

    #[test]
    fn should_map_light_numeric_state_and_rgb() {
        let state = LightKind.map_state(map(json!({"state": 0, "r": 202, "g": 50, "b": 7, "effect": 2.7})));
        assert_eq!(state["state"], json!("off"));
        assert_eq!(state["rgbColor"], json!("#ca3207"));
        assert_eq!(state["effect"], json!(2));
    }

    #[test]
    fn should_create_light_payload_from_state() {
        let payload = LightKind.create_payload(map(json!({"state": "on", "rgbColor": "#ca3207"})));
        assert_eq!(payload["state"], json!(1));
        assert_eq!(payload["r"], json!(202));
        assert_eq!(payload["g"], json!(50));
        assert_eq!(payload["b"], json!(7));
    }

    #[test]
    fn should_map_sensor_field_to_value() {
        let sensor = SensorKind::new("temperature");
        let state = sensor.map_state(map(json!({"temperature": "21.5", "battery": 90})));
        assert_eq!(state, map(json!({"value": 21.5})));
        assert!(!sensor.writable());
    }

    #[test]
    fn should_ignore_sensor_payload_without_value() {
        let state = SensorKind::new("value").map_state(map(json!({"battery": 90})));
        assert!(state.is_empty());
    }

    #[test]
    fn should_configure_sensor_from_handshake() {
        let mut shake = Handshake::new("s", "device/sensor");
        shake.additional.insert("field".to_string(), json!("lux"));
        shake.additional.insert("unit".to_string(), json!("lx"));
        let sensor = SensorKind::from_handshake(&shake);
        assert_eq!(sensor.unit(), Some("lx"));
        assert_eq!(sensor.map_state(map(json!({"lux": 300})))["value"], json!(300));
    }

    #[test]
    fn should_pass_generic_fields_through() {
        let kind = GenericKind::new("thermostat");
        let fields = map(json!({"target": 20}));
        assert_eq!(kind.map_state(fields.clone()), fields);
        assert_eq!(kind.type_name(), "thermostat");
    }

    #[test]
    fn should_map_switch_booleans() {
        let state = SwitchKind.map_state(map(json!({"state": true})));
        assert_eq!(state["state"], json!("on"));
        let payload = SwitchKind.create_payload(map(json!({"state": "off"})));
        assert_eq!(payload["state"], json!(0));
    }
}
