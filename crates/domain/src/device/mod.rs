//! Device — runtime representation of a physical or virtual endpoint.
//!
//! A device owns an ordered list of [`TopicRoute`]s per direction and an
//! immutable [`StateSnapshot`]. Inbound messages are decoded by the first
//! matching state route; outbound partial states fan out over every set route.
//! Availability is derived from keepalive tracking on every transition.

mod config;
mod driver;
mod kind;
mod route;
mod state;

pub use config::DeviceConfig;
pub use driver::{DriverRegistry, KindFactory, kind_factory};
pub use kind::{DeviceKind, GenericKind, LightKind, SensorKind, SwitchKind};
pub use route::{DEFAULT_FIELD, Format, TopicRoute};
pub use state::{AVAILABLE_KEY, StateChange, StateSnapshot, UPDATED_AT_KEY};

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::error::{SensesError, ValidationError};
use crate::handshake::{ChannelRole, CommChannel, Handshake};
use crate::time::{Timestamp, parse_timestamp};
use crate::topic::{Bindings, TopicPattern};

/// Descriptive, non-behavioural device metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub driver: Option<String>,
    pub description: Option<String>,
}

/// A single message to publish on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
}

/// A set route that could not produce its message.
#[derive(Debug, thiserror::Error)]
#[error("route {route:?} failed")]
pub struct RouteError {
    pub route: String,
    #[source]
    pub source: SensesError,
}

/// What happened to an inbound message once a route matched.
#[derive(Debug)]
pub enum MessageOutcome {
    /// A field name failed the route filters; the whole message is dropped.
    Filtered,
    /// The payload did not fit the route format.
    Invalid(SensesError),
    /// Nothing remained after mapping and picking.
    Empty,
    /// An incremental device received an update that is not newer.
    Stale,
    /// The resulting snapshot equals the current one.
    Unchanged,
    /// The snapshot was replaced.
    Changed(StateChange),
}

/// Result of dispatching an inbound message to a device.
#[derive(Debug)]
pub struct Handled {
    /// Pattern of the route that took the message.
    pub route: String,
    pub outcome: MessageOutcome,
    /// Unparseable `_updatedAt` value replaced by the receive time.
    pub invalid_timestamp: Option<Value>,
}

/// Runtime device.
#[derive(Debug, Clone)]
pub struct Device {
    pub uid: String,
    pub name: String,
    pub title: Option<String>,
    pub device_type: String,
    pub class: Option<String>,
    pub room: Option<String>,
    pub groups: Vec<String>,
    pub tags: Vec<String>,
    pub features: Vec<String>,
    pub info: DeviceInfo,
    /// Uid of the bridging device this one depends on.
    pub via: Option<String>,
    pub keepalive: bool,
    pub timeout: Duration,
    pub last_alive: Option<Timestamp>,
    /// Accept only updates strictly newer than the current snapshot.
    pub incremental: bool,
    /// Apply set requests locally without waiting for the bus echo.
    pub optimistic: bool,
    pub state_routes: Vec<TopicRoute>,
    pub set_routes: Vec<TopicRoute>,
    pub fetch_routes: Vec<CommChannel>,
    pub availability_routes: Vec<TopicRoute>,
    pub attributes: Map<String, Value>,
    kind: Arc<dyn DeviceKind>,
    state: Arc<StateSnapshot>,
}

fn default_route(uid: &str, suffix: &str) -> Result<TopicRoute, ValidationError> {
    Ok(TopicRoute::new(TopicPattern::parse(&format!("{uid}/{suffix}"))?))
}

impl Device {
    /// Bare device with no routes.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyUid`] when `uid` is blank.
    pub fn new(uid: impl Into<String>, kind: Arc<dyn DeviceKind>) -> Result<Self, ValidationError> {
        let uid = uid.into();
        if uid.trim().is_empty() {
            return Err(ValidationError::EmptyUid);
        }
        let state = StateSnapshot {
            fields: kind.initial_state(),
            available: true,
            updated_at: None,
        };
        Ok(Self {
            name: uid.clone(),
            uid,
            title: None,
            device_type: kind.type_name().to_string(),
            class: None,
            room: None,
            groups: Vec::new(),
            tags: Vec::new(),
            features: Vec::new(),
            info: DeviceInfo::default(),
            via: None,
            keepalive: false,
            timeout: Duration::ZERO,
            last_alive: None,
            incremental: false,
            optimistic: false,
            state_routes: Vec::new(),
            set_routes: Vec::new(),
            fetch_routes: Vec::new(),
            availability_routes: Vec::new(),
            attributes: Map::new(),
            kind,
            state: Arc::new(state),
        })
    }

    /// Build a device from a handshake, filling in any missing
    /// state/set/fetch channel with `<uid>/state`, `<uid>/set`, `<uid>/get`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a blank uid or a malformed type.
    pub fn from_handshake(shake: &Handshake, kind: Arc<dyn DeviceKind>) -> Result<Self, ValidationError> {
        let mut device = Self::new(shake.uid.clone(), kind)?;
        device.update_from_shake(shake)?;
        device.state = Arc::new(StateSnapshot {
            available: device.last_alive.is_some() || !device.keepalive,
            ..(*device.state).clone()
        });
        Ok(device)
    }

    /// Refresh description, liveness settings and routes from a newer handshake.
    ///
    /// State, `last_alive` and existing tags survive the update.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed type or default topic.
    pub fn update_from_shake(&mut self, shake: &Handshake) -> Result<(), ValidationError> {
        let device_type = shake.device_type()?;
        self.name = shake.alias.clone().unwrap_or_else(|| shake.uid.clone());
        self.title = shake.display_name.clone();
        self.device_type = device_type.type_name;
        self.class = device_type.class;
        self.room = shake.location.clone();
        self.groups.clone_from(&shake.groups);
        for tag in &shake.tags {
            if !self.tags.contains(tag) {
                self.tags.push(tag.clone());
            }
        }
        self.features.clone_from(&shake.features);
        self.info = DeviceInfo {
            vendor: shake.vendor.clone(),
            product: shake.product.clone(),
            model: shake.model.clone(),
            serial_number: shake.serial_number.clone(),
            driver: shake.driver.clone(),
            description: shake.description.clone(),
        };
        self.via = shake.via.clone();
        self.keepalive = shake.keepalive;
        self.timeout = shake.keepalive_timeout;
        self.incremental = shake.flag("incremental");
        self.optimistic = shake.flag("optimistic");
        self.attributes = shake.additional.clone();

        let routes = |role| -> Vec<TopicRoute> {
            shake.channels(role).map(|channel| channel.route.clone()).collect()
        };
        self.state_routes = routes(ChannelRole::State);
        if self.state_routes.is_empty() {
            self.state_routes.push(default_route(&shake.uid, "state")?);
        }
        self.set_routes = routes(ChannelRole::Set);
        if self.set_routes.is_empty() {
            self.set_routes.push(default_route(&shake.uid, "set")?);
        }
        self.fetch_routes = shake.channels(ChannelRole::Fetch).cloned().collect();
        if self.fetch_routes.is_empty() {
            self.fetch_routes
                .push(CommChannel::new(ChannelRole::Fetch, default_route(&shake.uid, "get")?));
        }
        self.availability_routes = routes(ChannelRole::Availability);
        Ok(())
    }

    /// `type.name`, the user-facing identifier.
    #[must_use]
    pub fn entity_id(&self) -> String {
        format!("{}.{}", self.device_type, self.name)
    }

    /// Whether `id` designates this device (uid or entity id).
    #[must_use]
    pub fn is(&self, id: &str) -> bool {
        self.uid == id || self.entity_id() == id
    }

    #[must_use]
    pub fn kind(&self) -> &Arc<dyn DeviceKind> {
        &self.kind
    }

    /// Current snapshot.
    #[must_use]
    pub fn state(&self) -> Arc<StateSnapshot> {
        Arc::clone(&self.state)
    }

    /// Derived availability at `now`.
    ///
    /// A zero timeout means "available once an alive signal was seen".
    #[must_use]
    pub fn is_available(&self, now: Timestamp) -> bool {
        if !self.keepalive {
            return true;
        }
        self.last_alive.is_some_and(|last| {
            self.timeout.is_zero()
                || (now - last)
                    .to_std()
                    .map_or(true, |elapsed| elapsed < self.timeout)
        })
    }

    /// Record a liveness signal.
    pub fn mark_alive(&mut self, at: Timestamp) {
        self.last_alive = Some(at);
    }

    /// Forget the last liveness signal.
    pub fn mark_dead(&mut self) {
        self.last_alive = None;
    }

    /// Merge `patch` into the state and recompute availability.
    ///
    /// `updated_at` of `None` keeps the current timestamp. Returns the
    /// transition, or `None` when a non-forced update changes nothing. An
    /// unchanged update carrying a newer timestamp still advances
    /// `updated_at` so that older updates remain stale.
    pub fn apply(
        &mut self,
        patch: Map<String, Value>,
        updated_at: Option<Timestamp>,
        now: Timestamp,
        force: bool,
    ) -> Option<StateChange> {
        let mut fields = self.state.fields.clone();
        fields.extend(patch);
        let next = StateSnapshot {
            fields,
            available: self.is_available(now),
            updated_at: updated_at.or(self.state.updated_at),
        };
        if !force && next.same_as(&self.state) {
            if next.updated_at > self.state.updated_at {
                self.state = Arc::new(next);
            }
            return None;
        }
        let old = std::mem::replace(&mut self.state, Arc::new(next));
        Some(StateChange {
            old,
            new: Arc::clone(&self.state),
        })
    }

    /// Re-evaluate availability without new data.
    pub fn refresh(&mut self, now: Timestamp, force: bool) -> Option<StateChange> {
        self.apply(Map::new(), None, now, force)
    }

    /// Dispatch an inbound message to the first matching route.
    ///
    /// Returns `None` when no route matches `topic`.
    pub fn handle_message(&mut self, topic: &str, payload: &str, now: Timestamp) -> Option<Handled> {
        let matched = self
            .state_routes
            .iter()
            .find_map(|route| route.topic.extract(topic).map(|bindings| (route, bindings)));
        let Some((route, bindings)) = matched else {
            return self.handle_availability(topic, payload, now);
        };
        let pattern = route.topic.to_string();
        let mut fields = match route.decode(payload, &bindings) {
            Ok(fields) => fields,
            Err(err) => {
                return Some(Handled {
                    route: pattern,
                    outcome: MessageOutcome::Invalid(err),
                    invalid_timestamp: None,
                });
            }
        };
        let raw_timestamp = fields.remove(UPDATED_AT_KEY);
        fields.remove(AVAILABLE_KEY);

        if !route.allows_all(fields.keys()) {
            return Some(Handled {
                route: pattern,
                outcome: MessageOutcome::Filtered,
                invalid_timestamp: None,
            });
        }
        for (key, value) in bindings {
            if key != "name" {
                fields.entry(key).or_insert(Value::String(value));
            }
        }
        let mut fields = self.kind.map_state(fields);
        if let Some(pick) = &route.pick {
            fields.retain(|key, _| pick.contains(key));
        }

        let (updated_at, invalid_timestamp) = match raw_timestamp {
            None => (now, None),
            Some(raw) => match parse_timestamp(&raw) {
                Some(ts) => (ts, None),
                None => (now, Some(raw)),
            },
        };
        let outcome = if fields.is_empty() {
            MessageOutcome::Empty
        } else if self.incremental
            && self.state.updated_at.is_some_and(|current| updated_at <= current)
        {
            MessageOutcome::Stale
        } else {
            match self.apply(fields, Some(updated_at), now, false) {
                Some(change) => MessageOutcome::Changed(change),
                None => MessageOutcome::Unchanged,
            }
        };
        Some(Handled {
            route: pattern,
            outcome,
            invalid_timestamp,
        })
    }

    fn handle_availability(&mut self, topic: &str, payload: &str, now: Timestamp) -> Option<Handled> {
        let route = self
            .availability_routes
            .iter()
            .find(|route| route.topic.matches(topic))?;
        let pattern = route.topic.to_string();
        let outcome = match Format::Boolean.decode(payload, None) {
            Ok(Value::Bool(alive)) => {
                if alive {
                    self.mark_alive(now);
                } else {
                    self.mark_dead();
                }
                match self.refresh(now, false) {
                    Some(change) => MessageOutcome::Changed(change),
                    None => MessageOutcome::Unchanged,
                }
            }
            Ok(_) => MessageOutcome::Empty,
            Err(err) => MessageOutcome::Invalid(err),
        };
        Some(Handled {
            route: pattern,
            outcome,
            invalid_timestamp: None,
        })
    }

    fn template_device(&self) -> Value {
        json!({
            "uid": self.uid,
            "name": self.name,
            "entityId": self.entity_id(),
            "type": self.device_type,
            "room": self.room,
        })
    }

    fn base_bindings(&self, wire: &Map<String, Value>) -> Bindings {
        let mut bindings = Bindings::new();
        for (key, value) in wire {
            let text = match value {
                Value::String(text) => text.clone(),
                Value::Number(num) => num.to_string(),
                Value::Bool(flag) => flag.to_string(),
                _ => continue,
            };
            bindings.insert(key.clone(), text);
        }
        bindings.insert("uid".to_string(), self.uid.clone());
        bindings
    }

    fn render(
        &self,
        route: &TopicRoute,
        bindings: &Bindings,
        value: &Value,
        context: &Value,
    ) -> Result<OutgoingMessage, RouteError> {
        let fail = |source: SensesError| RouteError {
            route: route.topic.to_string(),
            source,
        };
        let topic = route
            .topic
            .fill(bindings)
            .map_err(|err| fail(err.into()))?;
        let template_context = json!({
            "value": value,
            "context": context,
            "currentState": self.state.to_json(),
            "device": self.template_device(),
        });
        let payload = route.encode(value, &template_context).map_err(fail)?;
        Ok(OutgoingMessage {
            topic,
            payload,
            qos: route.qos,
        })
    }

    /// Messages realising `partial` on every set route.
    ///
    /// Named routes carry their field only. Unnamed routes whose topic has a
    /// `+name` wildcard fan out one message per field; other unnamed routes
    /// carry the whole object. Routes whose filters refuse the touched fields
    /// are skipped. Each entry fails independently.
    #[must_use]
    pub fn outgoing_messages(
        &self,
        partial: &Map<String, Value>,
        context: &Value,
    ) -> Vec<Result<OutgoingMessage, RouteError>> {
        let wire = self.kind.create_payload(partial.clone());
        let base = self.base_bindings(&wire);
        let mut messages = Vec::new();
        for route in &self.set_routes {
            if let Some(name) = &route.name {
                let Some(value) = wire.get(name) else {
                    continue;
                };
                if !route.allows(name) {
                    continue;
                }
                let mut bindings = base.clone();
                bindings.insert("name".to_string(), name.clone());
                messages.push(self.render(route, &bindings, value, context));
            } else if route.topic.names().any(|name| name == "name") {
                for (key, value) in wire.iter().filter(|(key, _)| route.allows(key)) {
                    let mut bindings = base.clone();
                    bindings.insert("name".to_string(), key.clone());
                    messages.push(self.render(route, &bindings, value, context));
                }
            } else if !wire.is_empty() && route.allows_all(wire.keys()) {
                let value = Value::Object(wire.clone());
                messages.push(self.render(route, &base, &value, context));
            }
        }
        messages
    }

    /// Messages asking the device to report its state.
    #[must_use]
    pub fn fetch_messages(&self) -> Vec<Result<OutgoingMessage, RouteError>> {
        let bindings = self.base_bindings(&Map::new());
        self.fetch_routes
            .iter()
            .map(|channel| {
                let topic = channel.route.topic.fill(&bindings).map_err(|err| RouteError {
                    route: channel.route.topic.to_string(),
                    source: err.into(),
                })?;
                Ok(OutgoingMessage {
                    topic,
                    payload: channel.payload.clone().unwrap_or_default(),
                    qos: channel.route.qos,
                })
            })
            .collect()
    }

    /// Bus-level patterns to subscribe for this device.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .state_routes
            .iter()
            .chain(&self.availability_routes)
            .map(|route| route.topic.normalize())
            .collect();
        patterns.dedup();
        patterns
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::time::now;

    fn route(topic: &str) -> TopicRoute {
        TopicRoute::new(TopicPattern::parse(topic).unwrap())
    }

    fn device() -> Device {
        let mut device = Device::new("lamp", Arc::new(GenericKind::new("light"))).unwrap();
        device.state_routes.push(route("lamp/state"));
        device
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn changed(handled: Option<Handled>) -> StateChange {
        match handled.map(|h| h.outcome) {
            Some(MessageOutcome::Changed(change)) => change,
            other => panic!("expected a change, got {other:?}"),
        }
    }

    #[test]
    fn should_reject_blank_uid() {
        assert!(Device::new(" ", Arc::new(GenericKind::new("x"))).is_err());
    }

    #[test]
    fn should_build_entity_id_from_type_and_name() {
        let mut device = device();
        device.name = "desk".to_string();
        assert_eq!(device.entity_id(), "light.desk");
        assert!(device.is("light.desk"));
        assert!(device.is("lamp"));
    }

    #[test]
    fn should_apply_matching_message() {
        let mut device = device();
        let change = changed(device.handle_message("lamp/state", r#"{"state":"on"}"#, now()));
        assert_eq!(change.new.fields["state"], json!("on"));
        assert!(change.old.fields.get("state").is_none());
        assert_eq!(device.state().fields["state"], json!("on"));
    }

    #[test]
    fn should_ignore_message_without_matching_route() {
        let mut device = device();
        assert!(device.handle_message("other/state", "{}", now()).is_none());
    }

    #[test]
    fn should_use_first_matching_route_only() {
        let mut device = device();
        device.state_routes.insert(
            0,
            route("lamp/+name").with_format(Format::String),
        );
        let change = changed(device.handle_message("lamp/state", "on", now()));
        assert_eq!(change.new.fields["state"], json!("on"));
    }

    #[test]
    fn should_not_emit_twice_for_same_update() {
        let mut device = device();
        let ts = now();
        let payload = format!(r#"{{"state":"on","_updatedAt":{}}}"#, ts.timestamp_millis());
        changed(device.handle_message("lamp/state", &payload, ts));
        let second = device.handle_message("lamp/state", &payload, ts).unwrap();
        assert!(matches!(second.outcome, MessageOutcome::Unchanged));
    }

    #[test]
    fn should_emit_forced_update_even_when_equal() {
        let mut device = device();
        let ts = now();
        let patch = object(json!({"state": "on"}));
        assert!(device.apply(patch.clone(), Some(ts), ts, false).is_some());
        assert!(device.apply(patch.clone(), Some(ts), ts, false).is_none());
        assert!(device.apply(patch, Some(ts), ts, true).is_some());
    }

    #[test]
    fn should_drop_stale_update_for_incremental_device() {
        let mut device = device();
        device.incremental = true;
        let t1 = now();
        let t2 = t1 + TimeDelta::seconds(5);
        let msg = |value: u32, ts: Timestamp| {
            format!(r#"{{"value":{value},"_updatedAt":{}}}"#, ts.timestamp_millis())
        };

        changed(device.handle_message("lamp/state", &msg(2, t2), t2));
        let stale = device.handle_message("lamp/state", &msg(1, t1), t2).unwrap();
        assert!(matches!(stale.outcome, MessageOutcome::Stale));
        assert_eq!(device.state().fields["value"], json!(2));
    }

    #[test]
    fn should_keep_newer_timestamp_when_fields_are_unchanged() {
        let mut device = device();
        device.incremental = true;
        let t1 = now();
        let t2 = t1 + TimeDelta::seconds(5);
        let t3 = t1 + TimeDelta::seconds(10);
        let msg = |value: u32, ts: Timestamp| {
            format!(r#"{{"value":{value},"_updatedAt":{}}}"#, ts.timestamp_millis())
        };

        changed(device.handle_message("lamp/state", &msg(1, t1), t1));
        let same = device.handle_message("lamp/state", &msg(1, t3), t3).unwrap();
        assert!(matches!(same.outcome, MessageOutcome::Unchanged));
        assert_eq!(
            device.state().updated_at.map(|ts| ts.timestamp_millis()),
            Some(t3.timestamp_millis())
        );

        let older = device.handle_message("lamp/state", &msg(2, t2), t3).unwrap();
        assert!(matches!(older.outcome, MessageOutcome::Stale));
        assert_eq!(device.state().fields["value"], json!(1));
    }

    #[test]
    fn should_discard_whole_message_when_a_field_is_filtered() {
        let mut device = device();
        device.state_routes[0] = route("lamp/state").with_contains(&["temperature"]);
        let handled = device
            .handle_message("lamp/state", r#"{"humidity":40}"#, now())
            .unwrap();
        assert!(matches!(handled.outcome, MessageOutcome::Filtered));

        let mixed = device
            .handle_message("lamp/state", r#"{"temperature":20,"humidity":40}"#, now())
            .unwrap();
        assert!(matches!(mixed.outcome, MessageOutcome::Filtered));
        assert!(device.state().fields.get("temperature").is_none());
    }

    #[test]
    fn should_pick_listed_fields_only() {
        let mut device = device();
        device.state_routes[0] = route("lamp/state").with_pick(&["state"]);
        let change = changed(device.handle_message(
            "lamp/state",
            r#"{"state":"on","linkquality":80}"#,
            now(),
        ));
        assert!(change.new.fields.get("linkquality").is_none());
    }

    #[test]
    fn should_report_decode_errors_without_changing_state() {
        let mut device = device();
        let handled = device.handle_message("lamp/state", "{nope", now()).unwrap();
        assert!(matches!(handled.outcome, MessageOutcome::Invalid(_)));
        assert!(device.state().updated_at.is_none());
    }

    #[test]
    fn should_fall_back_to_now_for_invalid_timestamp() {
        let mut device = device();
        let ts = now();
        let handled = device
            .handle_message("lamp/state", r#"{"state":"on","_updatedAt":"later"}"#, ts)
            .unwrap();
        assert_eq!(handled.invalid_timestamp, Some(json!("later")));
        assert_eq!(device.state().updated_at, Some(ts));
        assert!(device.state().fields.get(UPDATED_AT_KEY).is_none());
    }

    #[test]
    fn should_merge_topic_bindings_into_fields() {
        let mut device = device();
        device.state_routes[0] = route("lamp/+channel/state");
        let change = changed(device.handle_message("lamp/ch1/state", r#"{"on":true}"#, now()));
        assert_eq!(change.new.fields["channel"], json!("ch1"));
    }

    #[test]
    fn should_derive_availability_from_keepalive() {
        let mut device = device();
        let t0 = now();
        assert!(device.is_available(t0));

        device.keepalive = true;
        device.timeout = Duration::from_secs(10);
        assert!(!device.is_available(t0));

        device.mark_alive(t0);
        assert!(device.is_available(t0 + TimeDelta::seconds(9)));
        assert!(!device.is_available(t0 + TimeDelta::seconds(10)));

        device.mark_dead();
        assert!(!device.is_available(t0));
    }

    #[test]
    fn should_emit_change_when_refresh_flips_availability() {
        let mut device = device();
        device.keepalive = true;
        device.timeout = Duration::from_secs(1);
        let t0 = now();
        device.mark_alive(t0);
        assert!(device.refresh(t0, false).is_none());
        let change = device.refresh(t0 + TimeDelta::seconds(2), false).unwrap();
        assert!(change.old.available);
        assert!(!change.new.available);
    }

    #[test]
    fn should_publish_bare_number_on_named_route() {
        let mut device = device();
        device.set_routes.push(
            route("room1/+uid/set")
                .with_name("brightness")
                .with_format(Format::Number),
        );
        let messages = device.outgoing_messages(&object(json!({"brightness": 80})), &Value::Null);
        let message = messages.into_iter().next().unwrap().unwrap();
        assert_eq!(message.topic, "room1/lamp/set");
        assert_eq!(message.payload, "80");
    }

    #[test]
    fn should_skip_named_route_when_field_is_absent() {
        let mut device = device();
        device.set_routes.push(route("lamp/set").with_name("brightness"));
        assert!(device
            .outgoing_messages(&object(json!({"state": "on"})), &Value::Null)
            .is_empty());
    }

    #[test]
    fn should_fan_out_per_field_on_name_wildcard() {
        let mut device = device();
        device
            .set_routes
            .push(route("lamp/+name/set").with_format(Format::Raw));
        let mut topics: Vec<(String, String)> = device
            .outgoing_messages(&object(json!({"brightness": 80, "state": "on"})), &Value::Null)
            .into_iter()
            .map(|m| {
                let m = m.unwrap();
                (m.topic, m.payload)
            })
            .collect();
        topics.sort();
        assert_eq!(
            topics,
            vec![
                ("lamp/brightness/set".to_string(), "80".to_string()),
                ("lamp/state/set".to_string(), "on".to_string()),
            ]
        );
    }

    #[test]
    fn should_send_whole_object_on_unnamed_route() {
        let mut device = device();
        device.set_routes.push(route("lamp/set"));
        let messages = device.outgoing_messages(&object(json!({"state": "on"})), &Value::Null);
        assert_eq!(messages[0].as_ref().unwrap().payload, r#"{"state":"on"}"#);
    }

    #[test]
    fn should_skip_route_when_filters_refuse_touched_fields() {
        let mut device = device();
        device
            .set_routes
            .push(route("lamp/set").with_not_contains(&["secret"]));
        let messages =
            device.outgoing_messages(&object(json!({"state": "on", "secret": 1})), &Value::Null);
        assert!(messages.is_empty());
    }

    #[test]
    fn should_report_route_error_for_missing_binding() {
        let mut device = device();
        device.set_routes.push(route("lamp/+zone/set"));
        let messages = device.outgoing_messages(&object(json!({"state": "on"})), &Value::Null);
        assert!(messages[0].is_err());
    }

    #[test]
    fn should_build_device_from_handshake_with_default_topics() {
        let mut shake = Handshake::new("plug-1", "device/switch, outlet");
        shake.alias = Some("plug".to_string());
        shake.keepalive = true;
        shake.keepalive_timeout = Duration::from_secs(3);
        shake.additional.insert("optimistic".to_string(), json!(true));
        let device = Device::from_handshake(&shake, Arc::new(SwitchKind)).unwrap();

        assert_eq!(device.entity_id(), "switch.plug");
        assert_eq!(device.class.as_deref(), Some("outlet"));
        assert!(device.optimistic);
        assert_eq!(device.state_routes[0].topic.as_str(), "plug-1/state");
        assert_eq!(device.set_routes[0].topic.as_str(), "plug-1/set");
        assert_eq!(device.fetch_routes[0].route.topic.as_str(), "plug-1/get");
        assert!(!device.state().available);
        assert_eq!(device.subscriptions(), vec!["plug-1/state"]);
    }

    #[test]
    fn should_fill_fetch_topics_with_uid() {
        let mut shake = Handshake::new("th-1", "device/sensor");
        let mut fetch = CommChannel::new(ChannelRole::Fetch, route("+uid/get"));
        fetch.payload = Some("{}".to_string());
        shake.comm_channels.push(fetch);
        let device = Device::from_handshake(&shake, Arc::new(SensorKind::new("value"))).unwrap();
        let message = device.fetch_messages().remove(0).unwrap();
        assert_eq!(message.topic, "th-1/get");
        assert_eq!(message.payload, "{}");
    }

    #[test]
    fn should_track_availability_channel() {
        let mut device = device();
        device.keepalive = true;
        device.timeout = Duration::from_secs(60);
        device.availability_routes.push(route("lamp/availability"));
        assert!(device.refresh(now(), false).is_some());
        let change = changed(device.handle_message("lamp/availability", "online", now()));
        assert!(change.new.available);
        let change = changed(device.handle_message("lamp/availability", "offline", now()));
        assert!(!change.new.available);
    }
}
