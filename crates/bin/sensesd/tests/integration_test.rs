//! End-to-end tests for the wired hub.
//!
//! Each test builds the complete application core (hub, registry, discovery,
//! automation engine, built-in services) on top of an in-memory bus and
//! drives it with inbound bus events, the way the MQTT adapter does.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use senses_app::discovery::DiscoveryConfig;
use senses_app::hub::Hub;
use senses_app::ports::{BusEvent, MessageBus};
use senses_domain::automation::AutomationConfig;
use senses_domain::device::{DeviceConfig, DriverRegistry};
use senses_domain::error::SensesError;
use senses_domain::handshake::Handshake;
use senses_domain::scene::SceneConfig;
use senses_domain::sun::Position;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bus that records everything sent to the broker.
#[derive(Clone, Default)]
struct RecordingBus {
    published: Arc<Mutex<Vec<(String, String)>>>,
    subscribed: Arc<Mutex<Vec<String>>>,
}

impl RecordingBus {
    fn published_on(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }

    async fn wait_for(&self, topic: &str) -> Vec<String> {
        for _ in 0..200 {
            let found = self.published_on(topic);
            if !found.is_empty() {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("nothing published on {topic}");
    }
}

impl MessageBus for RecordingBus {
    fn publish(
        &self,
        topic: String,
        payload: String,
        _qos: u8,
    ) -> impl Future<Output = Result<(), SensesError>> + Send {
        self.published.lock().unwrap().push((topic, payload));
        std::future::ready(Ok(()))
    }

    fn subscribe(
        &self,
        patterns: Vec<String>,
    ) -> impl Future<Output = Result<(), SensesError>> + Send {
        self.subscribed.lock().unwrap().extend(patterns);
        std::future::ready(Ok(()))
    }
}

fn hub() -> (Hub<RecordingBus>, RecordingBus) {
    let bus = RecordingBus::default();
    let discovery = DiscoveryConfig {
        uid: "AC-test".to_string(),
        ..DiscoveryConfig::default()
    };
    let hub = Hub::new(
        bus.clone(),
        discovery,
        Position::new(48.8566, 2.3522),
        DriverRegistry::with_builtin(),
    );
    hub.register_builtin_services().unwrap();
    (hub, bus)
}

fn device(value: serde_json::Value) -> DeviceConfig {
    serde_json::from_value(value).unwrap()
}

fn automation(value: serde_json::Value) -> AutomationConfig {
    serde_json::from_value(value).unwrap()
}

fn message(topic: &str, payload: &str) -> BusEvent {
    BusEvent::Message {
        topic: topic.to_string(),
        payload: payload.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn should_announce_subscribe_and_say_goodbye() {
    let (hub, bus) = hub();
    hub.add_static_device(&device(json!({"name": "desk", "type": "light"})))
        .await
        .unwrap();
    let (tx, rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();

    tokio::join!(hub.run(rx, shutdown.clone()), async {
        tx.send(BusEvent::Connected).await.unwrap();
        bus.wait_for("discovery/handshake").await;
        shutdown.cancel();
    });

    let subscribed = bus.subscribed();
    assert!(subscribed.contains(&"discovery/+".to_string()));
    assert!(subscribed.contains(&"light-desk/state".to_string()));
    assert_eq!(bus.published_on("discovery/death/AC-test").len(), 1);
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn should_register_discovered_device_and_reply_to_query() {
    let (hub, bus) = hub();
    let mut shake = Handshake::new("lamp-1", "device/light");
    shake.reply_topic = Some("discovery/handshake/lamp-1".to_string());
    let payload = serde_json::to_string(&shake).unwrap();
    let (tx, rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();

    tokio::join!(hub.run(rx, shutdown.clone()), async {
        tx.send(BusEvent::Connected).await.unwrap();
        tx.send(message("discovery/handshake", &payload))
            .await
            .unwrap();
        bus.wait_for("discovery/handshake/lamp-1").await;
        shutdown.cancel();
    });

    let view = hub.registry().get("lamp-1").unwrap();
    assert!(view.available());
    assert_eq!(bus.published_on("discovery/handshake/lamp-1").len(), 1);
}

// ---------------------------------------------------------------------------
// Automations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn should_drive_light_from_sensor_state() {
    let (hub, bus) = hub();
    hub.add_static_device(&device(json!({"name": "desk", "type": "light"})))
        .await
        .unwrap();
    hub.add_static_device(&device(json!({"name": "hall", "type": "sensor"})))
        .await
        .unwrap();
    hub.add_automation(automation(json!({
        "name": "Hall presence",
        "trigger": {"on": "numeric_state", "device": "sensor.hall", "attribute": "value", "above": 20},
        "action": {"do": "set_state", "device": "light.desk", "state": {"brightness": 80}}
    })))
    .await
    .unwrap();
    let (tx, rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();

    tokio::join!(hub.run(rx, shutdown.clone()), async {
        tx.send(BusEvent::Connected).await.unwrap();
        tx.send(message("sensor-hall/state", r#"{"value":12}"#))
            .await
            .unwrap();
        tx.send(message("sensor-hall/state", r#"{"value":23}"#))
            .await
            .unwrap();
        bus.wait_for("light-desk/set").await;
        shutdown.cancel();
    });

    assert_eq!(
        bus.published_on("light-desk/set"),
        vec![r#"{"brightness":80}"#.to_string()]
    );
    assert_eq!(
        hub.registry().state("sensor.hall").unwrap().fields["value"],
        23
    );
}

#[tokio::test]
async fn should_echo_raw_bus_messages_through_template() {
    let (hub, bus) = hub();
    hub.add_automation(automation(json!({
        "name": "Button echo",
        "trigger": {"on": "mqtt", "topic": "button/+/press"},
        "action": {"do": "publish", "topic": "echo", "payload": "{{ trigger.topic }}={{ trigger.payload }}"}
    })))
    .await
    .unwrap();
    let (tx, rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();

    tokio::join!(hub.run(rx, shutdown.clone()), async {
        tx.send(BusEvent::Connected).await.unwrap();
        tx.send(message("button/kitchen/press", "long"))
            .await
            .unwrap();
        bus.wait_for("echo").await;
        shutdown.cancel();
    });

    assert!(bus.subscribed().contains(&"button/+/press".to_string()));
    assert_eq!(
        bus.published_on("echo"),
        vec!["button/kitchen/press=long".to_string()]
    );
}

// ---------------------------------------------------------------------------
// Scenes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn should_chain_button_press_to_scene_and_scene_trigger() {
    let (hub, bus) = hub();
    let scene: SceneConfig = serde_json::from_value(json!({"name": "movie", "room": "living"})).unwrap();
    hub.add_scene(&scene).unwrap();
    hub.add_automation(automation(json!({
        "name": "Movie button",
        "trigger": {"on": "mqtt", "topic": "button/living/press"},
        "action": {"do": "call_service", "service": "scene.activate", "data": {"scene": "scene-living-movie"}}
    })))
    .await
    .unwrap();
    hub.add_automation(automation(json!({
        "name": "Movie lights",
        "trigger": {"on": "scene", "scene": {"room": "living"}},
        "action": {"do": "publish", "topic": "lights/living", "payload": "{{ trigger.scene.name }}"}
    })))
    .await
    .unwrap();
    let (tx, rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();

    tokio::join!(hub.run(rx, shutdown.clone()), async {
        tx.send(BusEvent::Connected).await.unwrap();
        tx.send(message("button/living/press", "1")).await.unwrap();
        bus.wait_for("lights/living").await;
        shutdown.cancel();
    });

    assert_eq!(bus.published_on("senses/scene/living"), vec!["movie".to_string()]);
    assert_eq!(bus.published_on("lights/living"), vec!["movie".to_string()]);
}
