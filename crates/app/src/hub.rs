//! Hub — the owning context that wires the bus to every component.
//!
//! Constructed once at startup; the daemon feeds it inbound [`BusEvent`]s
//! in delivery order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use senses_domain::automation::AutomationConfig;
use senses_domain::device::{DeviceConfig, DriverRegistry};
use senses_domain::error::{SensesError, ValidationError};
use senses_domain::event::{Event, EventKind};
use senses_domain::scene::{Scene, SceneConfig};
use senses_domain::sun::Position;

use crate::automation_engine::{Automation, AutomationEngine};
use crate::device_registry::{DeviceRegistry, DeviceView};
use crate::discovery::{Discovery, DiscoveryConfig, is_discovery_topic};
use crate::event_bus::EventFeed;
use crate::ports::{BusEvent, EventPublisher, MessageBus};
use crate::scenes::SceneRegistry;
use crate::services::{ServiceRegistry, service_handler};
use crate::watcher::{spawn_availability_watcher, spawn_heartbeat};

/// Capacity of the in-process event feed.
pub const EVENT_CAPACITY: usize = 256;

/// Prefix of the default scene topics.
pub const SCENE_TOPIC_PREFIX: &str = "senses";

type Events = Arc<EventFeed>;

/// Explicit owner of the registries, discovery and the automation engine.
pub struct Hub<B> {
    events: Events,
    registry: Arc<DeviceRegistry<B, Events>>,
    discovery: Arc<Discovery<B, Events>>,
    services: Arc<ServiceRegistry>,
    scenes: Arc<SceneRegistry<B, Events>>,
    engine: Arc<AutomationEngine<B, Events>>,
    drivers: DriverRegistry,
    connected: AtomicBool,
    shutdown: CancellationToken,
}

fn string_argument(data: &Value, field: &'static str) -> Result<String, SensesError> {
    data.get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ValidationError::MissingField(field).into())
}

impl<B> Hub<B>
where
    B: MessageBus + Clone + Send + Sync + 'static,
{
    /// Build a hub publishing on `bus`, resolving devices with `drivers`.
    ///
    /// `position` is the home location used by solar triggers and conditions.
    pub fn new(bus: B, discovery: DiscoveryConfig, position: Position, drivers: DriverRegistry) -> Self {
        let events = Arc::new(EventFeed::new(EVENT_CAPACITY));
        let registry = Arc::new(DeviceRegistry::new(bus.clone(), Arc::clone(&events)));
        let scenes = Arc::new(SceneRegistry::new(
            bus.clone(),
            Arc::clone(&events),
            SCENE_TOPIC_PREFIX,
        ));
        let discovery = Arc::new(Discovery::new(discovery, bus, Arc::clone(&events)));
        let services = Arc::new(ServiceRegistry::new());
        let engine = Arc::new(AutomationEngine::new(
            Arc::clone(&registry),
            Arc::clone(&services),
            Arc::clone(&scenes),
            position,
        ));
        Self {
            events,
            registry,
            discovery,
            services,
            scenes,
            engine,
            drivers,
            connected: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn events(&self) -> &EventFeed {
        &self.events
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<DeviceRegistry<B, Events>> {
        &self.registry
    }

    #[must_use]
    pub fn discovery(&self) -> &Arc<Discovery<B, Events>> {
        &self.discovery
    }

    #[must_use]
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    #[must_use]
    pub fn scenes(&self) -> &Arc<SceneRegistry<B, Events>> {
        &self.scenes
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<AutomationEngine<B, Events>> {
        &self.engine
    }

    /// Register `device.set_state`, `device.request_state` and `scene.activate`.
    ///
    /// # Errors
    ///
    /// Returns [`SensesError::AlreadyExists`] when called twice.
    pub fn register_builtin_services(&self) -> Result<(), SensesError> {
        let registry = Arc::clone(&self.registry);
        self.services.register(
            "device.set_state",
            service_handler(move |data| {
                let registry = Arc::clone(&registry);
                async move {
                    let device = string_argument(&data, "device")?;
                    let state = match data.get("state") {
                        Some(Value::Object(state)) => state.clone(),
                        _ => Map::new(),
                    };
                    registry.set_state(&device, state, &data).await
                }
            }),
        )?;
        let registry = Arc::clone(&self.registry);
        self.services.register(
            "device.request_state",
            service_handler(move |data| {
                let registry = Arc::clone(&registry);
                async move {
                    let device = string_argument(&data, "device")?;
                    registry.request_state(&device).await?;
                    Ok(true)
                }
            }),
        )?;
        let scenes = Arc::clone(&self.scenes);
        self.services.register(
            "scene.activate",
            service_handler(move |data| {
                let scenes = Arc::clone(&scenes);
                async move {
                    let uid = string_argument(&data, "scene")?;
                    scenes.activate(&uid).await?;
                    Ok(true)
                }
            }),
        )
    }

    /// Register a scene declared in configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyName`] for a blank name and
    /// [`SensesError::AlreadyExists`] for a duplicate uid.
    pub fn add_scene(&self, config: &SceneConfig) -> Result<Arc<Scene>, SensesError> {
        self.scenes.add(config)
    }

    /// Register a device declared in configuration.
    ///
    /// # Errors
    ///
    /// Returns validation errors for a malformed declaration,
    /// [`SensesError::NotFound`] for an unknown type and
    /// [`SensesError::AlreadyExists`] for a duplicate uid.
    pub async fn add_static_device(&self, config: &DeviceConfig) -> Result<DeviceView, SensesError> {
        let shake = config.to_handshake()?;
        let device = self.drivers.resolve(&shake)?;
        let view = self.registry.add(device).await?;
        if self.connected.load(Ordering::SeqCst) {
            self.registry.subscribe_topics(&view.uid).await?;
        }
        Ok(view)
    }

    /// Register an automation.
    ///
    /// # Errors
    ///
    /// Returns validation errors or [`SensesError::AlreadyExists`].
    pub async fn add_automation(&self, config: AutomationConfig) -> Result<Arc<Automation>, SensesError> {
        let automation = self.engine.add(config)?;
        if self.connected.load(Ordering::SeqCst) {
            let patterns = self.engine.subscriptions();
            if !patterns.is_empty() {
                self.registry.bus().subscribe(patterns).await?;
            }
        }
        Ok(automation)
    }

    /// Process one inbound bus event.
    pub async fn handle(&self, event: BusEvent) {
        match event {
            BusEvent::Connected => self.on_connect().await,
            BusEvent::Message { topic, payload } => {
                if is_discovery_topic(&topic) {
                    self.on_discovery(&topic, &payload).await;
                } else {
                    self.registry.handle_message(&topic, &payload).await;
                    let event = Event::new(EventKind::BusMessage { topic, payload });
                    if let Err(err) = self.events.publish(event).await {
                        tracing::warn!(error = %err, "unable to publish bus message event");
                    }
                }
            }
        }
    }

    async fn on_connect(&self) {
        tracing::info!("bus connected");
        self.connected.store(true, Ordering::SeqCst);
        if let Err(err) = self.discovery.on_connect().await {
            tracing::error!(error = %err, "discovery handshake failed");
        }
        self.registry.subscribe_all().await;
        let patterns = self.engine.subscriptions();
        if !patterns.is_empty() {
            if let Err(err) = self.registry.bus().subscribe(patterns).await {
                tracing::error!(error = %err, "unable to subscribe trigger topics");
            }
        }
    }

    async fn on_discovery(&self, topic: &str, payload: &str) {
        let received = self.discovery.handle_message(topic, payload).await;
        if let Err(err) = received.reply {
            tracing::error!(%topic, error = %err, "unable to answer discovery query");
        }
        for kind in received.events {
            match kind {
                EventKind::DiscoveryHandshake { handshake } => {
                    let is_device = handshake
                        .device_type()
                        .is_ok_and(|device_type| device_type.is_device());
                    if !is_device || !self.discovery.config().devices {
                        continue;
                    }
                    match self.registry.upsert(&handshake, &self.drivers).await {
                        Ok(view) => tracing::debug!(uid = %view.uid, "device discovered"),
                        Err(SensesError::NotFound(err)) => {
                            tracing::warn!(uid = %handshake.uid, error = %err, "no driver for discovered device");
                        }
                        Err(err) => {
                            tracing::error!(uid = %handshake.uid, error = %err, "unable to register discovered device");
                        }
                    }
                }
                EventKind::DiscoveryAlive { uid, at } => {
                    self.registry.mark_alive(&uid, at).await;
                }
                EventKind::DiscoveryDeath { uid, at, .. } => {
                    self.registry.mark_dead(&uid, at).await;
                }
                _ => {}
            }
        }
    }

    /// Spawn the availability watcher and the heartbeat.
    pub fn spawn_background(&self, availability_interval: Duration) -> Vec<JoinHandle<()>> {
        spawn_availability_watcher(
            Arc::clone(&self.registry),
            availability_interval,
            self.shutdown.clone(),
        )
        .into_iter()
        .chain(spawn_heartbeat(
            Arc::clone(&self.discovery),
            self.shutdown.clone(),
        ))
        .collect()
    }

    /// Consume `inbound` until it closes or `shutdown` fires, then say
    /// goodbye on the bus.
    pub async fn run(&self, mut inbound: mpsc::Receiver<BusEvent>, shutdown: CancellationToken) {
        let engine = tokio::spawn(Arc::clone(&self.engine).run(self.events.subscribe()));
        self.engine.start();
        tracing::info!(
            devices = self.registry.len(),
            automations = self.engine.names().len(),
            "hub running"
        );
        loop {
            tokio::select! {
                received = inbound.recv() => match received {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                () = shutdown.cancelled() => break,
            }
        }
        tracing::info!("hub stopping");
        self.shutdown.cancel();
        self.engine.stop();
        if let Err(err) = engine.await {
            tracing::warn!(error = %err, "automation engine task failed");
        }
        if self.connected.load(Ordering::SeqCst) {
            if let Err(err) = self.discovery.goodbye().await {
                tracing::warn!(error = %err, "unable to announce shutdown");
            }
        }
    }
}
