//! Device registry — owns every runtime device and synchronises its state
//! with the bus.
//!
//! Each device sits behind its own async mutex so transitions for one device
//! are strictly ordered, while a lightweight [`DeviceView`] mirror serves
//! synchronous readers (automation conditions, presence cascades).

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use senses_domain::device::{Device, DriverRegistry, MessageOutcome, StateChange, StateSnapshot};
use senses_domain::error::{AlreadyExistsError, NotFoundError, SensesError};
use senses_domain::event::{Event, EventKind};
use senses_domain::handshake::Handshake;
use senses_domain::time::{Timestamp, now};

use crate::ports::{EventPublisher, MessageBus};

/// Tag added to devices created from a discovery handshake.
pub const DISCOVERED_TAG: &str = "discovered";

/// Read-only summary of a registered device.
#[derive(Debug, Clone)]
pub struct DeviceView {
    pub uid: String,
    pub entity_id: String,
    pub device_type: String,
    pub via: Option<String>,
    pub tags: Vec<String>,
    pub state: Arc<StateSnapshot>,
}

impl DeviceView {
    fn of(device: &Device) -> Self {
        Self {
            uid: device.uid.clone(),
            entity_id: device.entity_id(),
            device_type: device.device_type.clone(),
            via: device.via.clone(),
            tags: device.tags.clone(),
            state: device.state(),
        }
    }

    /// Availability as of the last transition.
    #[must_use]
    pub fn available(&self) -> bool {
        self.state.available
    }

    /// Whether `id` designates this device (uid or entity id).
    #[must_use]
    pub fn is(&self, id: &str) -> bool {
        self.uid == id || self.entity_id == id
    }
}

struct Slot {
    device: Mutex<Device>,
    view: RwLock<DeviceView>,
}

impl Slot {
    fn view(&self) -> DeviceView {
        self.view
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn sync(&self, device: &Device) {
        *self.view.write().unwrap_or_else(PoisonError::into_inner) = DeviceView::of(device);
    }
}

/// Registry of runtime devices, keyed by uid.
pub struct DeviceRegistry<B, P> {
    bus: B,
    publisher: P,
    slots: RwLock<BTreeMap<String, Arc<Slot>>>,
}

impl<B, P> DeviceRegistry<B, P>
where
    B: MessageBus + Send + Sync,
    P: EventPublisher + Send + Sync,
{
    /// Create an empty registry publishing on `bus` and emitting on `publisher`.
    pub fn new(bus: B, publisher: P) -> Self {
        Self {
            bus,
            publisher,
            slots: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    fn slots(&self) -> Vec<Arc<Slot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn slot(&self, id: &str) -> Option<Arc<Slot>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get(id) {
            return Some(Arc::clone(slot));
        }
        slots.values().find(|slot| slot.view().is(id)).cloned()
    }

    fn require(&self, id: &str) -> Result<Arc<Slot>, SensesError> {
        self.slot(id).ok_or_else(|| {
            NotFoundError {
                entity: "Device",
                id: id.to_string(),
            }
            .into()
        })
    }

    async fn emit(&self, kind: EventKind) {
        let event = Event::new(kind);
        if let Err(err) = self.publisher.publish(event).await {
            tracing::warn!(error = %err, "unable to publish event");
        }
    }

    async fn emit_update(&self, device: &Device, change: StateChange) {
        tracing::debug!(
            uid = %device.uid,
            changed = ?change.changed_keys(),
            "device state updated"
        );
        self.emit(EventKind::DeviceUpdated {
            uid: device.uid.clone(),
            entity_id: device.entity_id(),
            change,
        })
        .await;
    }

    /// Register a device.
    ///
    /// # Errors
    ///
    /// Returns [`SensesError::AlreadyExists`] when the uid is taken; the
    /// check and the insertion happen under one lock.
    #[tracing::instrument(skip(self, device), fields(uid = %device.uid))]
    pub async fn add(&self, device: Device) -> Result<DeviceView, SensesError> {
        let view = DeviceView::of(&device);
        {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            if slots.contains_key(&device.uid) {
                return Err(AlreadyExistsError {
                    entity: "Device",
                    id: device.uid,
                }
                .into());
            }
            slots.insert(
                device.uid.clone(),
                Arc::new(Slot {
                    device: Mutex::new(device),
                    view: RwLock::new(view.clone()),
                }),
            );
        }
        tracing::info!(entity_id = %view.entity_id, "device registered");
        self.emit(EventKind::DeviceAdded {
            uid: view.uid.clone(),
            entity_id: view.entity_id.clone(),
        })
        .await;
        Ok(view)
    }

    /// Look up a device by uid or entity id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<DeviceView> {
        self.slot(id).map(|slot| slot.view())
    }

    /// Current snapshot of a device, by uid or entity id.
    #[must_use]
    pub fn state(&self, id: &str) -> Option<Arc<StateSnapshot>> {
        self.get(id).map(|view| view.state)
    }

    /// Every registered device, ordered by uid.
    #[must_use]
    pub fn list(&self) -> Vec<DeviceView> {
        self.slots().iter().map(|slot| slot.view()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatch an inbound bus message to every device with a matching route.
    ///
    /// Decode failures and filtered messages are logged, never returned.
    /// Returns how many devices took the message.
    pub async fn handle_message(&self, topic: &str, payload: &str) -> usize {
        let mut handled = 0;
        for slot in self.slots() {
            let mut device = slot.device.lock().await;
            let Some(result) = device.handle_message(topic, payload, now()) else {
                continue;
            };
            handled += 1;
            if let Some(raw) = &result.invalid_timestamp {
                tracing::warn!(uid = %device.uid, %topic, value = %raw, "invalid timestamp, using receive time");
            }
            match result.outcome {
                MessageOutcome::Changed(change) => {
                    slot.sync(&device);
                    self.emit_update(&device, change).await;
                }
                MessageOutcome::Invalid(err) => {
                    tracing::warn!(uid = %device.uid, route = %result.route, %topic, error = %err, "unable to decode payload");
                }
                MessageOutcome::Filtered => {
                    tracing::debug!(uid = %device.uid, route = %result.route, "message rejected by route filters");
                }
                MessageOutcome::Stale => {
                    tracing::debug!(uid = %device.uid, route = %result.route, "stale update dropped");
                }
                MessageOutcome::Unchanged => {
                    slot.sync(&device);
                    tracing::trace!(uid = %device.uid, route = %result.route, "no state change");
                }
                MessageOutcome::Empty => {
                    tracing::trace!(uid = %device.uid, route = %result.route, "no state change");
                }
            }
        }
        handled
    }

    async fn publish_all(&self, uid: &str, messages: Vec<senses_domain::device::OutgoingMessage>) {
        let publishes = messages.into_iter().map(|message| async move {
            let topic = message.topic.clone();
            tracing::trace!(%uid, %topic, payload = %message.payload, "publishing");
            if let Err(err) = self
                .bus
                .publish(message.topic, message.payload, message.qos)
                .await
            {
                tracing::error!(%uid, %topic, error = %err, "publish failed");
            }
        });
        join_all(publishes).await;
    }

    /// Send a partial state to a device over every set route.
    ///
    /// Each route publishes independently; a failing route is logged and
    /// does not affect the others. Optimistic devices apply `partial`
    /// locally right away. A device without any usable route is a no-op.
    /// Read-only kinds are never written to and yield `false`.
    ///
    /// # Errors
    ///
    /// Returns [`SensesError::NotFound`] for an unknown device.
    #[tracing::instrument(skip(self, partial, context))]
    pub async fn set_state(
        &self,
        id: &str,
        partial: Map<String, Value>,
        context: &Value,
    ) -> Result<bool, SensesError> {
        let slot = self.require(id)?;
        let mut device = slot.device.lock().await;
        if !device.kind().writable() {
            tracing::warn!(uid = %device.uid, "refusing to write to read-only device");
            return Ok(false);
        }
        let mut messages = Vec::new();
        for message in device.outgoing_messages(&partial, context) {
            match message {
                Ok(message) => messages.push(message),
                Err(err) => {
                    tracing::error!(uid = %device.uid, route = %err.route, error = %err.source, "unable to build message");
                }
            }
        }
        self.publish_all(&device.uid, messages).await;

        if device.optimistic {
            let at = now();
            if let Some(change) = device.apply(partial, Some(at), at, true) {
                slot.sync(&device);
                self.emit_update(&device, change).await;
            }
        }
        Ok(true)
    }

    /// Ask a device to report its state over its fetch routes.
    ///
    /// # Errors
    ///
    /// Returns [`SensesError::NotFound`] for an unknown device.
    #[tracing::instrument(skip(self))]
    pub async fn request_state(&self, id: &str) -> Result<(), SensesError> {
        let slot = self.require(id)?;
        let device = slot.device.lock().await;
        let mut messages = Vec::new();
        for message in device.fetch_messages() {
            match message {
                Ok(message) => messages.push(message),
                Err(err) => {
                    tracing::error!(uid = %device.uid, route = %err.route, error = %err.source, "unable to build fetch message");
                }
            }
        }
        self.publish_all(&device.uid, messages).await;
        Ok(())
    }

    /// Subscribe the device's state and availability topics, then request
    /// its state.
    ///
    /// # Errors
    ///
    /// Returns [`SensesError::NotFound`] for an unknown device and
    /// [`SensesError::Bus`] when the subscription fails.
    #[tracing::instrument(skip(self))]
    pub async fn subscribe_topics(&self, id: &str) -> Result<(), SensesError> {
        let slot = self.require(id)?;
        let patterns = slot.device.lock().await.subscriptions();
        if !patterns.is_empty() {
            self.bus.subscribe(patterns).await?;
        }
        self.request_state(id).await
    }

    /// Renew the subscriptions of every device, e.g. after a reconnect.
    pub async fn subscribe_all(&self) {
        for view in self.list() {
            if let Err(err) = self.subscribe_topics(&view.uid).await {
                tracing::error!(uid = %view.uid, error = %err, "unable to subscribe device topics");
            }
        }
    }

    /// Create or refresh a device from a handshake.
    ///
    /// Known devices take the new description and are asked for their state;
    /// new ones are resolved through `drivers`, tagged
    /// [`DISCOVERED_TAG`], registered and subscribed.
    ///
    /// # Errors
    ///
    /// Returns validation errors for a malformed handshake,
    /// [`SensesError::NotFound`] when no driver handles its type, and bus
    /// errors from the initial subscription.
    #[tracing::instrument(skip(self, shake, drivers), fields(uid = %shake.uid))]
    pub async fn upsert(
        &self,
        shake: &Handshake,
        drivers: &DriverRegistry,
    ) -> Result<DeviceView, SensesError> {
        if let Some(slot) = self.slot(&shake.uid) {
            let view = {
                let mut device = slot.device.lock().await;
                device.update_from_shake(shake)?;
                slot.sync(&device);
                DeviceView::of(&device)
            };
            tracing::debug!("device description updated");
            self.request_state(&view.uid).await?;
            return Ok(view);
        }
        let mut device = drivers.resolve(shake)?;
        if !device.tags.iter().any(|tag| tag == DISCOVERED_TAG) {
            device.tags.push(DISCOVERED_TAG.to_string());
        }
        let view = self.add(device).await?;
        self.subscribe_topics(&view.uid).await?;
        Ok(view)
    }

    /// Record a liveness signal for `uid`. Returns `false` for unknown uids.
    pub async fn mark_alive(&self, uid: &str, at: Timestamp) -> bool {
        let Some(slot) = self.slot(uid) else {
            return false;
        };
        let mut device = slot.device.lock().await;
        device.mark_alive(at);
        if let Some(change) = device.refresh(now(), false) {
            slot.sync(&device);
            self.emit_update(&device, change).await;
        }
        true
    }

    async fn mark_dead_one(&self, slot: &Slot) {
        let mut device = slot.device.lock().await;
        device.mark_dead();
        if let Some(change) = device.refresh(now(), false) {
            slot.sync(&device);
            self.emit_update(&device, change).await;
        }
    }

    /// Forget the liveness of `uid` and cascade to every available device
    /// bridged through it, recursively.
    ///
    /// Each cascaded device emits a `DiscoveryDeath` event flagged as
    /// cascaded. Returns the cascaded uids.
    pub async fn mark_dead(&self, uid: &str, at: Timestamp) -> Vec<String> {
        let Some(slot) = self.slot(uid) else {
            return Vec::new();
        };
        self.mark_dead_one(&slot).await;

        let mut cascaded = Vec::new();
        let mut seen = HashSet::from([uid.to_string()]);
        let mut parents = vec![uid.to_string()];
        while let Some(parent) = parents.pop() {
            let children: Vec<DeviceView> = self
                .list()
                .into_iter()
                .filter(|view| view.via.as_deref() == Some(parent.as_str()) && view.available())
                .collect();
            for child in children {
                if !seen.insert(child.uid.clone()) {
                    continue;
                }
                if let Some(slot) = self.slot(&child.uid) {
                    tracing::info!(uid = %child.uid, via = %parent, "cascading death");
                    self.mark_dead_one(&slot).await;
                    self.emit(EventKind::DiscoveryDeath {
                        uid: child.uid.clone(),
                        at,
                        cascade: true,
                    })
                    .await;
                    parents.push(child.uid.clone());
                    cascaded.push(child.uid);
                }
            }
        }
        cascaded
    }

    /// Re-evaluate availability of every device. Returns how many changed.
    pub async fn refresh_availability(&self) -> usize {
        let mut changed = 0;
        for slot in self.slots() {
            let mut device = slot.device.lock().await;
            if let Some(change) = device.refresh(now(), false) {
                changed += 1;
                slot.sync(&device);
                self.emit_update(&device, change).await;
            }
        }
        changed
    }
}
