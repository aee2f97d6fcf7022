//! Automation engine — reacts to events by evaluating and executing automations.
//!
//! The engine consumes the event feed and, for each incoming event, checks
//! every automation trigger. A firing evaluates the conditions, passes the
//! mode gate (a [`Semaphore`] sized by the mode) and then runs the actions in
//! order, observing the automation's cancellation [`Signal`] between steps.
//!
//! Timed triggers (`for` on state triggers, `delay` on bus triggers) are
//! scheduled here; a superseding change cancels the pending timer. Clock
//! triggers (intervals, cron schedules and solar events) each get a task
//! once the engine starts.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use senses_domain::automation::{Action, AutomationConfig, Mode, Trigger};
use senses_domain::error::{AlreadyExistsError, NotFoundError, SensesError};
use senses_domain::event::{Event, EventKind};
use senses_domain::id::ExecutionId;
use senses_domain::schedule::{CronSchedule, EVERY_MINUTE};
use senses_domain::sun::{Position, next_sun_time};
use senses_domain::template;
use senses_domain::time::{Timestamp, now};

use crate::cancellation::Signal;
use crate::device_registry::DeviceRegistry;
use crate::ports::{EventPublisher, MessageBus};
use crate::scenes::SceneRegistry;
use crate::semaphore::{Permit, Semaphore};
use crate::services::ServiceRegistry;

/// How a single firing ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// A condition did not hold.
    Skipped,
    /// The mode refused a concurrent run.
    Rejected,
    /// The run was cancelled before or while executing its actions.
    Cancelled,
    /// Every reached action ran; failing actions are listed.
    Completed { errors: Vec<String> },
}

/// Runtime state of one configured automation.
pub struct Automation {
    config: AutomationConfig,
    semaphore: Semaphore,
    signal: Mutex<Signal>,
    last_execution_error: Mutex<Option<String>>,
    last_triggered: Mutex<Option<Timestamp>>,
    scheduled: AtomicBool,
}

impl std::fmt::Debug for Automation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Automation")
            .field("name", &self.config.name)
            .field("mode", &self.config.mode)
            .field("semaphore", &self.semaphore)
            .finish_non_exhaustive()
    }
}

impl Automation {
    fn new(config: AutomationConfig) -> Self {
        Self {
            semaphore: Semaphore::new(config.capacity()),
            config,
            signal: Mutex::new(Signal::new()),
            last_execution_error: Mutex::new(None),
            last_triggered: Mutex::new(None),
            scheduled: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn config(&self) -> &AutomationConfig {
        &self.config
    }

    /// Runs currently holding a slot.
    #[must_use]
    pub fn running(&self) -> usize {
        self.semaphore.capacity() - self.semaphore.available()
    }

    /// Firings waiting for a slot.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.semaphore.waiting()
    }

    /// Error of the last failing action of the last run.
    #[must_use]
    pub fn last_execution_error(&self) -> Option<String> {
        self.last_execution_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn last_triggered(&self) -> Option<Timestamp> {
        *self
            .last_triggered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn current_signal(&self) -> Signal {
        self.signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cancel every in-flight run and return the fresh signal later runs get.
    pub fn cancel(&self, reason: &str) -> Signal {
        let fresh = Signal::new();
        let previous = std::mem::replace(
            &mut *self.signal.lock().unwrap_or_else(PoisonError::into_inner),
            fresh.clone(),
        );
        previous.cancel(reason);
        fresh
    }

    fn record(&self, error: Option<String>) {
        *self
            .last_execution_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = error;
    }
}

enum Flow {
    Continue,
    Stop,
    Cancelled,
}

type TimerKey = (String, usize, String);

/// Reactive automation engine fed by the event bus.
pub struct AutomationEngine<B, P> {
    registry: Arc<DeviceRegistry<B, P>>,
    services: Arc<ServiceRegistry>,
    scenes: Arc<SceneRegistry<B, P>>,
    position: Position,
    automations: RwLock<BTreeMap<String, Arc<Automation>>>,
    timers: Mutex<HashMap<TimerKey, (u64, CancellationToken)>>,
    next_timer: AtomicU64,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl<B, P> AutomationEngine<B, P>
where
    B: MessageBus + Send + Sync + 'static,
    P: EventPublisher + Send + Sync + 'static,
{
    /// Create a new engine acting on `registry`, `services` and `scenes`.
    ///
    /// `position` locates solar triggers and conditions that do not name
    /// their own coordinates.
    pub fn new(
        registry: Arc<DeviceRegistry<B, P>>,
        services: Arc<ServiceRegistry>,
        scenes: Arc<SceneRegistry<B, P>>,
        position: Position,
    ) -> Self {
        Self {
            registry,
            services,
            scenes,
            position,
            automations: RwLock::new(BTreeMap::new()),
            timers: Mutex::new(HashMap::new()),
            next_timer: AtomicU64::new(0),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register an automation.
    ///
    /// Clock triggers are scheduled right away once the engine started.
    ///
    /// # Errors
    ///
    /// Returns [`SensesError::Validation`] for an invalid configuration and
    /// [`SensesError::AlreadyExists`] when the name is taken.
    pub fn add(self: &Arc<Self>, config: AutomationConfig) -> Result<Arc<Automation>, SensesError> {
        config.validate()?;
        let automation = {
            let mut automations = self.automations.write().unwrap_or_else(PoisonError::into_inner);
            if automations.contains_key(&config.name) {
                return Err(AlreadyExistsError {
                    entity: "Automation",
                    id: config.name,
                }
                .into());
            }
            let automation = Arc::new(Automation::new(config));
            automations.insert(automation.name().to_string(), Arc::clone(&automation));
            automation
        };
        tracing::info!(
            automation = %automation.name(),
            mode = %automation.config.mode,
            triggers = automation.config.trigger.len(),
            "automation registered"
        );
        if self.started.load(Ordering::SeqCst) {
            self.schedule_clocks(&automation);
        }
        Ok(automation)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Automation>> {
        self.automations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn list(&self) -> Vec<Arc<Automation>> {
        self.automations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Registered automation names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.automations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Bus patterns the bus triggers listen to.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .list()
            .iter()
            .flat_map(|automation| automation.config.trigger.clone())
            .filter_map(|trigger| match trigger {
                Trigger::Mqtt { topic, .. } => Some(topic.normalize()),
                _ => None,
            })
            .collect();
        patterns.sort();
        patterns.dedup();
        patterns
    }

    /// Cancel every in-flight run of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`SensesError::NotFound`] for an unknown automation.
    pub fn cancel(&self, name: &str) -> Result<(), SensesError> {
        self.require(name)?.cancel("cancelled");
        Ok(())
    }

    fn require(&self, name: &str) -> Result<Arc<Automation>, SensesError> {
        self.get(name).ok_or_else(|| {
            NotFoundError {
                entity: "Automation",
                id: name.to_string(),
            }
            .into()
        })
    }

    /// Fire `name` by hand with `context` and wait for the run to end.
    ///
    /// # Errors
    ///
    /// Returns [`SensesError::NotFound`] for an unknown automation.
    pub async fn trigger(&self, name: &str, context: Value) -> Result<ExecutionOutcome, SensesError> {
        let automation = self.require(name)?;
        Ok(self.play(&automation, context).await)
    }

    /// Evaluate the conditions, pass the mode gate and run the actions.
    #[tracing::instrument(skip_all, fields(automation = %automation.name()))]
    pub async fn play(&self, automation: &Arc<Automation>, context: Value) -> ExecutionOutcome {
        let mut context = match context {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => Map::from_iter([("value".to_string(), other)]),
        };
        context.insert(
            "automation".to_string(),
            json!({
                "name": automation.name(),
                "mode": automation.config.mode,
            }),
        );
        let context = Value::Object(context);

        let lookup = |id: &str| self.registry.state(id);
        let at = now();
        if let Some(condition) = automation
            .config
            .condition
            .iter()
            .find(|condition| !condition.evaluate(&lookup, at, self.position))
        {
            tracing::trace!(%condition, "condition not met");
            return ExecutionOutcome::Skipped;
        }

        let Some((permit, signal)) = self.gate(automation).await else {
            return match automation.config.mode {
                Mode::Single | Mode::Parallel => ExecutionOutcome::Rejected,
                Mode::Queued | Mode::Restart => ExecutionOutcome::Cancelled,
            };
        };
        *automation
            .last_triggered
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(now());

        let execution = ExecutionId::new();
        tracing::debug!(%execution, "running actions");
        let mut errors = Vec::new();
        let mut cancelled = false;
        for action in &automation.config.action {
            if signal.is_cancelled() {
                cancelled = true;
                break;
            }
            match self.execute(action, &context, &signal).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => {
                    tracing::debug!("action sequence stopped");
                    break;
                }
                Ok(Flow::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(err) => {
                    tracing::error!(%action, error = %err, "action failed");
                    errors.push(format!("{action}: {err}"));
                }
            }
        }
        drop(permit);

        let error = if cancelled {
            let reason = signal.reason().unwrap_or_else(|| "cancelled".to_string());
            tracing::info!(%execution, %reason, "run cancelled");
            Some(reason)
        } else {
            errors.last().cloned()
        };
        automation.record(errors.last().cloned());
        let event = Event::new(EventKind::AutomationExecuted {
            automation: automation.name().to_string(),
            execution,
            success: !cancelled && errors.is_empty(),
            error,
        });
        if let Err(err) = self.registry.publisher().publish(event).await {
            tracing::warn!(error = %err, "unable to publish execution event");
        }

        if cancelled {
            ExecutionOutcome::Cancelled
        } else {
            ExecutionOutcome::Completed { errors }
        }
    }

    /// Admit a firing according to the mode, along with the signal its run obeys.
    ///
    /// A restarting firing owns the signal it created, so a later restart
    /// cancels it even while it still waits for the slot.
    async fn gate(&self, automation: &Automation) -> Option<(Permit, Signal)> {
        let permit = match automation.config.mode {
            Mode::Single | Mode::Parallel => {
                let permit = automation.semaphore.try_acquire();
                if permit.is_none() {
                    tracing::warn!(
                        mode = %automation.config.mode,
                        running = automation.running(),
                        "already running, firing rejected"
                    );
                }
                permit
            }
            Mode::Queued => automation.semaphore.acquire(0).await.ok(),
            Mode::Restart => {
                let signal = automation.cancel("restarted");
                let rejected = automation.semaphore.cancel();
                if rejected > 0 {
                    tracing::debug!(rejected, "superseded queued firings");
                }
                let permit = automation.semaphore.acquire(0).await.ok()?;
                return Some((permit, signal));
            }
        }?;
        Some((permit, automation.current_signal()))
    }

    async fn execute(&self, action: &Action, context: &Value, signal: &Signal) -> Result<Flow, SensesError> {
        tracing::trace!(%action, "executing");
        match action {
            Action::SetState { device, state } => {
                let mut failure = None;
                for id in device {
                    if let Err(err) = self.registry.set_state(id, state.clone(), context).await {
                        tracing::warn!(device = %id, error = %err, "set_state failed");
                        failure.get_or_insert(err);
                    }
                }
                failure.map_or(Ok(Flow::Continue), Err)
            }
            Action::CallService { service, data } => {
                self.services.call(service, data.clone()).await?;
                Ok(Flow::Continue)
            }
            Action::Publish {
                topic,
                payload,
                qos,
            } => {
                let payload = template::render(payload, context)?;
                self.registry
                    .bus()
                    .publish(topic.clone(), payload, *qos)
                    .await?;
                Ok(Flow::Continue)
            }
            Action::Delay { duration } => {
                tokio::select! {
                    () = tokio::time::sleep(*duration) => Ok(Flow::Continue),
                    () = signal.cancelled() => Ok(Flow::Cancelled),
                }
            }
            Action::Cancel => Ok(Flow::Stop),
            Action::ActivateScene { scene } => {
                let found = self.scenes.find(scene).ok_or_else(|| NotFoundError {
                    entity: "Scene",
                    id: scene.to_string(),
                })?;
                self.scenes.activate(&found.uid).await?;
                Ok(Flow::Continue)
            }
        }
    }

    // ── Trigger dispatch ───────────────────────────────────────────

    fn fire(self: &Arc<Self>, automation: &Arc<Automation>, context: Value) {
        let engine = Arc::clone(self);
        let automation = Arc::clone(automation);
        tokio::spawn(async move { engine.play(&automation, context).await });
    }

    fn cancel_timer(&self, key: &TimerKey) {
        let pending = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if let Some((_, token)) = pending {
            tracing::trace!(automation = %key.0, trigger = key.1, "pending trigger cancelled");
            token.cancel();
        }
    }

    /// Fire after `hold`, unless the timer for `key` is replaced or cancelled.
    fn schedule(self: &Arc<Self>, automation: &Arc<Automation>, key: TimerKey, hold: Duration, context: Value) {
        self.cancel_timer(&key);
        let seq = self.next_timer.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), (seq, token.clone()));

        let engine = Arc::clone(self);
        let automation = Arc::clone(automation);
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(hold) => {
                    let current = {
                        let mut timers = engine.timers.lock().unwrap_or_else(PoisonError::into_inner);
                        let current = timers.get(&key).is_some_and(|(pending, _)| *pending == seq);
                        if current {
                            timers.remove(&key);
                        }
                        current
                    };
                    if current {
                        engine.play(&automation, context).await;
                    }
                }
                () = token.cancelled() => {}
            }
        });
    }

    fn dispatch(
        self: &Arc<Self>,
        automation: &Arc<Automation>,
        key: TimerKey,
        hold: Option<Duration>,
        context: Value,
    ) {
        match hold {
            Some(hold) if !hold.is_zero() => self.schedule(automation, key, hold, context),
            _ => self.fire(automation, context),
        }
    }

    /// Check `event` against every trigger and fire the matching ones.
    ///
    /// Firings run on their own tasks. Returns how many firings were started
    /// or scheduled.
    pub fn handle_event(self: &Arc<Self>, event: &Event) -> usize {
        let mut fired = 0;
        for automation in self.list() {
            for (index, trigger) in automation.config.trigger.iter().enumerate() {
                let firing = match &event.kind {
                    EventKind::DeviceUpdated {
                        uid,
                        entity_id,
                        change,
                    } => {
                        if !trigger.watches(uid, entity_id) {
                            continue;
                        }
                        let Some(transition) = trigger.evaluate_change(change) else {
                            continue;
                        };
                        let key = (automation.name().to_string(), index, uid.clone());
                        if transition.changed {
                            self.cancel_timer(&key);
                        }
                        if !transition.fires() {
                            continue;
                        }
                        let context = json!({
                            "trigger": {
                                "on": "state",
                                "device": uid,
                                "entityId": entity_id,
                                "from": change.old.to_json(),
                                "to": change.new.to_json(),
                            }
                        });
                        (key, context)
                    }
                    EventKind::BusMessage { topic, payload } => {
                        if !trigger.matches_message(topic, payload) {
                            continue;
                        }
                        let value = serde_json::from_str::<Value>(payload)
                            .unwrap_or_else(|_| Value::String(payload.clone()));
                        let context = json!({
                            "trigger": {
                                "on": "mqtt",
                                "topic": topic,
                                "payload": payload,
                                "value": value,
                            }
                        });
                        ((automation.name().to_string(), index, topic.clone()), context)
                    }
                    EventKind::DeviceAdded { uid, entity_id } => {
                        let device_type = self
                            .registry
                            .get(uid)
                            .map(|view| view.device_type)
                            .unwrap_or_default();
                        if !trigger.matches_device_added(uid, entity_id, &device_type) {
                            continue;
                        }
                        let context = json!({
                            "trigger": {
                                "on": "device_added",
                                "device": uid,
                                "entityId": entity_id,
                            }
                        });
                        ((automation.name().to_string(), index, uid.clone()), context)
                    }
                    EventKind::SceneActivated { scene } => {
                        if !trigger.matches_scene(scene) {
                            continue;
                        }
                        let context = json!({
                            "trigger": {
                                "on": "scene",
                                "scene": scene.to_json(),
                            }
                        });
                        ((automation.name().to_string(), index, scene.uid.clone()), context)
                    }
                    _ => continue,
                };
                let (key, context) = firing;
                tracing::debug!(automation = %automation.name(), %trigger, "trigger matched");
                self.dispatch(&automation, key, trigger.hold(), context);
                fired += 1;
            }
        }
        fired
    }

    fn schedule_clocks(self: &Arc<Self>, automation: &Arc<Automation>) {
        if automation.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        for (index, trigger) in automation.config.trigger.iter().enumerate() {
            match trigger {
                Trigger::Interval { every } => self.spawn_interval(automation, *every),
                Trigger::Schedule { cron, delay } => {
                    let cron = match cron {
                        Some(cron) => cron.clone(),
                        None => match CronSchedule::parse(EVERY_MINUTE) {
                            Ok(cron) => cron,
                            Err(err) => {
                                tracing::warn!(automation = %automation.name(), error = %err, "ignoring schedule");
                                continue;
                            }
                        },
                    };
                    self.spawn_clock(
                        automation,
                        index,
                        *delay,
                        move |after| cron.next_after(after),
                        |at| json!({ "trigger": { "on": "schedule", "fireDate": at } }),
                    );
                }
                Trigger::Sun {
                    event,
                    offset,
                    lat,
                    lon,
                } => {
                    let (event, offset) = (*event, *offset);
                    let position = self.position.or_override(*lat, *lon);
                    self.spawn_clock(
                        automation,
                        index,
                        None,
                        move |after| next_sun_time(event, after, offset, position),
                        move |at| json!({ "trigger": { "on": "sun", "event": event, "time": at } }),
                    );
                }
                _ => {}
            }
        }
    }

    fn spawn_interval(self: &Arc<Self>, automation: &Arc<Automation>, every: Duration) {
        if every.is_zero() {
            tracing::warn!(automation = %automation.name(), "ignoring zero interval");
            return;
        }
        let engine = Arc::clone(self);
        let automation = Arc::clone(automation);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + every;
            let mut ticker = tokio::time::interval_at(start, every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let context = json!({ "trigger": { "on": "interval" } });
                        engine.fire(&automation, context);
                    }
                    () = shutdown.cancelled() => break,
                }
            }
        });
    }

    /// Fire at every instant `next` yields, each strictly after the previous
    /// one, until it yields nothing or the engine stops.
    fn spawn_clock<N, C>(
        self: &Arc<Self>,
        automation: &Arc<Automation>,
        index: usize,
        delay: Option<Duration>,
        next: N,
        context: C,
    ) where
        N: Fn(Timestamp) -> Option<Timestamp> + Send + 'static,
        C: Fn(Timestamp) -> Value + Send + 'static,
    {
        let engine = Arc::clone(self);
        let automation = Arc::clone(automation);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut cursor = now();
            loop {
                let Some(at) = next(cursor.max(now())) else {
                    tracing::info!(automation = %automation.name(), trigger = index, "no further occurrence");
                    break;
                };
                let wait = (at - now()).to_std().unwrap_or_default();
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    () = shutdown.cancelled() => break,
                }
                let key = (automation.name().to_string(), index, at.to_rfc3339());
                engine.dispatch(&automation, key, delay, context(at));
                cursor = at;
            }
        });
    }

    /// Schedule the clock triggers of every registered automation.
    pub fn start(self: &Arc<Self>) {
        self.started.store(true, Ordering::SeqCst);
        for automation in self.list() {
            self.schedule_clocks(&automation);
        }
    }

    /// Stop clock schedules and pending timers, and cancel running
    /// sequences.
    pub fn stop(&self) {
        self.shutdown.cancel();
        for automation in self.list() {
            automation.cancel("shutdown");
        }
    }

    /// Consume the event feed until it closes or the engine stops.
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<Event>) {
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => {
                        self.handle_event(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "automation engine lagging behind events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                () = self.shutdown.cancelled() => break,
            }
        }
        tracing::debug!("automation engine stopped");
    }
}
