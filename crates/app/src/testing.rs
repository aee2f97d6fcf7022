//! In-memory port implementations shared by the unit tests.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;

use senses_domain::error::SensesError;
use senses_domain::event::{Event, EventKind};

use crate::ports::{EventPublisher, MessageBus};

// ── Spy bus ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
}

#[derive(Default)]
pub struct SpyBus {
    pub published: Mutex<Vec<Published>>,
    pub subscribed: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl SpyBus {
    /// Make every publish on `topic` fail.
    pub fn fail_on(&self, topic: &str) {
        self.failing.lock().unwrap().insert(topic.to_string());
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.payload)
            .collect()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }
}

impl MessageBus for SpyBus {
    fn publish(
        &self,
        topic: String,
        payload: String,
        qos: u8,
    ) -> impl Future<Output = Result<(), SensesError>> + Send {
        let result = if self.failing.lock().unwrap().contains(&topic) {
            Err(SensesError::bus(std::io::Error::other(format!(
                "publish to {topic} refused"
            ))))
        } else {
            self.published
                .lock()
                .unwrap()
                .push(Published { topic, payload, qos });
            Ok(())
        };
        async { result }
    }

    fn subscribe(
        &self,
        patterns: Vec<String>,
    ) -> impl Future<Output = Result<(), SensesError>> + Send {
        self.subscribed.lock().unwrap().extend(patterns);
        async { Ok(()) }
    }
}

// ── Spy publisher ──────────────────────────────────────────────────

#[derive(Default)]
pub struct SpyPublisher {
    pub events: Mutex<Vec<Event>>,
}

impl SpyPublisher {
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.kind.clone())
            .collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.kind.name())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Take every recorded event.
    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl EventPublisher for SpyPublisher {
    fn publish(&self, event: Event) -> impl Future<Output = Result<(), SensesError>> + Send {
        self.events.lock().unwrap().push(event);
        async { Ok(()) }
    }
}
