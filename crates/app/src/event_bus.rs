//! The hub's event feed.
//!
//! Device changes, presence updates, raw bus messages and automation runs
//! are fanned out to every listener through a tokio [`broadcast`] channel.
//! The automation engine is the main listener; tools and tests may attach
//! their own.

use std::future::Future;

use tokio::sync::broadcast;

use senses_domain::error::SensesError;
use senses_domain::event::Event;

use crate::ports::EventPublisher;

#[derive(Clone)]
pub struct EventFeed {
    sender: broadcast::Sender<Event>,
}

impl EventFeed {
    /// Feed retaining up to `capacity` events for its slowest listener.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Attach a listener. It sees events published from now on; a listener
    /// falling more than `capacity` events behind gets
    /// [`broadcast::error::RecvError::Lagged`] and resumes with the oldest
    /// retained event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn listeners(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventPublisher for EventFeed {
    fn publish(&self, event: Event) -> impl Future<Output = Result<(), SensesError>> + Send {
        // No listener is not a failure.
        match self.sender.send(event) {
            Ok(listeners) => tracing::trace!(listeners, "event fanned out"),
            Err(broadcast::error::SendError(event)) => tracing::trace!(%event, "event without listener"),
        }
        async { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use senses_domain::device::{StateChange, StateSnapshot};
    use senses_domain::event::EventKind;
    use senses_domain::time::now;
    use serde_json::{Map, json};
    use tokio::sync::broadcast::error::RecvError;

    use super::*;

    fn alive(uid: &str) -> Event {
        Event::new(EventKind::DiscoveryAlive {
            uid: uid.to_string(),
            at: now(),
        })
    }

    // ── Fan-out ──

    #[tokio::test]
    async fn should_hand_device_update_to_every_listener() {
        let feed = EventFeed::new(8);
        let mut engine = feed.subscribe();
        let mut monitor = feed.subscribe();
        assert_eq!(feed.listeners(), 2);

        let fields = Map::from_iter([("state".to_string(), json!("on"))]);
        let change = StateChange {
            old: StateSnapshot::default().into(),
            new: StateSnapshot::new(fields).into(),
        };
        feed.publish(Event::new(EventKind::DeviceUpdated {
            uid: "lamp".to_string(),
            entity_id: "light.lamp".to_string(),
            change,
        }))
        .await
        .unwrap();

        for rx in [&mut engine, &mut monitor] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.kind.name(), "device.updated");
            assert_eq!(event.to_string(), "device.updated(lamp)");
        }
    }

    #[tokio::test]
    async fn should_accept_events_nobody_listens_to() {
        let feed = EventFeed::new(8);
        assert_eq!(feed.listeners(), 0);
        assert!(feed.publish(alive("lamp")).await.is_ok());
    }

    // ── Listener lifecycle ──

    #[tokio::test]
    async fn should_only_show_events_published_after_attaching() {
        let feed = EventFeed::new(8);
        feed.publish(alive("before")).await.unwrap();

        let mut rx = feed.subscribe();
        feed.publish(alive("after")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().to_string(), "discovery.alive(after)");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn should_report_lag_to_slow_listener_and_resume_with_oldest_retained() {
        let feed = EventFeed::new(2);
        let mut rx = feed.subscribe();

        for uid in ["a", "b", "c"] {
            feed.publish(alive(uid)).await.unwrap();
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(1))));
        assert_eq!(rx.recv().await.unwrap().to_string(), "discovery.alive(b)");
        assert_eq!(rx.recv().await.unwrap().to_string(), "discovery.alive(c)");
    }
}
