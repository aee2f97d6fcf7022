//! Periodic background tasks: availability re-evaluation and heartbeats.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::device_registry::DeviceRegistry;
use crate::discovery::Discovery;
use crate::ports::{EventPublisher, MessageBus};

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Re-evaluate device availability every `period` so keepalive expiries
/// surface without new messages.
///
/// Returns `None` when `period` is zero.
pub fn spawn_availability_watcher<B, P>(
    registry: Arc<DeviceRegistry<B, P>>,
    period: Duration,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>>
where
    B: MessageBus + Send + Sync + 'static,
    P: EventPublisher + Send + Sync + 'static,
{
    if period.is_zero() {
        tracing::info!("availability watcher disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut interval = ticker(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let changed = registry.refresh_availability().await;
                    if changed > 0 {
                        tracing::debug!(changed, "availability refreshed");
                    }
                }
                () = shutdown.cancelled() => break,
            }
        }
    }))
}

/// Publish `discovery/alive/<uid>` at the configured keepalive interval.
///
/// Returns `None` when keepalive is off or the interval is zero.
pub fn spawn_heartbeat<B, P>(
    discovery: Arc<Discovery<B, P>>,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>>
where
    B: MessageBus + Send + Sync + 'static,
    P: EventPublisher + Send + Sync + 'static,
{
    let period = discovery.config().keepalive_interval;
    if !discovery.config().keepalive || period.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut interval = ticker(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = discovery.heartbeat().await {
                        tracing::warn!(error = %err, "heartbeat failed");
                    }
                }
                () = shutdown.cancelled() => break,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use senses_domain::device::{Device, GenericKind};

    use super::*;
    use crate::discovery::DiscoveryConfig;
    use crate::testing::{SpyBus, SpyPublisher};

    #[tokio::test(start_paused = true)]
    async fn should_mark_silent_keepalive_device_unavailable() {
        let publisher = Arc::new(SpyPublisher::default());
        let registry = Arc::new(DeviceRegistry::new(
            Arc::new(SpyBus::default()),
            Arc::clone(&publisher),
        ));
        let mut device = Device::new("gauge", Arc::new(GenericKind::new("sensor"))).unwrap();
        device.keepalive = true;
        device.timeout = Duration::from_secs(1);
        registry.add(device).await.unwrap();
        assert!(registry.get("gauge").unwrap().available());
        let shutdown = CancellationToken::new();

        let handle = spawn_availability_watcher(
            Arc::clone(&registry),
            Duration::from_millis(10),
            shutdown.clone(),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(!registry.get("gauge").unwrap().available());
        assert!(publisher.names().contains(&"device.updated"));
    }

    #[tokio::test]
    async fn should_disable_watcher_with_zero_interval() {
        let registry = Arc::new(DeviceRegistry::new(
            Arc::new(SpyBus::default()),
            Arc::new(SpyPublisher::default()),
        ));
        assert!(
            spawn_availability_watcher(registry, Duration::ZERO, CancellationToken::new())
                .is_none()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn should_publish_heartbeats() {
        let bus = Arc::new(SpyBus::default());
        let discovery = Arc::new(Discovery::new(
            DiscoveryConfig {
                uid: "hub".to_string(),
                ..DiscoveryConfig::default()
            },
            Arc::clone(&bus),
            Arc::new(SpyPublisher::default()),
        ));
        let shutdown = CancellationToken::new();

        let handle = spawn_heartbeat(discovery, shutdown.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(4500)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(bus.published_on("discovery/alive/hub").len(), 2);
    }
}
