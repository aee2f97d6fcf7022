//! # senses-app
//!
//! Application layer — use-cases and **port definitions** (traits).
//!
//! ## Responsibilities
//! - Define **port traits** that adapters must implement:
//!   - `MessageBus` — publish and subscribe on the message bus
//!   - `EventPublisher` — emit domain events
//! - Keep devices in sync with the bus (`DeviceRegistry`)
//! - Speak the discovery protocol (`Discovery`)
//! - Run automations (`AutomationEngine`) gated by a priority `Semaphore`
//!   and cancelled through a `Signal`
//! - Keep named scenes and announce their activation (`SceneRegistry`)
//! - Wire everything together in the `Hub`
//!
//! ## Dependency rule
//! Depends on `senses-domain` only (plus `tokio` for tasks and channels).
//! Never imports adapter crates. Adapters depend on *this* crate, not the reverse.

pub mod automation_engine;
pub mod cancellation;
pub mod device_registry;
pub mod discovery;
pub mod event_bus;
pub mod hub;
pub mod ports;
pub mod scenes;
pub mod semaphore;
pub mod services;
pub mod watcher;

#[cfg(test)]
mod testing;
