//! # senses-domain
//!
//! Pure domain model for the senses home automation hub.
//!
//! ## Responsibilities
//! - Foundational types: typed identifiers, error conventions, timestamps
//! - **Topic routing**: named-wildcard topic patterns and payload templates
//! - **Handshakes**: the discovery packet peers exchange on the bus
//! - **Devices**: topic routes, payload formats, state snapshots, kinds and drivers
//! - **Automations**: trigger → condition → action configuration
//! - **Time-based rules**: cron schedules and solar times
//! - **Scenes**: named presets announced on the bus
//! - **Events**: records of device, discovery and automation activity
//!
//! ## Dependency rule
//! This crate has **no internal dependencies**.
//! It must never import anything from `app`, adapters, or external IO crates.
//! All IO boundaries are expressed as traits in the `app` crate (ports).

pub mod error;
pub mod id;
pub mod time;

pub mod automation;
pub mod device;
pub mod event;
pub mod handshake;
pub mod scene;
pub mod schedule;
pub mod sun;
pub mod template;
pub mod topic;
