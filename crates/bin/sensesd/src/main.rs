//! # sensesd — senses daemon
//!
//! Composition root that wires the MQTT adapter to the hub and runs it.
//!
//! ## Responsibilities
//! - Load configuration (config file, env vars)
//! - Initialize structured logging
//! - Connect to the MQTT broker
//! - Build the hub, register built-in services, static devices, scenes and automations
//! - Feed inbound bus events to the hub until SIGTERM/SIGINT
//! - Announce departure and disconnect cleanly on shutdown
//!
//! ## Dependency rule
//! This is the **only** crate that depends on all other crates.
//! It is the wiring layer — no domain logic belongs here.

mod config;

use std::time::Duration;

use anyhow::Context;
use senses_app::hub::Hub;
use senses_domain::device::DriverRegistry;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = Config::load().context("unable to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.logging.filter))
        .init();

    // Broker
    let mqtt_shutdown = CancellationToken::new();
    let (bus, inbound, mqtt_task) =
        senses_adapter_mqtt::connect(&config.mqtt, mqtt_shutdown.clone());

    // Hub
    let hub = Hub::new(
        bus.clone(),
        config.discovery.clone(),
        config.position,
        DriverRegistry::with_builtin(),
    );
    hub.register_builtin_services()
        .context("unable to register built-in services")?;
    for device in &config.devices {
        hub.add_static_device(device)
            .await
            .with_context(|| format!("unable to add device {:?}", device.name))?;
    }
    for scene in &config.scenes {
        hub.add_scene(scene)
            .with_context(|| format!("unable to add scene {:?}", scene.name))?;
    }
    for automation in std::mem::take(&mut config.automations) {
        let name = automation.name.clone();
        hub.add_automation(automation)
            .await
            .with_context(|| format!("unable to add automation {name:?}"))?;
    }
    let background = hub.spawn_background(config.watcher.interval);

    tracing::info!(
        broker = %config.broker_addr(),
        uid = %hub.discovery().uid(),
        devices = config.devices.len(),
        scenes = config.scenes.len(),
        "sensesd started"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    hub.run(inbound, shutdown).await;

    for handle in background {
        if let Err(err) = handle.await {
            tracing::warn!(error = %err, "background task failed");
        }
    }
    if let Err(err) = bus.disconnect().await {
        tracing::warn!(error = %err, "unable to disconnect from broker");
    }
    if tokio::time::timeout(DISCONNECT_GRACE, mqtt_task).await.is_err() {
        tracing::warn!("MQTT event loop did not stop in time");
    }
    mqtt_shutdown.cancel();

    tracing::info!("sensesd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received ctrl-c"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
