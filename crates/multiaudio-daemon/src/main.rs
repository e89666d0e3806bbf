// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! multiaudio daemon - keeps concurrent audio playback working.
//!
//! The daemon watches a privileged broker, applies the multi-audio system
//! settings through it when allowed, and falls back to unprivileged commands
//! and finally to audio-focus ducking. It exposes a D-Bus interface that the
//! `multiaudio` client connects to.

mod broker;
mod command;
mod config;
mod dbus;
mod focus;
mod monitor;
mod orchestrator;
mod pulse_focus;
mod service;
mod settings;

use broker::{BrokerChannel, DbusBroker, UnreachableBroker};
use command::{CommandRunner, ShellRunner};
use dbus::DaemonDbusService;
use focus::AudioFocusFallback;
use monitor::BrokerMonitor;
use multiaudio_ipc::{DBUS_NAME, DBUS_PATH};
use pulse_focus::PulseFocusPlatform;
use service::{DaemonService, SignalEvent};
use settings::SettingsChain;
use std::sync::Arc;
use tokio::sync::mpsc as tokio_mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zbus::connection::Builder;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("multiaudio_daemon=debug".parse().unwrap())
                .add_directive("zbus=warn".parse().unwrap()),
        )
        .init();

    info!("multiaudio daemon starting...");

    // Load configuration, leaving an editable file behind on first start
    let config_manager = config::ConfigManager::new()?;
    let first_start = !config_manager.config_exists();
    let daemon_config = config_manager.load_config().unwrap_or_else(|e| {
        error!("Failed to load config, using defaults: {}", e);
        config::DaemonConfig::default()
    });
    if first_start {
        if let Err(e) = config_manager.save_config(&daemon_config) {
            warn!("Failed to write default config: {}", e);
        }
    }

    info!(
        "Broker {} on the {:?} bus, polling every {:?}",
        daemon_config.broker.bus_name,
        daemon_config.broker.bus,
        daemon_config.broker.poll_interval()
    );

    // Create signal channel for D-Bus signal events
    let (signal_tx, signal_rx) = tokio_mpsc::unbounded_channel::<SignalEvent>();

    // Broker channel and the runners for both execution contexts. Without a
    // reachable bus the broker stays disconnected and activation falls back
    // to audio focus.
    let (broker, privileged, dbus_broker): (
        Arc<dyn BrokerChannel>,
        Arc<dyn CommandRunner>,
        Option<Arc<DbusBroker>>,
    ) = match DbusBroker::connect(&daemon_config.broker).await {
        Ok(dbus_broker) => {
            let dbus_broker = Arc::new(dbus_broker);
            let privileged: Arc<dyn CommandRunner> = match dbus_broker.runner() {
                Ok(runner) => Arc::new(runner),
                Err(e) => {
                    warn!("Privileged runner unavailable: {}", e);
                    Arc::new(UnreachableBroker::new(e.to_string()))
                }
            };
            let channel: Arc<dyn BrokerChannel> = dbus_broker.clone();
            (channel, privileged, Some(dbus_broker))
        }
        Err(e) => {
            warn!("Broker bus unavailable, continuing without privileged access: {}", e);
            let unreachable = Arc::new(UnreachableBroker::new(e.to_string()));
            let channel: Arc<dyn BrokerChannel> = unreachable.clone();
            let privileged: Arc<dyn CommandRunner> = unreachable;
            (channel, privileged, None)
        }
    };
    let unprivileged = Arc::new(ShellRunner::new());
    let chain = SettingsChain::new(privileged, unprivileged);

    let platform = Arc::new(PulseFocusPlatform::detect(&daemon_config.audio_focus));
    let focus = AudioFocusFallback::new(platform);
    info!("Using {} audio focus requests", focus.shape());

    let monitor = BrokerMonitor::new(
        broker,
        daemon_config.broker.poll_interval(),
        daemon_config.broker.grant_timeout(),
        signal_tx.clone(),
    );

    let service = Arc::new(DaemonService::new(
        daemon_config,
        Some(config_manager),
        monitor,
        chain,
        focus,
        signal_tx,
    ));

    // Watch the broker name and grant results until shutdown
    let watch_task = dbus_broker.map(|broker| {
        let monitor = service.monitor().clone();
        let cancel = monitor.cancel_token();
        tokio::spawn(async move {
            if let Err(e) = broker.watch(monitor, cancel).await {
                error!("Broker watch stopped: {}", e);
            }
        })
    });
    service.monitor().start();

    // Build D-Bus connection
    let connection = Builder::session()?
        .name(DBUS_NAME)?
        .serve_at(DBUS_PATH, DaemonDbusService::new(service.clone()))?
        .build()
        .await?;

    info!("D-Bus service registered at {}", DBUS_NAME);
    info!("multiaudio daemon ready");

    // Spawn task to emit D-Bus signals from the signal channel. It has its
    // own token so the messages queued during shutdown still go out.
    let signal_service = service.clone();
    let signal_cancel = CancellationToken::new();
    let signal_task = tokio::spawn(dbus::forward_signals(
        signal_rx,
        signal_cancel.clone(),
        move |event| {
            let connection = connection.clone();
            let service = signal_service.clone();
            async move {
                let object_server = connection.object_server();
                let iface_ref =
                    match object_server.interface::<_, DaemonDbusService>(DBUS_PATH).await {
                        Ok(iface) => iface,
                        Err(e) => {
                            warn!("Failed to get D-Bus interface for signal: {}", e);
                            return;
                        }
                    };
                let ctx = iface_ref.signal_context();
                match event {
                    SignalEvent::StatusMessage(message) => {
                        debug!("Emitting D-Bus StatusMessage signal: {}", message);
                        if let Err(e) = dbus::emit_status_message(ctx, &message).await {
                            warn!("Failed to emit StatusMessage signal: {}", e);
                        }
                    }
                    SignalEvent::StateChanged => {
                        debug!("Emitting D-Bus StateChanged signal");
                        if let Err(e) = dbus::emit_state_changed(ctx, service.status()).await {
                            warn!("Failed to emit StateChanged signal: {}", e);
                        }
                    }
                }
            }
        },
    ));

    // Handle shutdown signals
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
    }

    // Cancels the monitor's timers and the watch task, then puts the
    // settings back. The signal task drains the teardown messages after.
    service.shutdown().await;
    signal_cancel.cancel();

    if let Some(watch_task) = watch_task {
        let _ = tokio::time::timeout(tokio::time::Duration::from_secs(2), watch_task).await;
    }
    let _ = tokio::time::timeout(tokio::time::Duration::from_secs(1), signal_task).await;

    info!("multiaudio daemon stopped");
    Ok(())
}
