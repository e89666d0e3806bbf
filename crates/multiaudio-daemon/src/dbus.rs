// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! D-Bus control interface of the daemon.

use crate::service::{DaemonService, SignalEvent};
use multiaudio_ipc::{StatusInfo, DBUS_INTERFACE};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use zbus::interface;

/// The D-Bus interface implementation.
pub struct DaemonDbusService {
    service: Arc<DaemonService>,
}

impl DaemonDbusService {
    pub fn new(service: Arc<DaemonService>) -> Self {
        Self { service }
    }
}

#[interface(name = "com.multiaudio.Daemon")]
impl DaemonDbusService {
    /// Turn multi-audio on. Returns the strategy that carried it and whether
    /// any strategy succeeded.
    async fn activate(&self) -> zbus::fdo::Result<(String, bool)> {
        debug!("D-Bus: activate()");
        let outcome = self.service.activate().await?;
        Ok((outcome.strategy_used.as_str().to_string(), outcome.success))
    }

    /// Turn multi-audio off and revert the system settings.
    async fn deactivate(&self) {
        debug!("D-Bus: deactivate()");
        self.service.deactivate().await;
    }

    /// Ask the broker for its permission on the user's behalf.
    async fn request_grant(&self) -> zbus::fdo::Result<()> {
        debug!("D-Bus: request_grant()");
        self.service.request_grant().await?;
        Ok(())
    }

    /// Record whether the overlay-equivalent permission is granted.
    async fn set_overlay_granted(&self, granted: bool) -> zbus::fdo::Result<()> {
        debug!("D-Bus: set_overlay_granted({})", granted);
        self.service.set_overlay_granted(granted);
        Ok(())
    }

    async fn get_status(&self) -> StatusInfo {
        self.service.status()
    }

    // ==================== Signals ====================
    // Emitted from the forwarding task in main through the helpers below.

    /// Emitted with every user-facing status line.
    #[zbus(signal)]
    async fn status_message(ctx: &zbus::SignalContext<'_>, message: &str) -> zbus::Result<()>;

    /// Emitted when the broker or activation state changes.
    #[zbus(signal)]
    async fn state_changed(ctx: &zbus::SignalContext<'_>, status: StatusInfo) -> zbus::Result<()>;
}

// ==================== Public Signal Emission Helpers ====================
// These functions allow emitting D-Bus signals from outside the interface methods.

/// Emit StatusMessage signal.
pub async fn emit_status_message(ctx: &zbus::SignalContext<'_>, message: &str) -> zbus::Result<()> {
    ctx.connection()
        .emit_signal(
            ctx.destination(),
            ctx.path(),
            DBUS_INTERFACE,
            "StatusMessage",
            &(message,),
        )
        .await
}

/// Emit StateChanged signal.
pub async fn emit_state_changed(
    ctx: &zbus::SignalContext<'_>,
    status: StatusInfo,
) -> zbus::Result<()> {
    ctx.connection()
        .emit_signal(
            ctx.destination(),
            ctx.path(),
            DBUS_INTERFACE,
            "StateChanged",
            &(status,),
        )
        .await
}

/// Hand every queued event to `emit` until `cancel` fires or the channel
/// closes. Events already queued when `cancel` fires are still delivered.
pub async fn forward_signals<F, Fut>(
    mut events: UnboundedReceiver<SignalEvent>,
    cancel: CancellationToken,
    mut emit: F,
) where
    F: FnMut(SignalEvent) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => emit(event).await,
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }
}
