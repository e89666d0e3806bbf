// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Broker connection state machine.
//!
//! `Disconnected -> Connected -> PermissionGranted | PermissionDenied`, and
//! back to `Disconnected` whenever the broker goes away. Losing the broker
//! re-arms a single poll loop that pings once per interval until the broker
//! answers, then runs the permission path again.

use crate::broker::{BrokerChannel, BrokerError};
use crate::service::SignalEvent;
use multiaudio_ipc::BrokerConnectionState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum GrantError {
    #[error("Broker service not running")]
    BrokerNotRunning,
    #[error("Please grant permission in the broker app")]
    RationaleRequired,
    #[error("Broker is {0}, not connected")]
    NotConnected(BrokerConnectionState),
    #[error("Monitor shut down")]
    ShutDown,
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

struct Inner {
    broker: Arc<dyn BrokerChannel>,
    state: Mutex<BrokerConnectionState>,
    /// Result of the last ping.
    alive: AtomicBool,
    /// Set while a poll loop owns the ping timer.
    polling: AtomicBool,
    /// Outstanding grant requests and their timeout timers.
    pending: Mutex<HashMap<u32, JoinHandle<()>>>,
    next_token: AtomicU32,
    poll_interval: Duration,
    grant_timeout: Duration,
    cancel: CancellationToken,
    events: UnboundedSender<SignalEvent>,
}

/// Shared handle to the broker connection state machine.
#[derive(Clone)]
pub struct BrokerMonitor {
    inner: Arc<Inner>,
}

impl BrokerMonitor {
    pub fn new(
        broker: Arc<dyn BrokerChannel>,
        poll_interval: Duration,
        grant_timeout: Duration,
        events: UnboundedSender<SignalEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                state: Mutex::new(BrokerConnectionState::Disconnected),
                alive: AtomicBool::new(false),
                polling: AtomicBool::new(false),
                pending: Mutex::new(HashMap::new()),
                next_token: AtomicU32::new(1),
                poll_interval,
                grant_timeout,
                cancel: CancellationToken::new(),
                events,
            }),
        }
    }

    pub fn state(&self) -> BrokerConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == BrokerConnectionState::PermissionGranted
    }

    /// Whether the broker answered the last ping.
    pub fn broker_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn is_polling(&self) -> bool {
        self.inner.polling.load(Ordering::SeqCst)
    }

    /// Token cancelled on [`shutdown`](Self::shutdown), for tasks that feed
    /// the monitor.
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    pub async fn ping_broker(&self) -> bool {
        let alive = self.inner.broker.ping().await;
        self.inner.alive.store(alive, Ordering::SeqCst);
        alive
    }

    /// Arm the poll loop with the configured interval.
    pub fn start(&self) -> bool {
        self.poll_until_ready(self.inner.poll_interval)
    }

    /// Probe the broker every `interval` until it answers, then enter the
    /// permission path.
    ///
    /// Returns `false` without doing anything when a loop is already running
    /// or the monitor has been shut down.
    pub fn poll_until_ready(&self, interval: Duration) -> bool {
        if self.inner.cancel.is_cancelled() {
            return false;
        }
        if self
            .inner
            .polling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Poll loop already running");
            return false;
        }

        let monitor = self.clone();
        tokio::spawn(async move { monitor.poll_loop(interval).await });
        true
    }

    async fn poll_loop(&self, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Something else (a name-owner signal) already connected us.
            if self.state() != BrokerConnectionState::Disconnected {
                debug!("Broker connected elsewhere, stopping poll loop");
                break;
            }

            if self.ping_broker().await {
                // Release the guard first so a loss during the permission
                // path can re-arm polling.
                self.inner.polling.store(false, Ordering::SeqCst);
                self.on_broker_available().await;
                return;
            }

            self.notify("Waiting for broker...");
        }

        self.release_poll_guard();
    }

    /// Clear the running-loop flag. A loss that arrived while the flag was
    /// still set could not arm a loop of its own, so arm one now.
    fn release_poll_guard(&self) {
        self.inner.polling.store(false, Ordering::SeqCst);
        if self.state() == BrokerConnectionState::Disconnected {
            self.start();
        }
    }

    /// The broker appeared. Moves `Disconnected -> Connected` and checks or
    /// requests the permission.
    pub async fn on_broker_available(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        if !self.transition_from(BrokerConnectionState::Disconnected, BrokerConnectionState::Connected) {
            debug!("Broker available while {}, ignoring", self.state());
            return;
        }
        self.inner.alive.store(true, Ordering::SeqCst);
        self.notify("Broker connected");
        self.check_and_request_permission().await;
    }

    /// The broker went away. Forces `Disconnected`, drops pending grants and
    /// re-arms polling.
    pub fn on_broker_lost(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        let previous = self.transition(BrokerConnectionState::Disconnected);
        self.inner.alive.store(false, Ordering::SeqCst);
        self.clear_pending();
        if previous != BrokerConnectionState::Disconnected {
            self.notify("Broker disconnected");
        }
        self.start();
    }

    async fn check_and_request_permission(&self) {
        match self.inner.broker.check_self_permission().await {
            Ok(true) => {
                if self.transition_from(
                    BrokerConnectionState::Connected,
                    BrokerConnectionState::PermissionGranted,
                ) {
                    self.notify("Broker ready");
                }
            }
            Ok(false) => {
                if let Err(e) = self.request_permission().await {
                    warn!("Could not request broker permission: {}", e);
                }
            }
            Err(BrokerError::Disconnected) => self.on_broker_lost(),
            Err(e) => warn!("Permission check failed: {}", e),
        }
    }

    /// Send a grant request tagged with a fresh correlation token.
    ///
    /// Only valid while `Connected`. The request stays pending until
    /// [`resolve`](Self::resolve) is called with its token, the broker is
    /// lost, or the grant timeout expires.
    pub async fn request_permission(&self) -> Result<u32, GrantError> {
        if self.inner.cancel.is_cancelled() {
            return Err(GrantError::ShutDown);
        }
        let state = self.state();
        if state != BrokerConnectionState::Connected {
            return Err(GrantError::NotConnected(state));
        }

        let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst);
        let timer = {
            let monitor = self.clone();
            let timeout = self.inner.grant_timeout;
            let cancel = self.inner.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => monitor.expire(token),
                }
            })
        };
        self.inner.pending.lock().insert(token, timer);

        if let Err(e) = self.inner.broker.request_permission(token).await {
            if let Some(timer) = self.inner.pending.lock().remove(&token) {
                timer.abort();
            }
            if matches!(e, BrokerError::Disconnected) {
                self.on_broker_lost();
            }
            return Err(e.into());
        }

        info!("Requested broker permission (token {})", token);
        Ok(token)
    }

    /// Deliver the broker's answer for `token`.
    pub fn resolve(&self, token: u32, granted: bool) {
        if self.inner.cancel.is_cancelled() {
            debug!("Dropping grant result {} after shutdown", token);
            return;
        }
        let Some(timer) = self.inner.pending.lock().remove(&token) else {
            debug!("Ignoring grant result for unknown token {}", token);
            return;
        };
        timer.abort();

        let target = if granted {
            BrokerConnectionState::PermissionGranted
        } else {
            BrokerConnectionState::PermissionDenied
        };
        if !self.transition_from(BrokerConnectionState::Connected, target) {
            debug!("Grant result {} arrived while {}, ignoring", token, self.state());
            return;
        }
        if granted {
            self.notify("Broker permission granted");
        } else {
            self.notify("Broker permission denied");
        }
    }

    fn expire(&self, token: u32) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        if self.inner.pending.lock().remove(&token).is_some() {
            warn!("Grant request {} timed out", token);
            self.notify("Broker permission request timed out");
        }
    }

    /// User-initiated grant request.
    ///
    /// Unlike the automatic path this is allowed from `PermissionDenied`,
    /// which otherwise is terminal for the session.
    pub async fn request_grant(&self) -> Result<(), GrantError> {
        if self.inner.cancel.is_cancelled() {
            return Err(GrantError::ShutDown);
        }
        if !self.ping_broker().await {
            self.notify("Broker service not running");
            return Err(GrantError::BrokerNotRunning);
        }
        if self.inner.broker.should_show_rationale().await? {
            self.notify("Please grant permission in the broker app");
            return Err(GrantError::RationaleRequired);
        }

        match self.state() {
            BrokerConnectionState::PermissionGranted => {
                self.notify("Broker ready");
                Ok(())
            }
            BrokerConnectionState::Disconnected => {
                self.on_broker_available().await;
                Ok(())
            }
            BrokerConnectionState::PermissionDenied => {
                self.transition_from(
                    BrokerConnectionState::PermissionDenied,
                    BrokerConnectionState::Connected,
                );
                self.request_permission().await.map(|_| ())
            }
            BrokerConnectionState::Connected => self.request_permission().await.map(|_| ()),
        }
    }

    /// Stop polling, drop pending grants and ignore every later callback.
    pub fn shutdown(&self) {
        info!("Shutting down broker monitor");
        self.inner.cancel.cancel();
        self.clear_pending();
    }

    fn clear_pending(&self) {
        for (token, timer) in self.inner.pending.lock().drain() {
            debug!("Dropping pending grant request {}", token);
            timer.abort();
        }
    }

    /// Unconditional transition. Returns the previous state.
    fn transition(&self, to: BrokerConnectionState) -> BrokerConnectionState {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), to);
        if previous != to {
            info!("Broker state {} -> {}", previous, to);
            let _ = self.inner.events.send(SignalEvent::StateChanged);
        }
        previous
    }

    /// Transition only when currently in `from`.
    fn transition_from(&self, from: BrokerConnectionState, to: BrokerConnectionState) -> bool {
        {
            let mut state = self.inner.state.lock();
            if *state != from {
                return false;
            }
            *state = to;
        }
        info!("Broker state {} -> {}", from, to);
        let _ = self.inner.events.send(SignalEvent::StateChanged);
        true
    }

    fn notify(&self, message: &str) {
        info!("{}", message);
        let _ = self
            .inner
            .events
            .send(SignalEvent::StatusMessage(message.to_string()));
    }
}
