// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Activation and deactivation of multi-audio.
//!
//! `Idle -> Activating -> Active` and `Active -> Deactivating -> Idle`. The
//! blocking strategies run on the blocking pool; calls are serialised so the
//! transitions never interleave.

use crate::focus::AudioFocusFallback;
use crate::monitor::BrokerMonitor;
use crate::service::SignalEvent;
use crate::settings::{
    activation_specs, revert_specs, FallbackOutcome, SettingToggle, SettingsChain,
};
use multiaudio_ipc::{ActivationState, Strategy};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("Precondition unmet: {0}")]
    PreconditionUnmet(String),
}

pub struct Orchestrator {
    monitor: BrokerMonitor,
    chain: Arc<SettingsChain>,
    focus: Arc<AudioFocusFallback>,
    settings: &'static [SettingToggle],
    overlay_granted: Arc<AtomicBool>,
    require_broker_ready: bool,
    state: Mutex<ActivationState>,
    last_outcome: Mutex<Option<FallbackOutcome>>,
    op: tokio::sync::Mutex<()>,
    events: UnboundedSender<SignalEvent>,
}

impl Orchestrator {
    pub fn new(
        monitor: BrokerMonitor,
        chain: SettingsChain,
        focus: AudioFocusFallback,
        settings: &'static [SettingToggle],
        overlay_granted: Arc<AtomicBool>,
        require_broker_ready: bool,
        events: UnboundedSender<SignalEvent>,
    ) -> Self {
        Self {
            monitor,
            chain: Arc::new(chain),
            focus: Arc::new(focus),
            settings,
            overlay_granted,
            require_broker_ready,
            state: Mutex::new(ActivationState::Idle),
            last_outcome: Mutex::new(None),
            op: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn state(&self) -> ActivationState {
        *self.state.lock()
    }

    pub fn last_outcome(&self) -> Option<FallbackOutcome> {
        *self.last_outcome.lock()
    }

    fn check_preconditions(&self) -> Result<(), ActivationError> {
        if !self.overlay_granted.load(Ordering::SeqCst) {
            return Err(ActivationError::PreconditionUnmet(
                "overlay permission not granted".to_string(),
            ));
        }
        if self.require_broker_ready && !self.monitor.is_ready() {
            return Err(ActivationError::PreconditionUnmet(format!(
                "broker is {}",
                self.monitor.state()
            )));
        }
        Ok(())
    }

    /// Turn multi-audio on.
    ///
    /// Settings chain first when the broker is ready, audio-focus ducking when
    /// it is not or when the chain fails entirely. Calling this while already
    /// active returns the recorded outcome.
    pub async fn activate(&self) -> Result<FallbackOutcome, ActivationError> {
        let _op = self.op.lock().await;

        if self.state() == ActivationState::Active {
            if let Some(outcome) = self.last_outcome() {
                info!("Already active via {}", outcome.strategy_used);
                return Ok(outcome);
            }
        }

        if let Err(e) = self.check_preconditions() {
            warn!("Activation refused: {}", e);
            self.notify("Please grant all permissions first");
            return Err(e);
        }

        self.set_state(ActivationState::Activating);

        let outcome = if self.monitor.is_ready() {
            self.apply_settings().await
        } else {
            info!("Broker not ready ({}), skipping settings chain", self.monitor.state());
            FallbackOutcome::failed()
        };

        let outcome = if outcome.success {
            outcome
        } else if self.request_ducking().await {
            FallbackOutcome::succeeded(Strategy::AudioFocusDucking)
        } else {
            FallbackOutcome::failed()
        };

        *self.last_outcome.lock() = Some(outcome);
        if outcome.success {
            info!("Multi-audio active via {}", outcome.strategy_used);
            self.set_state(ActivationState::Active);
            self.notify("Service started");
            self.notify("Multi-audio enabled");
        } else {
            error!("Every multi-audio strategy failed");
            self.set_state(ActivationState::Idle);
            self.notify("Multi-audio unavailable");
        }

        Ok(outcome)
    }

    async fn apply_settings(&self) -> FallbackOutcome {
        let chain = self.chain.clone();
        let monitor = self.monitor.clone();
        let specs = activation_specs(self.settings);
        tokio::task::spawn_blocking(move || chain.apply(&specs, monitor.is_ready()))
            .await
            .unwrap_or_else(|e| {
                error!("Settings worker failed: {}", e);
                FallbackOutcome::failed()
            })
    }

    async fn request_ducking(&self) -> bool {
        let focus = self.focus.clone();
        tokio::task::spawn_blocking(move || focus.request_ducking())
            .await
            .unwrap_or_else(|e| {
                error!("Audio focus worker failed: {}", e);
                false
            })
    }

    /// Turn multi-audio off.
    ///
    /// Always issues the revert commands, whatever activation did (or did not
    /// do), and releases any audio focus held. Never fails.
    pub async fn deactivate(&self) {
        let _op = self.op.lock().await;
        self.set_state(ActivationState::Deactivating);

        let chain = self.chain.clone();
        let focus = self.focus.clone();
        let specs = revert_specs(self.settings);
        let result = tokio::task::spawn_blocking(move || {
            chain.revert(&specs);
            focus.abandon();
        })
        .await;
        if let Err(e) = result {
            error!("Revert worker failed: {}", e);
        }

        self.set_state(ActivationState::Idle);
        self.notify("Service stopped");
        self.notify("Multi-audio disabled");
    }

    fn set_state(&self, to: ActivationState) {
        let previous = std::mem::replace(&mut *self.state.lock(), to);
        if previous != to {
            info!("Activation state {} -> {}", previous, to);
            let _ = self.events.send(SignalEvent::StateChanged);
        }
    }

    fn notify(&self, message: &str) {
        info!("{}", message);
        let _ = self
            .events
            .send(SignalEvent::StatusMessage(message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::UnreachableBroker;
    use crate::command::ExecutionContext;
    use crate::focus::tests::{Call, FakePlatform};
    use crate::focus::FocusRequestResult;
    use crate::monitor::tests::{monitor_with, FakeBroker};
    use crate::settings::tests::ScriptedRunner;
    use crate::settings::MULTI_AUDIO_SETTINGS;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct Harness {
        orchestrator: Orchestrator,
        privileged: Arc<ScriptedRunner>,
        unprivileged: Arc<ScriptedRunner>,
        platform: Arc<FakePlatform>,
        overlay: Arc<AtomicBool>,
        _monitor_rx: UnboundedReceiver<SignalEvent>,
        rx: UnboundedReceiver<SignalEvent>,
    }

    impl Harness {
        fn focus_requests(&self) -> usize {
            self.platform.requests.load(Ordering::SeqCst)
        }

        fn messages(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                if let SignalEvent::StatusMessage(m) = event {
                    out.push(m);
                }
            }
            out
        }
    }

    async fn harness(
        broker: Arc<FakeBroker>,
        privileged: ScriptedRunner,
        unprivileged: ScriptedRunner,
        focus_result: FocusRequestResult,
        require_broker_ready: bool,
    ) -> Harness {
        let (monitor, monitor_rx) = monitor_with(broker);
        monitor.on_broker_available().await;

        let privileged = Arc::new(privileged);
        let unprivileged = Arc::new(unprivileged);
        let platform = FakePlatform::new(20, focus_result);
        let overlay = Arc::new(AtomicBool::new(true));
        let (tx, rx) = unbounded_channel();

        let orchestrator = Orchestrator::new(
            monitor,
            SettingsChain::new(privileged.clone(), unprivileged.clone()),
            AudioFocusFallback::new(platform.clone()),
            &MULTI_AUDIO_SETTINGS,
            overlay.clone(),
            require_broker_ready,
            tx,
        );

        Harness {
            orchestrator,
            privileged,
            unprivileged,
            platform,
            overlay,
            _monitor_rx: monitor_rx,
            rx,
        }
    }

    fn ok(context: ExecutionContext) -> ScriptedRunner {
        ScriptedRunner::ok(context)
    }

    fn failing(context: ExecutionContext) -> ScriptedRunner {
        ScriptedRunner::failing_all(context)
    }

    #[tokio::test]
    async fn test_privileged_activation() {
        let mut h = harness(
            FakeBroker::alive(true),
            ok(ExecutionContext::Privileged),
            ok(ExecutionContext::Unprivileged),
            FocusRequestResult::Granted,
            false,
        )
        .await;

        let outcome = h.orchestrator.activate().await.unwrap();
        assert_eq!(outcome, FallbackOutcome::succeeded(Strategy::Privileged));
        assert_eq!(h.orchestrator.state(), ActivationState::Active);
        assert!(h.unprivileged.calls().is_empty());
        assert_eq!(h.focus_requests(), 0);
        assert!(h.messages().contains(&"Multi-audio enabled".to_string()));
    }

    #[tokio::test]
    async fn test_first_privileged_command_fails() {
        let h = harness(
            FakeBroker::alive(true),
            ScriptedRunner::failing_on(
                ExecutionContext::Privileged,
                "settings put system sound_effects_enabled 0",
            ),
            ok(ExecutionContext::Unprivileged),
            FocusRequestResult::Granted,
            false,
        )
        .await;

        let outcome = h.orchestrator.activate().await.unwrap();
        assert_eq!(outcome, FallbackOutcome::succeeded(Strategy::Unprivileged));
        assert_eq!(h.unprivileged.calls().len(), 2);
        assert_eq!(h.focus_requests(), 0);
    }

    #[tokio::test]
    async fn test_total_chain_failure_requests_focus_once() {
        let h = harness(
            FakeBroker::alive(true),
            failing(ExecutionContext::Privileged),
            failing(ExecutionContext::Unprivileged),
            FocusRequestResult::Granted,
            false,
        )
        .await;

        let outcome = h.orchestrator.activate().await.unwrap();
        assert_eq!(outcome, FallbackOutcome::succeeded(Strategy::AudioFocusDucking));
        assert_eq!(h.focus_requests(), 1);
        assert_eq!(h.orchestrator.state(), ActivationState::Active);
    }

    #[tokio::test]
    async fn test_everything_fails() {
        let mut h = harness(
            FakeBroker::alive(true),
            failing(ExecutionContext::Privileged),
            failing(ExecutionContext::Unprivileged),
            FocusRequestResult::Failed,
            false,
        )
        .await;

        let outcome = h.orchestrator.activate().await.unwrap();
        assert_eq!(outcome, FallbackOutcome::failed());
        assert_eq!(h.focus_requests(), 1);
        assert_eq!(h.orchestrator.state(), ActivationState::Idle);
        assert_eq!(h.orchestrator.last_outcome(), Some(FallbackOutcome::failed()));
        assert!(h.messages().contains(&"Multi-audio unavailable".to_string()));
    }

    #[tokio::test]
    async fn test_silent_broker_routes_to_focus() {
        let broker = FakeBroker::dead();
        let h = harness(
            broker.clone(),
            ok(ExecutionContext::Privileged),
            ok(ExecutionContext::Unprivileged),
            FocusRequestResult::Granted,
            false,
        )
        .await;
        h.orchestrator.monitor.start();

        let outcome = tokio::time::timeout(Duration::from_secs(5), h.orchestrator.activate())
            .await
            .expect("activation must not hang")
            .unwrap();
        assert_eq!(outcome.strategy_used, Strategy::AudioFocusDucking);
        assert!(h.privileged.calls().is_empty());
        assert!(h.unprivileged.calls().is_empty());
        h.orchestrator.monitor.shutdown();
    }

    #[tokio::test]
    async fn test_unreachable_broker_bus_falls_back_to_focus() {
        let unreachable = Arc::new(UnreachableBroker::new("no system bus"));
        let (monitor_tx, _monitor_rx) = unbounded_channel();
        let monitor = BrokerMonitor::new(
            unreachable.clone(),
            Duration::from_millis(1000),
            Duration::from_secs(5),
            monitor_tx,
        );
        monitor.start();

        let unprivileged = Arc::new(ok(ExecutionContext::Unprivileged));
        let platform = FakePlatform::new(20, FocusRequestResult::Granted);
        let (tx, mut rx) = unbounded_channel();
        let orchestrator = Orchestrator::new(
            monitor.clone(),
            SettingsChain::new(unreachable, unprivileged.clone()),
            AudioFocusFallback::new(platform.clone()),
            &MULTI_AUDIO_SETTINGS,
            Arc::new(AtomicBool::new(true)),
            false,
            tx,
        );

        let outcome = orchestrator.activate().await.unwrap();
        assert_eq!(outcome, FallbackOutcome::succeeded(Strategy::AudioFocusDucking));
        assert!(unprivileged.calls().is_empty());
        assert_eq!(platform.requests.load(Ordering::SeqCst), 1);

        orchestrator.deactivate().await;
        assert_eq!(orchestrator.state(), ActivationState::Idle);
        let mut messages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SignalEvent::StatusMessage(m) = event {
                messages.push(m);
            }
        }
        assert_eq!(messages.last().map(String::as_str), Some("Multi-audio disabled"));
        monitor.shutdown();
    }

    #[tokio::test]
    async fn test_missing_overlay_fails_fast() {
        let mut h = harness(
            FakeBroker::alive(true),
            ok(ExecutionContext::Privileged),
            ok(ExecutionContext::Unprivileged),
            FocusRequestResult::Granted,
            false,
        )
        .await;
        h.overlay.store(false, Ordering::SeqCst);

        let err = h.orchestrator.activate().await.unwrap_err();
        assert!(matches!(err, ActivationError::PreconditionUnmet(_)));
        assert!(h.privileged.calls().is_empty());
        assert!(h.unprivileged.calls().is_empty());
        assert_eq!(h.focus_requests(), 0);
        assert_eq!(h.orchestrator.state(), ActivationState::Idle);
        assert!(h.messages().contains(&"Please grant all permissions first".to_string()));
    }

    #[tokio::test]
    async fn test_required_broker_readiness() {
        let h = harness(
            FakeBroker::alive(false),
            ok(ExecutionContext::Privileged),
            ok(ExecutionContext::Unprivileged),
            FocusRequestResult::Granted,
            true,
        )
        .await;

        let err = h.orchestrator.activate().await.unwrap_err();
        assert!(err.to_string().contains("connected"));
        assert_eq!(h.focus_requests(), 0);
    }

    #[tokio::test]
    async fn test_activate_twice_keeps_outcome() {
        let h = harness(
            FakeBroker::alive(true),
            ok(ExecutionContext::Privileged),
            ok(ExecutionContext::Unprivileged),
            FocusRequestResult::Granted,
            false,
        )
        .await;

        h.orchestrator.activate().await.unwrap();
        let again = h.orchestrator.activate().await.unwrap();
        assert_eq!(again.strategy_used, Strategy::Privileged);
        assert_eq!(h.privileged.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_deactivate_without_activation() {
        let mut h = harness(
            FakeBroker::dead(),
            failing(ExecutionContext::Privileged),
            ok(ExecutionContext::Unprivileged),
            FocusRequestResult::Granted,
            false,
        )
        .await;

        h.orchestrator.deactivate().await;
        assert_eq!(
            h.privileged.calls(),
            vec![
                "settings put system sound_effects_enabled 1".to_string(),
                "settings put global audio_focus_control default".to_string(),
            ]
        );
        assert!(h.unprivileged.calls().is_empty());
        assert_eq!(h.orchestrator.state(), ActivationState::Idle);
        assert!(h.messages().contains(&"Multi-audio disabled".to_string()));
    }

    #[tokio::test]
    async fn test_deactivate_releases_focus() {
        let h = harness(
            FakeBroker::dead(),
            ok(ExecutionContext::Privileged),
            ok(ExecutionContext::Unprivileged),
            FocusRequestResult::Granted,
            false,
        )
        .await;

        h.orchestrator.activate().await.unwrap();
        h.orchestrator.deactivate().await;
        assert_eq!(h.platform.calls.lock().last(), Some(&Call::Abandon));
        assert_eq!(h.orchestrator.state(), ActivationState::Idle);
    }
}
