// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Daemon service: ties the broker monitor, the orchestrator and the
//! user-granted permissions together behind one control surface.

use crate::broker::BrokerError;
use crate::config::{ConfigManager, DaemonConfig};
use crate::focus::AudioFocusFallback;
use crate::monitor::{BrokerMonitor, GrantError};
use crate::orchestrator::{ActivationError, Orchestrator};
use crate::settings::{FallbackOutcome, SettingsChain, MULTI_AUDIO_SETTINGS};
use multiaudio_ipc::{ControlError, StatusInfo, Strategy};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

/// Events to be emitted as D-Bus signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    StatusMessage(String),
    /// Some part of the status snapshot changed.
    StateChanged,
}

impl From<GrantError> for ControlError {
    fn from(e: GrantError) -> Self {
        match e {
            GrantError::BrokerNotRunning | GrantError::Broker(BrokerError::Disconnected) => {
                ControlError::BrokerNotRunning
            }
            GrantError::RationaleRequired => ControlError::PreconditionUnmet(e.to_string()),
            other => ControlError::Internal(other.to_string()),
        }
    }
}

impl From<ActivationError> for ControlError {
    fn from(e: ActivationError) -> Self {
        match e {
            ActivationError::PreconditionUnmet(reason) => ControlError::PreconditionUnmet(reason),
        }
    }
}

pub struct DaemonService {
    monitor: BrokerMonitor,
    orchestrator: Orchestrator,
    overlay_granted: Arc<AtomicBool>,
    config: Mutex<DaemonConfig>,
    config_manager: Option<ConfigManager>,
    events: UnboundedSender<SignalEvent>,
}

impl DaemonService {
    pub fn new(
        config: DaemonConfig,
        config_manager: Option<ConfigManager>,
        monitor: BrokerMonitor,
        chain: SettingsChain,
        focus: AudioFocusFallback,
        events: UnboundedSender<SignalEvent>,
    ) -> Self {
        let overlay_granted = Arc::new(AtomicBool::new(config.activation.overlay_granted));
        let orchestrator = Orchestrator::new(
            monitor.clone(),
            chain,
            focus,
            &MULTI_AUDIO_SETTINGS,
            overlay_granted.clone(),
            config.activation.require_broker_ready,
            events.clone(),
        );
        Self {
            monitor,
            orchestrator,
            overlay_granted,
            config: Mutex::new(config),
            config_manager,
            events,
        }
    }

    pub fn monitor(&self) -> &BrokerMonitor {
        &self.monitor
    }

    /// Snapshot for status displays.
    pub fn status(&self) -> StatusInfo {
        let (strategy, success) = self
            .orchestrator
            .last_outcome()
            .map(|o| (o.strategy_used, o.success))
            .unwrap_or((Strategy::None, false));
        StatusInfo::new(
            self.monitor.state(),
            self.orchestrator.state(),
            self.overlay_granted.load(Ordering::SeqCst),
            self.monitor.broker_alive(),
            strategy,
            success,
        )
    }

    pub async fn activate(&self) -> Result<FallbackOutcome, ControlError> {
        Ok(self.orchestrator.activate().await?)
    }

    pub async fn deactivate(&self) {
        self.orchestrator.deactivate().await;
    }

    pub async fn request_grant(&self) -> Result<(), ControlError> {
        Ok(self.monitor.request_grant().await?)
    }

    /// Record the overlay-equivalent permission and persist it.
    pub fn set_overlay_granted(&self, granted: bool) {
        let previous = self.overlay_granted.swap(granted, Ordering::SeqCst);
        if previous == granted {
            return;
        }
        info!("Overlay permission {}", if granted { "granted" } else { "revoked" });

        if let Some(manager) = &self.config_manager {
            let mut config = self.config.lock();
            config.activation.overlay_granted = granted;
            if let Err(e) = manager.save_config(&config) {
                warn!("Failed to persist overlay permission: {}", e);
            }
        }
        let _ = self.events.send(SignalEvent::StateChanged);
    }

    /// Stop the monitor and put the system settings back.
    pub async fn shutdown(&self) {
        self.monitor.shutdown();
        self.orchestrator.deactivate().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ExecutionContext;
    use crate::focus::tests::FakePlatform;
    use crate::focus::FocusRequestResult;
    use crate::monitor::tests::{monitor_with, FakeBroker};
    use crate::settings::tests::ScriptedRunner;
    use multiaudio_ipc::{ActivationState, BrokerConnectionState};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct Fixture {
        service: DaemonService,
        privileged: Arc<ScriptedRunner>,
        rx: UnboundedReceiver<SignalEvent>,
        _monitor_rx: UnboundedReceiver<SignalEvent>,
    }

    fn fixture(
        broker: Arc<FakeBroker>,
        config: DaemonConfig,
        manager: Option<ConfigManager>,
    ) -> Fixture {
        let (monitor, monitor_rx) = monitor_with(broker);
        let privileged = Arc::new(ScriptedRunner::ok(ExecutionContext::Privileged));
        let unprivileged = Arc::new(ScriptedRunner::ok(ExecutionContext::Unprivileged));
        let (tx, rx) = unbounded_channel();
        let service = DaemonService::new(
            config,
            manager,
            monitor,
            SettingsChain::new(privileged.clone(), unprivileged),
            AudioFocusFallback::new(FakePlatform::new(20, FocusRequestResult::Granted)),
            tx,
        );
        Fixture {
            service,
            privileged,
            rx,
            _monitor_rx: monitor_rx,
        }
    }

    #[tokio::test]
    async fn test_status_tracks_activation() {
        let broker = FakeBroker::alive(true);
        let f = fixture(broker, DaemonConfig::default(), None);
        f.service.monitor().on_broker_available().await;

        let before = f.service.status();
        assert_eq!(before.activation_state(), Some(ActivationState::Idle));
        assert_eq!(before.last_strategy(), Some(Strategy::None));
        assert!(before.all_permissions_granted());

        f.service.activate().await.unwrap();
        let after = f.service.status();
        assert_eq!(after.activation_state(), Some(ActivationState::Active));
        assert_eq!(after.broker_state(), Some(BrokerConnectionState::PermissionGranted));
        assert_eq!(after.last_strategy(), Some(Strategy::Privileged));
        assert!(after.last_success);
    }

    #[tokio::test]
    async fn test_overlay_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path().to_path_buf()).unwrap();
        let mut f = fixture(
            FakeBroker::dead(),
            DaemonConfig::default(),
            Some(ConfigManager::with_dir(dir.path().to_path_buf()).unwrap()),
        );

        f.service.set_overlay_granted(false);
        assert!(!f.service.status().overlay_granted);
        assert!(!manager.load_config().unwrap().activation.overlay_granted);
        assert_eq!(f.rx.try_recv().unwrap(), SignalEvent::StateChanged);

        // Unchanged value: no event, no write.
        f.service.set_overlay_granted(false);
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_activation_refusal_maps_to_control_error() {
        let mut config = DaemonConfig::default();
        config.activation.overlay_granted = false;
        let f = fixture(FakeBroker::alive(true), config, None);

        let err = f.service.activate().await.unwrap_err();
        assert!(matches!(err, ControlError::PreconditionUnmet(_)));
    }

    #[tokio::test]
    async fn test_grant_without_broker_maps_to_not_running() {
        let f = fixture(FakeBroker::dead(), DaemonConfig::default(), None);
        let err = f.service.request_grant().await.unwrap_err();
        assert!(matches!(err, ControlError::BrokerNotRunning));
    }

    #[tokio::test]
    async fn test_shutdown_reverts_settings() {
        let f = fixture(FakeBroker::dead(), DaemonConfig::default(), None);
        f.service.shutdown().await;
        assert_eq!(f.privileged.calls().len(), MULTI_AUDIO_SETTINGS.len());
        assert_eq!(
            f.service.status().activation_state(),
            Some(ActivationState::Idle)
        );
    }

    #[tokio::test]
    async fn test_shutdown_queues_teardown_messages() {
        let mut f = fixture(FakeBroker::dead(), DaemonConfig::default(), None);
        let monitor_token = f.service.monitor().cancel_token();
        f.service.shutdown().await;
        assert!(monitor_token.is_cancelled());

        let mut messages = Vec::new();
        while let Ok(event) = f.rx.try_recv() {
            if let SignalEvent::StatusMessage(m) = event {
                messages.push(m);
            }
        }
        assert_eq!(messages, vec!["Service stopped", "Multi-audio disabled"]);
    }

    #[test]
    fn test_grant_error_mapping() {
        assert!(matches!(
            ControlError::from(GrantError::RationaleRequired),
            ControlError::PreconditionUnmet(_)
        ));
        assert!(matches!(
            ControlError::from(GrantError::ShutDown),
            ControlError::Internal(_)
        ));
    }
}
