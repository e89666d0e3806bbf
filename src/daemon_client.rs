// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! D-Bus client for communicating with the multiaudio daemon.

use futures::stream::StreamExt;
use multiaudio_ipc::{StatusInfo, Strategy};
use tracing::{debug, info};
use zbus::{proxy, Connection, Result as ZbusResult};

/// D-Bus proxy for the daemon interface.
#[proxy(
    interface = "com.multiaudio.Daemon",
    default_service = "com.multiaudio.Daemon",
    default_path = "/com/multiaudio/Daemon"
)]
trait Daemon {
    // Methods
    fn activate(&self) -> ZbusResult<(String, bool)>;
    fn deactivate(&self) -> ZbusResult<()>;
    fn request_grant(&self) -> ZbusResult<()>;
    fn set_overlay_granted(&self, granted: bool) -> ZbusResult<()>;
    fn get_status(&self) -> ZbusResult<StatusInfo>;

    // Signals
    #[zbus(signal)]
    fn status_message(&self, message: &str) -> ZbusResult<()>;
    #[zbus(signal)]
    fn state_changed(&self, status: StatusInfo) -> ZbusResult<()>;
}

/// Events received from the daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonEvent {
    StatusMessage(String),
    StateChanged(StatusInfo),
}

/// Errors that can occur when communicating with the daemon.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DaemonClientError {
    #[error("Failed to connect to D-Bus: {0}")]
    ConnectionFailed(String),
    #[error("Failed to create D-Bus proxy: {0}")]
    ProxyCreationFailed(String),
    #[error("Daemon is not running: {0}")]
    DaemonNotRunning(String),
    #[error("Method call failed: {0}")]
    MethodCallFailed(String),
    #[error("Signal subscription failed: {0}")]
    SignalSubscriptionFailed(String),
}

impl DaemonClientError {
    fn from_call(e: zbus::Error) -> Self {
        match e {
            zbus::Error::MethodError(_, Some(message), _) => Self::MethodCallFailed(message),
            other => Self::MethodCallFailed(other.to_string()),
        }
    }
}

/// Client for communicating with the multiaudio daemon.
pub struct DaemonClient {
    proxy: DaemonProxy<'static>,
}

impl DaemonClient {
    /// Connect to the daemon.
    pub async fn connect() -> Result<Self, DaemonClientError> {
        debug!("Connecting to multiaudio daemon...");

        let connection = Connection::session()
            .await
            .map_err(|e| DaemonClientError::ConnectionFailed(e.to_string()))?;

        let proxy = DaemonProxy::new(&connection)
            .await
            .map_err(|e| DaemonClientError::ProxyCreationFailed(e.to_string()))?;

        // Verify the daemon is running by calling a method
        if let Err(e) = proxy.get_status().await {
            return Err(DaemonClientError::DaemonNotRunning(e.to_string()));
        }
        info!("Connected to multiaudio daemon");

        Ok(Self { proxy })
    }

    /// Turn multi-audio on. Returns the strategy used and whether it worked.
    pub async fn activate(&self) -> Result<(Strategy, bool), DaemonClientError> {
        let (strategy, success) = self
            .proxy
            .activate()
            .await
            .map_err(DaemonClientError::from_call)?;
        Ok((Strategy::parse(&strategy).unwrap_or_default(), success))
    }

    pub async fn deactivate(&self) -> Result<(), DaemonClientError> {
        self.proxy
            .deactivate()
            .await
            .map_err(DaemonClientError::from_call)
    }

    pub async fn request_grant(&self) -> Result<(), DaemonClientError> {
        self.proxy
            .request_grant()
            .await
            .map_err(DaemonClientError::from_call)
    }

    pub async fn set_overlay_granted(&self, granted: bool) -> Result<(), DaemonClientError> {
        debug!("Setting overlay permission to {}", granted);
        self.proxy
            .set_overlay_granted(granted)
            .await
            .map_err(DaemonClientError::from_call)
    }

    pub async fn get_status(&self) -> Result<StatusInfo, DaemonClientError> {
        self.proxy
            .get_status()
            .await
            .map_err(DaemonClientError::from_call)
    }

    /// Forward daemon signals to `on_event` until the daemon goes away.
    pub async fn watch<F>(&self, mut on_event: F) -> Result<(), DaemonClientError>
    where
        F: FnMut(DaemonEvent),
    {
        let mut messages = self
            .proxy
            .receive_status_message()
            .await
            .map_err(|e| DaemonClientError::SignalSubscriptionFailed(e.to_string()))?;
        let mut states = self
            .proxy
            .receive_state_changed()
            .await
            .map_err(|e| DaemonClientError::SignalSubscriptionFailed(e.to_string()))?;
        let mut owner = self
            .proxy
            .inner()
            .receive_owner_changed()
            .await
            .map_err(|e| DaemonClientError::SignalSubscriptionFailed(e.to_string()))?;

        loop {
            tokio::select! {
                Some(signal) = messages.next() => {
                    if let Ok(args) = signal.args() {
                        on_event(DaemonEvent::StatusMessage(args.message.to_string()));
                    }
                }
                Some(signal) = states.next() => {
                    if let Ok(args) = signal.args() {
                        on_event(DaemonEvent::StateChanged(args.status));
                    }
                }
                Some(new_owner) = owner.next() => {
                    if new_owner.is_none() {
                        return Err(DaemonClientError::DaemonNotRunning(
                            "daemon left the bus".to_string(),
                        ));
                    }
                }
                else => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use zbus::message::Message;
    use zbus::names::ErrorName;

    #[test]
    fn test_method_error_keeps_daemon_message() {
        let reply = Message::method("/com/multiaudio/Daemon", "Activate")
            .unwrap()
            .build(&())
            .unwrap();
        let name = ErrorName::try_from("org.freedesktop.DBus.Error.AccessDenied").unwrap();
        let err = DaemonClientError::from_call(zbus::Error::MethodError(
            name.into(),
            Some("overlay permission not granted".to_string()),
            reply,
        ));
        assert_eq!(
            err.to_string(),
            "Method call failed: overlay permission not granted"
        );
    }

    #[test]
    fn test_other_errors_keep_their_text() {
        let err = DaemonClientError::from_call(zbus::Error::Failure("bus closed".into()));
        assert_eq!(err.to_string(), "Method call failed: bus closed");
    }
}
