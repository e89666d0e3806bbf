// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! D-Bus channel to the privileged broker.

use crate::command::{CommandResult, CommandRunner, ExecutionContext, SpawnFailure};
use crate::config::{BrokerConfig, BusKind};
use crate::monitor::BrokerMonitor;
use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zbus::names::BusName;
use zbus::{proxy, Connection};

/// D-Bus proxy for the broker interface.
#[proxy(
    interface = "org.multiaudio.Broker",
    default_service = "org.multiaudio.Broker",
    default_path = "/org/multiaudio/Broker"
)]
trait Broker {
    fn check_self_permission(&self) -> zbus::Result<bool>;
    fn should_show_request_permission_rationale(&self) -> zbus::Result<bool>;
    fn request_permission(&self, token: u32) -> zbus::Result<()>;
    fn execute(&self, command: &str) -> zbus::Result<i32>;

    #[zbus(signal)]
    fn request_permission_result(&self, token: u32, granted: bool) -> zbus::Result<()>;
}

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("Broker disconnected")]
    Disconnected,
    #[error("Failed to connect to D-Bus: {0}")]
    ConnectionFailed(String),
    #[error("Broker call failed: {0}")]
    CallFailed(String),
    #[error("Signal subscription failed: {0}")]
    SignalSubscriptionFailed(String),
}

impl BrokerError {
    fn from_call(e: zbus::Error) -> Self {
        const GONE: [&str; 2] = [
            "org.freedesktop.DBus.Error.ServiceUnknown",
            "org.freedesktop.DBus.Error.NameHasNoOwner",
        ];
        match &e {
            zbus::Error::MethodError(name, _, _) if GONE.contains(&name.as_str()) => {
                Self::Disconnected
            }
            zbus::Error::FDO(fdo)
                if matches!(
                    **fdo,
                    zbus::fdo::Error::ServiceUnknown(_) | zbus::fdo::Error::NameHasNoOwner(_)
                ) =>
            {
                Self::Disconnected
            }
            _ => Self::CallFailed(e.to_string()),
        }
    }
}

/// The capabilities the monitor needs from the broker.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Cheap liveness check.
    async fn ping(&self) -> bool;
    async fn check_self_permission(&self) -> Result<bool, BrokerError>;
    async fn should_show_rationale(&self) -> Result<bool, BrokerError>;
    /// Fire a grant request; the answer comes back through
    /// [`BrokerMonitor::resolve`].
    async fn request_permission(&self, token: u32) -> Result<(), BrokerError>;
}

/// Broker reached over the session or system bus.
pub struct DbusBroker {
    connection: Connection,
    dbus: zbus::fdo::DBusProxy<'static>,
    proxy: BrokerProxy<'static>,
    bus_name: String,
    object_path: String,
}

impl DbusBroker {
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        info!("Connecting to broker {} on the {:?} bus", config.bus_name, config.bus);

        let connection = match config.bus {
            BusKind::Session => Connection::session().await,
            BusKind::System => Connection::system().await,
        }
        .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        let dbus = zbus::fdo::DBusProxy::new(&connection)
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        let proxy = BrokerProxy::builder(&connection)
            .destination(config.bus_name.clone())
            .and_then(|b| b.path(config.object_path.clone()))
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?
            .build()
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            connection,
            dbus,
            proxy,
            bus_name: config.bus_name.clone(),
            object_path: config.object_path.clone(),
        })
    }

    /// Runner that executes commands inside the broker.
    pub fn runner(&self) -> Result<BrokerRunner, BrokerError> {
        let connection = zbus::blocking::Connection::from(self.connection.clone());
        let proxy = BrokerProxyBlocking::builder(&connection)
            .destination(self.bus_name.clone())
            .and_then(|b| b.path(self.object_path.clone()))
            .and_then(|b| b.build())
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        Ok(BrokerRunner { proxy })
    }

    /// Forward broker appearance, disappearance and grant results to the
    /// monitor until `cancel` fires or the bus goes away.
    pub async fn watch(
        &self,
        monitor: BrokerMonitor,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        let mut owner_changed = self
            .dbus
            .receive_name_owner_changed()
            .await
            .map_err(|e| BrokerError::SignalSubscriptionFailed(e.to_string()))?;
        let mut grant_results = self
            .proxy
            .receive_request_permission_result()
            .await
            .map_err(|e| BrokerError::SignalSubscriptionFailed(e.to_string()))?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(signal) = owner_changed.next() => {
                    let Ok(args) = signal.args() else { continue };
                    if args.name.as_str() != self.bus_name {
                        continue;
                    }
                    if args.new_owner.is_some() {
                        debug!("Broker name acquired");
                        monitor.on_broker_available().await;
                    } else {
                        debug!("Broker name released");
                        monitor.on_broker_lost();
                    }
                }
                Some(signal) = grant_results.next() => {
                    if let Ok(args) = signal.args() {
                        monitor.resolve(args.token, args.granted);
                    }
                }
                else => {
                    warn!("Broker signal streams ended");
                    break;
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for DbusBroker {
    async fn ping(&self) -> bool {
        let Ok(name) = BusName::try_from(self.bus_name.as_str()) else {
            warn!("Invalid broker bus name: {}", self.bus_name);
            return false;
        };
        match self.dbus.name_has_owner(name).await {
            Ok(owned) => owned,
            Err(e) => {
                debug!("Broker ping failed: {}", e);
                false
            }
        }
    }

    async fn check_self_permission(&self) -> Result<bool, BrokerError> {
        self.proxy
            .check_self_permission()
            .await
            .map_err(BrokerError::from_call)
    }

    async fn should_show_rationale(&self) -> Result<bool, BrokerError> {
        self.proxy
            .should_show_request_permission_rationale()
            .await
            .map_err(BrokerError::from_call)
    }

    async fn request_permission(&self, token: u32) -> Result<(), BrokerError> {
        self.proxy
            .request_permission(token)
            .await
            .map_err(BrokerError::from_call)
    }
}

/// Privileged execution context: the broker runs `sh -c` on our behalf.
pub struct BrokerRunner {
    proxy: BrokerProxyBlocking<'static>,
}

impl CommandRunner for BrokerRunner {
    fn context(&self) -> ExecutionContext {
        ExecutionContext::Privileged
    }

    fn run(&self, command: &str) -> Result<CommandResult, SpawnFailure> {
        debug!("broker exec: {}", command);
        let exit_status = self
            .proxy
            .execute(command)
            .map_err(|e| SpawnFailure::new(command, BrokerError::from_call(e).to_string()))?;
        Ok(CommandResult::from_exit_status(command, exit_status))
    }
}

/// Stand-in used when the broker bus cannot be reached at all.
///
/// Never answers a ping and refuses every command, so the monitor stays
/// `Disconnected` and activation falls back to audio focus.
pub struct UnreachableBroker {
    reason: String,
}

impl UnreachableBroker {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl BrokerChannel for UnreachableBroker {
    async fn ping(&self) -> bool {
        false
    }

    async fn check_self_permission(&self) -> Result<bool, BrokerError> {
        Err(BrokerError::Disconnected)
    }

    async fn should_show_rationale(&self) -> Result<bool, BrokerError> {
        Err(BrokerError::Disconnected)
    }

    async fn request_permission(&self, _token: u32) -> Result<(), BrokerError> {
        Err(BrokerError::Disconnected)
    }
}

impl CommandRunner for UnreachableBroker {
    fn context(&self) -> ExecutionContext {
        ExecutionContext::Privileged
    }

    fn run(&self, command: &str) -> Result<CommandResult, SpawnFailure> {
        Err(SpawnFailure::new(command, format!("broker unreachable: {}", self.reason)))
    }
}
