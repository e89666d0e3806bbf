// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Shared IPC types and D-Bus interface definitions for multiaudio.
//!
//! This crate defines the protocol between the multiaudio daemon and its
//! controllers (the `multiaudio` command-line client, or any other UI that
//! wants to start/stop the feature and display its state).

use serde::{Deserialize, Serialize};
use std::fmt;
use zbus::zvariant::Type;

/// D-Bus service name for the multiaudio daemon.
pub const DBUS_NAME: &str = "com.multiaudio.Daemon";

/// D-Bus object path for the main daemon interface.
pub const DBUS_PATH: &str = "/com/multiaudio/Daemon";

/// D-Bus interface name.
pub const DBUS_INTERFACE: &str = "com.multiaudio.Daemon";

/// Connection state of the privileged broker, as tracked by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BrokerConnectionState {
    #[default]
    Disconnected,
    Connected,
    PermissionGranted,
    PermissionDenied,
}

impl BrokerConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::PermissionGranted => "permission-granted",
            Self::PermissionDenied => "permission-denied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "disconnected" => Some(Self::Disconnected),
            "connected" => Some(Self::Connected),
            "permission-granted" => Some(Self::PermissionGranted),
            "permission-denied" => Some(Self::PermissionDenied),
            _ => None,
        }
    }
}

impl fmt::Display for BrokerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the multi-audio feature inside the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ActivationState {
    #[default]
    Idle,
    Activating,
    Active,
    Deactivating,
}

impl ActivationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Deactivating => "deactivating",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "activating" => Some(Self::Activating),
            "active" => Some(Self::Active),
            "deactivating" => Some(Self::Deactivating),
            _ => None,
        }
    }
}

impl fmt::Display for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which fallback tier ended up carrying an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Strategy {
    Privileged,
    Unprivileged,
    AudioFocusDucking,
    #[default]
    None,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Privileged => "privileged",
            Self::Unprivileged => "unprivileged",
            Self::AudioFocusDucking => "audio-focus-ducking",
            Self::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "privileged" => Some(Self::Privileged),
            "unprivileged" => Some(Self::Unprivileged),
            "audio-focus-ducking" => Some(Self::AudioFocusDucking),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the daemon state for display.
///
/// Enum-valued fields travel as their `as_str()` form so the D-Bus signature
/// stays plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct StatusInfo {
    /// Broker connection state (see [`BrokerConnectionState::as_str`]).
    pub broker_state: String,
    /// Feature lifecycle state (see [`ActivationState::as_str`]).
    pub activation_state: String,
    /// Whether the overlay-equivalent permission is recorded as granted.
    pub overlay_granted: bool,
    /// Whether the broker answered the last liveness ping.
    pub broker_alive: bool,
    /// Strategy used by the last activation (see [`Strategy::as_str`]).
    pub last_strategy: String,
    /// Whether the last activation succeeded.
    pub last_success: bool,
}

impl StatusInfo {
    pub fn new(
        broker_state: BrokerConnectionState,
        activation_state: ActivationState,
        overlay_granted: bool,
        broker_alive: bool,
        last_strategy: Strategy,
        last_success: bool,
    ) -> Self {
        Self {
            broker_state: broker_state.as_str().to_string(),
            activation_state: activation_state.as_str().to_string(),
            overlay_granted,
            broker_alive,
            last_strategy: last_strategy.as_str().to_string(),
            last_success,
        }
    }

    pub fn broker_state(&self) -> Option<BrokerConnectionState> {
        BrokerConnectionState::parse(&self.broker_state)
    }

    pub fn activation_state(&self) -> Option<ActivationState> {
        ActivationState::parse(&self.activation_state)
    }

    pub fn last_strategy(&self) -> Option<Strategy> {
        Strategy::parse(&self.last_strategy)
    }

    /// True when everything the feature needs is in place.
    pub fn all_permissions_granted(&self) -> bool {
        self.overlay_granted
            && self.broker_alive
            && self.broker_state() == Some(BrokerConnectionState::PermissionGranted)
    }
}

/// Error types for daemon control operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlError {
    #[error("Precondition unmet: {0}")]
    PreconditionUnmet(String),
    #[error("Broker service not running")]
    BrokerNotRunning,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ControlError> for zbus::fdo::Error {
    fn from(e: ControlError) -> Self {
        match e {
            ControlError::PreconditionUnmet(_) => zbus::fdo::Error::AccessDenied(e.to_string()),
            ControlError::BrokerNotRunning => zbus::fdo::Error::ServiceUnknown(e.to_string()),
            ControlError::Internal(_) => zbus::fdo::Error::Failed(e.to_string()),
        }
    }
}
