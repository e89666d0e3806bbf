// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Configuration management for the daemon.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const CONFIG_FILE: &str = "daemon.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("No config directory found")]
    NoConfigDir,
}

/// Which message bus the broker lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    #[default]
    System,
}

/// How to reach the privileged broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub bus: BusKind,
    #[serde(default = "default_broker_name")]
    pub bus_name: String,
    #[serde(default = "default_broker_path")]
    pub object_path: String,
    /// Liveness ping interval while waiting for the broker.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long an unanswered permission request stays pending.
    #[serde(default = "default_grant_timeout_secs")]
    pub grant_timeout_secs: u64,
}

impl BrokerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn grant_timeout(&self) -> Duration {
        Duration::from_secs(self.grant_timeout_secs)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bus: BusKind::default(),
            bus_name: default_broker_name(),
            object_path: default_broker_path(),
            poll_interval_ms: default_poll_interval_ms(),
            grant_timeout_secs: default_grant_timeout_secs(),
        }
    }
}

fn default_broker_name() -> String {
    "org.multiaudio.Broker".to_string()
}

fn default_broker_path() -> String {
    "/org/multiaudio/Broker".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_grant_timeout_secs() -> u64 {
    30
}

/// Activation preconditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationConfig {
    /// Refuse to activate (instead of falling back to audio focus) while the
    /// broker permission is missing.
    #[serde(default)]
    pub require_broker_ready: bool,
    /// Initial value of the overlay-equivalent permission.
    #[serde(default = "default_true")]
    pub overlay_granted: bool,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            require_broker_ready: false,
            overlay_granted: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Parameters for the audio-focus ducking fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioFocusConfig {
    /// Stream roles whose playback ducks ours.
    #[serde(default = "default_trigger_roles")]
    pub trigger_roles: String,
    /// Volume applied while ducked.
    #[serde(default = "default_duck_volume")]
    pub duck_volume: String,
}

impl Default for AudioFocusConfig {
    fn default() -> Self {
        Self {
            trigger_roles: default_trigger_roles(),
            duck_volume: default_duck_volume(),
        }
    }
}

fn default_trigger_roles() -> String {
    "phone,event,notification".to_string()
}

fn default_duck_volume() -> String {
    "-20dB".to_string()
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub activation: ActivationConfig,
    #[serde(default)]
    pub audio_focus: AudioFocusConfig,
}

impl DaemonConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Configuration manager handles loading and saving the config file.
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Create a config manager rooted at the XDG config directory.
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = directories::ProjectDirs::from("com", "multiaudio", "multiaudio")
            .map(|d| d.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)?;
        Self::with_dir(config_dir)
    }

    /// Create a config manager rooted at an explicit directory.
    pub fn with_dir(config_dir: PathBuf) -> Result<Self, ConfigError> {
        fs::create_dir_all(&config_dir)?;
        debug!("Config directory: {:?}", config_dir);
        Ok(Self { config_dir })
    }

    fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn config_exists(&self) -> bool {
        self.config_path().exists()
    }

    /// Load the daemon configuration, falling back to defaults when absent.
    pub fn load_config(&self) -> Result<DaemonConfig, ConfigError> {
        let path = self.config_path();
        if !path.exists() {
            debug!("No daemon config found, using defaults");
            return Ok(DaemonConfig::default());
        }

        let content = fs::read_to_string(&path)?;
        let config = DaemonConfig::from_toml(&content)?;
        info!("Loaded daemon config from {:?}", path);
        Ok(config)
    }

    /// Save the daemon configuration.
    pub fn save_config(&self, config: &DaemonConfig) -> Result<(), ConfigError> {
        let path = self.config_path();
        let content = config.to_toml()?;
        fs::write(&path, content)?;
        debug!("Saved daemon config to {:?}", path);
        Ok(())
    }
}
