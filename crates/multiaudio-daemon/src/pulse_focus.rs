// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Audio focus on PulseAudio (or pipewire-pulse) using pactl.
//!
//! Focus is expressed through the role policy modules: our role is ducked
//! (`module-role-ducking`) or corked (`module-role-cork`) whenever one of the
//! trigger roles plays. The API level is the libpulse major version.
//!
//! The role modules report nothing back when the trigger roles start or stop,
//! so a listener hears `Gain` once the module loads and `Loss` when it is
//! unloaded, and no transient changes in between.

use crate::config::AudioFocusConfig;
use crate::focus::{
    AudioAttributes, AudioFocusPlatform, AudioUsage, ContentType, FocusChange, FocusGain,
    FocusListener, FocusRequest, FocusRequestResult, StreamType,
};
use parking_lot::Mutex;
use std::process::Command;
use tracing::{debug, error, info};

struct HeldFocus {
    module_index: u32,
    listener: FocusListener,
}

pub struct PulseFocusPlatform {
    api_level: u32,
    trigger_roles: String,
    duck_volume: String,
    held: Mutex<Option<HeldFocus>>,
}

impl PulseFocusPlatform {
    /// Probe `pactl --version` for the API level.
    pub fn detect(config: &AudioFocusConfig) -> Self {
        let api_level = Command::new("pactl")
            .arg("--version")
            .output()
            .ok()
            .and_then(|o| parse_api_level(&String::from_utf8_lossy(&o.stdout)))
            .unwrap_or(0);
        debug!("libpulse API level {}", api_level);
        Self::with_api_level(config, api_level)
    }

    pub fn with_api_level(config: &AudioFocusConfig, api_level: u32) -> Self {
        Self {
            api_level,
            trigger_roles: config.trigger_roles.clone(),
            duck_volume: config.duck_volume.clone(),
            held: Mutex::new(None),
        }
    }

    fn module_args(&self, role: &str, duck: bool) -> Vec<String> {
        if duck {
            vec![
                "module-role-ducking".to_string(),
                format!("trigger_roles={}", self.trigger_roles),
                format!("ducking_roles={}", role),
                format!("volume={}", self.duck_volume),
            ]
        } else {
            vec![
                "module-role-cork".to_string(),
                format!("trigger_roles={}", self.trigger_roles),
                format!("cork_roles={}", role),
            ]
        }
    }

    fn acquire(&self, role: &str, duck: bool, listener: FocusListener) -> FocusRequestResult {
        let mut held = self.held.lock();
        if let Some(existing) = held.as_mut() {
            debug!("Focus already held by module {}", existing.module_index);
            existing.listener = listener;
            return FocusRequestResult::Granted;
        }

        let args = self.module_args(role, duck);
        info!("pactl load-module {}", args.join(" "));
        let output = match Command::new("pactl").arg("load-module").args(&args).output() {
            Ok(output) => output,
            Err(e) => {
                error!("Failed to execute pactl: {}", e);
                return FocusRequestResult::Failed;
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("pactl load-module failed: {}", stderr.trim());
            return FocusRequestResult::Failed;
        }

        let Some(module_index) = parse_module_index(&String::from_utf8_lossy(&output.stdout)) else {
            error!("pactl load-module printed no module index");
            return FocusRequestResult::Failed;
        };

        listener(FocusChange::Gain);
        *held = Some(HeldFocus {
            module_index,
            listener,
        });
        FocusRequestResult::Granted
    }
}

impl AudioFocusPlatform for PulseFocusPlatform {
    fn api_level(&self) -> u32 {
        self.api_level
    }

    fn request_focus(&self, request: &FocusRequest) -> FocusRequestResult {
        let duck = match request.gain {
            FocusGain::GainTransientMayDuck => !request.will_pause_when_ducked,
        };
        self.acquire(role_for_attributes(request.attributes), duck, request.listener.clone())
    }

    fn request_focus_flat(
        &self,
        listener: FocusListener,
        stream: StreamType,
        gain: FocusGain,
    ) -> FocusRequestResult {
        let role = match stream {
            StreamType::Music => "music",
        };
        let duck = match gain {
            FocusGain::GainTransientMayDuck => true,
        };
        self.acquire(role, duck, listener)
    }

    fn abandon_focus(&self) {
        let Some(held) = self.held.lock().take() else {
            return;
        };
        info!("pactl unload-module {}", held.module_index);
        match Command::new("pactl")
            .args(["unload-module", &held.module_index.to_string()])
            .output()
        {
            Ok(output) if output.status.success() => {}
            Ok(output) => error!(
                "pactl unload-module failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => error!("Failed to execute pactl: {}", e),
        }
        (held.listener)(FocusChange::Loss);
    }
}

fn role_for_attributes(attributes: AudioAttributes) -> &'static str {
    match (attributes.usage, attributes.content_type) {
        (AudioUsage::Media, ContentType::Music) => "music",
    }
}

/// Extract the libpulse major version from `pactl --version` output.
fn parse_api_level(output: &str) -> Option<u32> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("Compiled with libpulse "))
        .or_else(|| output.lines().next().and_then(|l| l.strip_prefix("pactl ")))
        .and_then(|version| version.split('.').next())
        .and_then(|major| major.trim().parse().ok())
}

fn parse_module_index(stdout: &str) -> Option<u32> {
    stdout.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_api_level() {
        let output = "pactl 16.1\nCompiled with libpulse 16.1.0\nLinked with libpulse 16.1.0\n";
        assert_eq!(parse_api_level(output), Some(16));
        assert_eq!(parse_api_level("pactl 9.0\n"), Some(9));
        assert_eq!(parse_api_level("garbage"), None);
    }

    #[test]
    fn test_parse_module_index() {
        assert_eq!(parse_module_index("536870913\n"), Some(536870913));
        assert_eq!(parse_module_index("Failure: Module initialization failed"), None);
    }

    #[test]
    fn test_module_args() {
        let platform = PulseFocusPlatform::with_api_level(&AudioFocusConfig::default(), 16);
        assert_eq!(
            platform.module_args("music", true),
            vec![
                "module-role-ducking",
                "trigger_roles=phone,event,notification",
                "ducking_roles=music",
                "volume=-20dB",
            ]
        );
        assert_eq!(platform.module_args("music", false)[0], "module-role-cork");
    }

    #[test]
    fn test_abandon_without_focus_is_noop() {
        let platform = PulseFocusPlatform::with_api_level(&AudioFocusConfig::default(), 16);
        platform.abandon_focus();
        assert_eq!(platform.api_level(), 16);
    }

    #[test]
    fn test_abandon_reports_single_loss() {
        let platform = PulseFocusPlatform::with_api_level(&AudioFocusConfig::default(), 16);
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        *platform.held.lock() = Some(HeldFocus {
            module_index: u32::MAX,
            listener: std::sync::Arc::new(move |change| sink.lock().push(change)),
        });

        // Unloading a module that does not exist still releases the focus.
        platform.abandon_focus();
        platform.abandon_focus();
        assert_eq!(*seen.lock(), vec![FocusChange::Loss]);
        assert!(platform.held.lock().is_none());
    }
}
