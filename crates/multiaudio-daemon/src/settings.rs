// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! System settings fallback chain.
//!
//! The activation list is applied all-or-nothing per tier: privileged first,
//! then the whole list again unprivileged. A half-applied configuration is
//! never reported as success.

use crate::command::CommandRunner;
use multiaudio_ipc::Strategy;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Settings namespace a command writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    System,
    Global,
}

/// One settings command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: &'static str,
    pub scope: Scope,
}

impl CommandSpec {
    pub const fn new(scope: Scope, command: &'static str) -> Self {
        Self { command, scope }
    }
}

/// The command that undoes one activation [`CommandSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevertSpec(pub CommandSpec);

impl RevertSpec {
    pub fn command(&self) -> &'static str {
        self.0.command
    }
}

/// An activation command and its inverse.
#[derive(Debug, Clone, Copy)]
pub struct SettingToggle {
    pub apply: CommandSpec,
    pub revert: CommandSpec,
}

/// Settings changed while multi-audio is active, in application order.
pub const MULTI_AUDIO_SETTINGS: [SettingToggle; 2] = [
    SettingToggle {
        apply: CommandSpec::new(Scope::System, "settings put system sound_effects_enabled 0"),
        revert: CommandSpec::new(Scope::System, "settings put system sound_effects_enabled 1"),
    },
    SettingToggle {
        apply: CommandSpec::new(Scope::Global, "settings put global audio_focus_control duck"),
        revert: CommandSpec::new(Scope::Global, "settings put global audio_focus_control default"),
    },
];

/// Activation commands of `toggles`, in order.
pub fn activation_specs(toggles: &[SettingToggle]) -> Vec<CommandSpec> {
    toggles.iter().map(|t| t.apply).collect()
}

/// Revert commands of `toggles`, in the same relative order as activation.
pub fn revert_specs(toggles: &[SettingToggle]) -> Vec<RevertSpec> {
    toggles.iter().map(|t| RevertSpec(t.revert)).collect()
}

/// What one activation attempt ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackOutcome {
    pub strategy_used: Strategy,
    pub success: bool,
}

impl FallbackOutcome {
    pub fn succeeded(strategy: Strategy) -> Self {
        Self {
            strategy_used: strategy,
            success: true,
        }
    }

    pub fn failed() -> Self {
        Self {
            strategy_used: Strategy::None,
            success: false,
        }
    }
}

/// Applies settings through the privileged runner, falling back to the
/// unprivileged one.
pub struct SettingsChain {
    privileged: Arc<dyn CommandRunner>,
    unprivileged: Arc<dyn CommandRunner>,
}

impl SettingsChain {
    pub fn new(privileged: Arc<dyn CommandRunner>, unprivileged: Arc<dyn CommandRunner>) -> Self {
        Self {
            privileged,
            unprivileged,
        }
    }

    /// Apply `specs`.
    ///
    /// `privileged_ready` must reflect the broker monitor: without a granted
    /// broker the privileged tier counts as failed and is not attempted.
    pub fn apply(&self, specs: &[CommandSpec], privileged_ready: bool) -> FallbackOutcome {
        if privileged_ready {
            if self.run_pass(self.privileged.as_ref(), specs) {
                info!("Applied {} settings through the broker", specs.len());
                return FallbackOutcome::succeeded(Strategy::Privileged);
            }
            warn!("Privileged pass failed, retrying the full list unprivileged");
        } else {
            debug!("Broker not ready, skipping privileged pass");
        }

        if self.run_pass(self.unprivileged.as_ref(), specs) {
            info!("Applied {} settings unprivileged", specs.len());
            return FallbackOutcome::succeeded(Strategy::Unprivileged);
        }

        warn!("Both settings passes failed");
        FallbackOutcome::failed()
    }

    /// Stops at the first failing command.
    fn run_pass(&self, runner: &dyn CommandRunner, specs: &[CommandSpec]) -> bool {
        let context = runner.context();
        for spec in specs {
            match runner.run(spec.command) {
                Ok(result) if result.succeeded => {
                    debug!("{}: {:?} `{}` ok", context, spec.scope, spec.command);
                }
                Ok(result) => {
                    warn!(
                        "{}: `{}` exited with {}, abandoning pass",
                        context, result.command_text, result.exit_status
                    );
                    return false;
                }
                Err(e) => {
                    warn!("{}: {}, abandoning pass", context, e);
                    return false;
                }
            }
        }
        true
    }

    /// Best-effort revert through the privileged runner.
    ///
    /// Each command runs exactly once; failures are logged and otherwise
    /// ignored. Returns how many commands succeeded.
    pub fn revert(&self, specs: &[RevertSpec]) -> usize {
        let mut reverted = 0;
        for spec in specs {
            match self.privileged.run(spec.command()) {
                Ok(result) if result.succeeded => reverted += 1,
                Ok(result) => {
                    error!(
                        "Revert `{}` exited with {}",
                        result.command_text, result.exit_status
                    );
                }
                Err(e) => error!("Revert failed: {}", e),
            }
        }
        info!("Reverted {}/{} settings", reverted, specs.len());
        reverted
    }
}
