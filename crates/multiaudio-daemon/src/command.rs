// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Shell command execution.
//!
//! A runner executes one command and reports its exit status. Runners never
//! elevate anything themselves: the privileged runner lives in
//! [`crate::broker`] and hands the command text to the broker instead.

use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, error};

/// Exit status reported when a process ended without one (killed by a signal).
pub const NO_EXIT_STATUS: i32 = -1;

/// The command could not be launched at all.
#[derive(Debug, Clone, Error)]
#[error("failed to spawn `{command}`: {reason}")]
pub struct SpawnFailure {
    pub command: String,
    pub reason: String,
}

impl SpawnFailure {
    pub fn new(command: &str, reason: impl Into<String>) -> Self {
        Self {
            command: command.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result of one command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub succeeded: bool,
    pub exit_status: i32,
    pub command_text: String,
}

impl CommandResult {
    pub fn from_exit_status(command: &str, exit_status: i32) -> Self {
        Self {
            succeeded: exit_status == 0,
            exit_status,
            command_text: command.to_string(),
        }
    }
}

/// Execution context a runner stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    Privileged,
    Unprivileged,
}

impl std::fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Privileged => f.write_str("privileged"),
            Self::Unprivileged => f.write_str("unprivileged"),
        }
    }
}

/// Executes a single shell-level command, blocking until it finishes.
///
/// A non-zero exit is a normal `Ok` result with `succeeded == false`; only a
/// failure to launch is an `Err`.
pub trait CommandRunner: Send + Sync {
    fn context(&self) -> ExecutionContext;

    fn run(&self, command: &str) -> Result<CommandResult, SpawnFailure>;
}

/// Runs commands through `sh -c` with the daemon's own rights.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::with_shell("sh")
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for ShellRunner {
    fn context(&self) -> ExecutionContext {
        ExecutionContext::Unprivileged
    }

    fn run(&self, command: &str) -> Result<CommandResult, SpawnFailure> {
        debug!("{} -c {}", self.shell, command);

        let output = Command::new(&self.shell)
            .args(["-c", command])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                error!("Failed to execute {}: {}", self.shell, e);
                SpawnFailure::new(command, e.to_string())
            })?;

        let exit_status = output.status.code().unwrap_or(NO_EXIT_STATUS);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("`{}` exited with {}: {}", command, exit_status, stderr.trim());
        }

        Ok(CommandResult::from_exit_status(command, exit_status))
    }
}
