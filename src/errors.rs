//! Typed error hierarchy for devstack.
//!
//! - `SupervisorError` — spawning and exit handling of one child process
//! - `PrecheckError` — port pre-flight failures
//! - `TransitionError` — illegal app lifecycle transitions
//! - `OrchestratorError` — failures of the whole launch plan

use crate::precheck::PortIssue;
use crate::state::AppState;
use thiserror::Error;

/// Render a command and its arguments the way a shell user would type it.
pub fn command_line(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, args.join(" "))
    }
}

/// Errors from supervising a single child process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{}` exited with code {code}", command_line(.command, .args))]
    NonZeroExit {
        command: String,
        args: Vec<String>,
        code: i32,
    },

    #[error("`{}` was terminated by a signal", command_line(.command, .args))]
    Signalled { command: String, args: Vec<String> },

    #[error("Failed to wait for `{command}`: {source}")]
    WaitFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Supervisor task for `{command}` stopped unexpectedly")]
    SupervisorLost { command: String },
}

impl SupervisorError {
    /// Exit code carried by the error, if the process exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::NonZeroExit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Errors from the port pre-flight check.
#[derive(Debug, Error)]
pub enum PrecheckError {
    #[error("Invalid port configuration:\n{}", format_issues(.0))]
    InvalidPorts(Vec<PortIssue>),

    #[error("Ports already in use:\n{}", format_issues(.0))]
    PortsInUse(Vec<PortIssue>),
}

impl PrecheckError {
    pub fn issues(&self) -> &[PortIssue] {
        match self {
            Self::InvalidPorts(issues) | Self::PortsInUse(issues) => issues,
        }
    }
}

fn format_issues(issues: &[PortIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("  - {}", issue))
        .collect::<Vec<_>>()
        .join("\n")
}

/// An app lifecycle transition that the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Illegal app state transition {from} -> {to}")]
pub struct TransitionError {
    pub from: AppState,
    pub to: AppState,
}

/// Errors from running the whole launch plan.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Launch plan is empty")]
    EmptyPlan,

    #[error("Process '{process}' failed: {source}")]
    ProcessFailed {
        process: String,
        #[source]
        source: SupervisorError,
    },

    #[error("Failed to write logs for '{process}' to {path}: {source}")]
    LogWriteFailed {
        process: String,
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}
