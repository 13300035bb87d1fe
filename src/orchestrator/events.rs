use crate::readiness::Service;
use crate::state::AppState;
use crate::supervisor::ProcessOutput;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// How one process ended, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Completion value (0, or the lock code)
    Success(i32),
    /// Rendered supervisor error
    Failed(String),
}

impl ExitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Everything the orchestrator reports to the rendering layer, in order.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    Spawned {
        process: String,
        pid: Option<u32>,
        command: String,
    },
    Output(ProcessOutput),
    ServiceReady(Service),
    StateChanged(AppState),
    Exited {
        process: String,
        outcome: ExitOutcome,
        during_teardown: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessReport {
    pub process: String,
    pub outcome: ExitOutcome,
    /// Settled after teardown began, so failures are expected
    pub during_teardown: bool,
}

/// Result of a full orchestrator run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub ready: BTreeSet<Service>,
    pub reached_ready: bool,
    pub exits: Vec<ProcessReport>,
    pub log_files: Vec<PathBuf>,
}
