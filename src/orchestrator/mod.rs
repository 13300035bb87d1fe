//! Runs the launch plan and drives the app state machine.
//!
//! One [`Orchestrator`] per `up`: it spawns every process, feeds their output
//! through readiness detection, flips to `DOCKER_READY` once every required
//! service has been seen, and on cancellation (or a required process failing)
//! tears everything down with SIGTERM followed by SIGKILL after the grace
//! period.

pub mod events;
pub mod runner;

pub use events::{ExitOutcome, OrchestratorEvent, ProcessReport, RunSummary};
pub use runner::{Orchestrator, OrchestratorHandle, OrchestratorSettings};
