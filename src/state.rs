//! App lifecycle state machine.
//!
//! ```text
//! INIT ──all required ready──▶ DOCKER_READY
//!  │                               │
//!  └──────── cancel ──▶ TEARDOWN ◀─┘
//!                          │
//!                  all processes settled
//!                          ▼
//!                     TERMINATED
//! ```

use crate::errors::TransitionError;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle of the whole dev environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppState {
    /// Services are launching
    #[default]
    Init,
    /// Every required service reported ready
    DockerReady,
    /// Shutdown was requested; children are being stopped
    Teardown,
    /// All children have exited
    Terminated,
}

impl AppState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(&self, next: AppState) -> bool {
        matches!(
            (self, next),
            (Self::Init, Self::DockerReady)
                | (Self::Init, Self::Teardown)
                | (Self::DockerReady, Self::Teardown)
                | (Self::Teardown, Self::Terminated)
        )
    }
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppState::Init => write!(f, "INIT"),
            AppState::DockerReady => write!(f, "DOCKER_READY"),
            AppState::Teardown => write!(f, "TEARDOWN"),
            AppState::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Owns the current [`AppState`] and publishes every change to watchers.
#[derive(Debug)]
pub struct AppStateMachine {
    tx: watch::Sender<AppState>,
}

impl Default for AppStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AppStateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AppState::Init);
        Self { tx }
    }

    pub fn current(&self) -> AppState {
        *self.tx.borrow()
    }

    /// Read-only view for the UI.
    pub fn subscribe(&self) -> watch::Receiver<AppState> {
        self.tx.subscribe()
    }

    /// Move to `next`, or leave the state untouched and report why not.
    pub fn transition(&self, next: AppState) -> Result<AppState, TransitionError> {
        let from = self.current();
        if !from.can_transition_to(next) {
            return Err(TransitionError { from, to: next });
        }
        self.tx.send_replace(next);
        tracing::info!(from = %from, to = %next, "app state changed");
        Ok(next)
    }

    /// `INIT -> DOCKER_READY`; a no-op in any other state.
    pub fn mark_ready(&self) -> bool {
        self.current() == AppState::Init && self.transition(AppState::DockerReady).is_ok()
    }

    /// Enter `TEARDOWN` from any non-terminal state. Idempotent while tearing down.
    pub fn begin_teardown(&self) -> Result<(), TransitionError> {
        match self.current() {
            AppState::Teardown => Ok(()),
            _ => self.transition(AppState::Teardown).map(|_| ()),
        }
    }

    pub fn finish(&self) -> Result<(), TransitionError> {
        self.transition(AppState::Terminated).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let sm = AppStateMachine::new();
        assert_eq!(sm.current(), AppState::Init);
        assert!(sm.mark_ready());
        assert_eq!(sm.current(), AppState::DockerReady);
        sm.begin_teardown().unwrap();
        assert_eq!(sm.current(), AppState::Teardown);
        sm.finish().unwrap();
        assert_eq!(sm.current(), AppState::Terminated);
    }

    #[test]
    fn test_teardown_reachable_from_init() {
        let sm = AppStateMachine::new();
        sm.begin_teardown().unwrap();
        assert_eq!(sm.current(), AppState::Teardown);
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let sm = AppStateMachine::new();
        sm.begin_teardown().unwrap();
        sm.begin_teardown().unwrap();
        assert_eq!(sm.current(), AppState::Teardown);
    }

    #[test]
    fn test_terminated_rejects_everything() {
        let sm = AppStateMachine::new();
        sm.begin_teardown().unwrap();
        sm.finish().unwrap();
        for next in [
            AppState::Init,
            AppState::DockerReady,
            AppState::Teardown,
            AppState::Terminated,
        ] {
            let err = sm.transition(next).unwrap_err();
            assert_eq!(err.from, AppState::Terminated);
        }
        assert!(sm.begin_teardown().is_err());
        assert_eq!(sm.current(), AppState::Terminated);
    }

    #[test]
    fn test_cannot_skip_teardown() {
        let sm = AppStateMachine::new();
        assert!(sm.finish().is_err());
        assert_eq!(sm.current(), AppState::Init);
    }

    #[test]
    fn test_mark_ready_only_from_init() {
        let sm = AppStateMachine::new();
        sm.begin_teardown().unwrap();
        assert!(!sm.mark_ready());
        assert_eq!(sm.current(), AppState::Teardown);
    }

    #[test]
    fn test_subscribers_see_changes() {
        let sm = AppStateMachine::new();
        let rx = sm.subscribe();
        sm.mark_ready();
        assert_eq!(*rx.borrow(), AppState::DockerReady);
    }

    #[test]
    fn test_display_matches_serde() {
        let json = serde_json::to_string(&AppState::DockerReady).unwrap();
        assert_eq!(json, "\"DOCKER_READY\"");
        assert_eq!(AppState::DockerReady.to_string(), "DOCKER_READY");
    }
}
