use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

use crate::error::PipelineError;

/// Lifecycle of a pipeline run.
///
/// ```text
/// Idle -> Running -> Draining -> Stopped
///            \________________/
///            (frame source failure)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl PipelineState {
    fn as_u8(self) -> u8 {
        match self {
            PipelineState::Idle => 0,
            PipelineState::Running => 1,
            PipelineState::Draining => 2,
            PipelineState::Stopped => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => PipelineState::Idle,
            1 => PipelineState::Running,
            2 => PipelineState::Draining,
            _ => PipelineState::Stopped,
        }
    }

    /// Whether `self -> next` is a legal edge.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        matches!(
            (self, next),
            (PipelineState::Idle, PipelineState::Running)
                | (PipelineState::Running, PipelineState::Draining)
                | (PipelineState::Running, PipelineState::Stopped)
                | (PipelineState::Draining, PipelineState::Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == PipelineState::Stopped
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineState::Idle => "idle",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Stopped => "stopped",
        })
    }
}

/// Shared, lock-free holder for the current state. Transitions are compare-and-swap so two
/// threads racing to stop the pipeline cannot both win.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(PipelineState::Idle.as_u8()))
    }

    pub(crate) fn get(&self) -> PipelineState {
        PipelineState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move from exactly `from` to `to`.
    pub(crate) fn transition(
        &self,
        from: PipelineState,
        to: PipelineState,
    ) -> Result<(), PipelineError> {
        if !from.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition { from, to });
        }
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| PipelineError::InvalidTransition {
                from: PipelineState::from_u8(actual),
                to,
            })
    }

    /// Move to `Stopped` from whatever non-terminal state the pipeline is in. Returns the state
    /// it left, or `None` when it was already stopped.
    pub(crate) fn force_stop(&self) -> Option<PipelineState> {
        loop {
            let current = self.get();
            if current.is_terminal() {
                return None;
            }
            if self
                .0
                .compare_exchange(
                    current.as_u8(),
                    PipelineState::Stopped.as_u8(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return Some(current);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_edges_only() {
        use PipelineState::*;
        assert!(Idle.can_transition_to(Running));
        assert!(Running.can_transition_to(Draining));
        assert!(Running.can_transition_to(Stopped));
        assert!(Draining.can_transition_to(Stopped));
        assert!(!Idle.can_transition_to(Draining));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Draining.can_transition_to(Running));
    }

    #[test]
    fn cell_rejects_stale_transition() {
        let cell = StateCell::new();
        cell.transition(PipelineState::Idle, PipelineState::Running)
            .unwrap();
        let err = cell
            .transition(PipelineState::Idle, PipelineState::Running)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition {
                from: PipelineState::Idle,
                ..
            }
        ));
        let err = cell
            .transition(PipelineState::Draining, PipelineState::Stopped)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition {
                from: PipelineState::Running,
                to: PipelineState::Stopped
            }
        ));
    }

    #[test]
    fn force_stop_is_idempotent() {
        let cell = StateCell::new();
        cell.transition(PipelineState::Idle, PipelineState::Running)
            .unwrap();
        assert_eq!(cell.force_stop(), Some(PipelineState::Running));
        assert_eq!(cell.force_stop(), None);
        assert_eq!(cell.get(), PipelineState::Stopped);
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(PipelineState::Draining.to_string(), "draining");
    }
}
