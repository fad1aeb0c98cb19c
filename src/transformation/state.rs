use std::fmt;

use tokio::sync::watch;

use crate::error::TransitionError;

/// Lifecycle of one transformation stage instance
///
/// `Idle -> Running -> Draining -> Stopped`; an instance never runs twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl PipelineState {
    pub fn name(self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Stopped => "stopped",
        }
    }

    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, Running) | (Running, Draining) | (Draining, Stopped)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Current state, observable from outside the stage task
pub struct StateMachine {
    tx: watch::Sender<PipelineState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            tx: watch::Sender::new(PipelineState::Idle),
        }
    }
}

impl StateMachine {
    pub fn current(&self) -> PipelineState {
        *self.tx.borrow()
    }

    pub fn transition(&self, next: PipelineState) -> Result<(), TransitionError> {
        let current = self.current();
        if !current.can_transition_to(next) {
            return Err(TransitionError {
                from: current.name(),
                to: next.name(),
            });
        }
        self.tx.send_replace(next);
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.tx.subscribe()
    }
}
