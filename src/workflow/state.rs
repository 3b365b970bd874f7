//! Workflow state machine
//!
//! ```text
//! Idle -> BaselineCollecting -> Monitoring -> AfterCollecting -> Comparing -> Exporting -> Done
//! Idle -> BaselineCollecting -> Done                  (single collect)
//! Idle -> Monitoring -> Done                          (single monitor)
//! Idle -> Comparing [-> Exporting] -> Done            (compare / export-monitor)
//! any active state -> Failed
//! ```

use serde::Serialize;
use std::fmt;

use crate::error::ScanError;
use crate::observer::PhaseObserver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Idle,
    BaselineCollecting,
    Monitoring,
    AfterCollecting,
    Comparing,
    Exporting,
    Done,
    Failed,
}

impl WorkflowState {
    pub fn is_active(self) -> bool {
        !matches!(self, WorkflowState::Idle | WorkflowState::Done | WorkflowState::Failed)
    }

    pub fn can_transition_to(self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        match (self, next) {
            (Idle, BaselineCollecting | Monitoring | Comparing) => true,
            (BaselineCollecting, Monitoring | Done) => true,
            (Monitoring, AfterCollecting | Done) => true,
            (AfterCollecting, Comparing) => true,
            (Comparing, Exporting | Done) => true,
            (Exporting, Done) => true,
            (Done | Failed, Idle) => true,
            (from, Failed) => from.is_active(),
            _ => false,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowState::Idle => "idle",
            WorkflowState::BaselineCollecting => "baseline-collecting",
            WorkflowState::Monitoring => "monitoring",
            WorkflowState::AfterCollecting => "after-collecting",
            WorkflowState::Comparing => "comparing",
            WorkflowState::Exporting => "exporting",
            WorkflowState::Done => "done",
            WorkflowState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct StateMachine {
    state: WorkflowState,
    history: Vec<WorkflowState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: WorkflowState::Idle,
            history: vec![WorkflowState::Idle],
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Every state entered since creation, in order
    pub fn history(&self) -> &[WorkflowState] {
        &self.history
    }

    pub fn transition(&mut self, next: WorkflowState, observer: &dyn PhaseObserver) -> Result<(), ScanError> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(ScanError::IllegalTransition { from, to: next });
        }
        self.state = next;
        self.history.push(next);
        observer.on_state_change(from, next);
        Ok(())
    }

    /// Move to Failed if a workflow is in progress
    pub fn fail(&mut self, observer: &dyn PhaseObserver) {
        if self.state.is_active() {
            let from = self.state;
            self.state = WorkflowState::Failed;
            self.history.push(WorkflowState::Failed);
            observer.on_state_change(from, WorkflowState::Failed);
        }
    }

    /// Return to Idle after a finished workflow so the next command can start
    pub fn reset(&mut self, observer: &dyn PhaseObserver) -> Result<(), ScanError> {
        match self.state {
            WorkflowState::Idle => Ok(()),
            _ => self.transition(WorkflowState::Idle, observer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NullObserver;
    use WorkflowState::*;

    #[test]
    fn test_guided_path_is_legal() {
        let mut machine = StateMachine::new();
        for next in [BaselineCollecting, Monitoring, AfterCollecting, Comparing, Exporting, Done] {
            machine.transition(next, &NullObserver).unwrap();
        }
        assert_eq!(machine.state(), Done);
        assert_eq!(machine.history().len(), 7);
    }

    #[test]
    fn test_side_path_and_reset() {
        let mut machine = StateMachine::new();
        machine.transition(Comparing, &NullObserver).unwrap();
        machine.transition(Done, &NullObserver).unwrap();
        machine.reset(&NullObserver).unwrap();
        assert_eq!(machine.state(), Idle);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut machine = StateMachine::new();
        let err = machine.transition(AfterCollecting, &NullObserver).unwrap_err();
        assert!(matches!(err, ScanError::IllegalTransition { from: Idle, to: AfterCollecting }));
        assert_eq!(machine.state(), Idle);

        assert!(!Idle.can_transition_to(Failed));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Exporting.can_transition_to(Comparing));
        assert!(!Monitoring.can_transition_to(BaselineCollecting));
    }

    #[test]
    fn test_fail_from_any_active_state() {
        for state in [BaselineCollecting, Monitoring, AfterCollecting, Comparing, Exporting] {
            assert!(state.can_transition_to(Failed));
        }

        let mut machine = StateMachine::new();
        machine.fail(&NullObserver);
        assert_eq!(machine.state(), Idle);

        machine.transition(BaselineCollecting, &NullObserver).unwrap();
        machine.fail(&NullObserver);
        assert_eq!(machine.state(), Failed);
    }
}
