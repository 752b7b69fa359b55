//! Iteration state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// States of one convergence iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IterationState {
    StripHoldout,
    AwaitAgent,
    Gate0Review,
    Merge,
    RestoreHoldout,
    Gate1,
    Gate2,
    Gate3,
    Judge,
    Converged,
    Loop,
    Escalate,
}

impl IterationState {
    pub const INITIAL: IterationState = IterationState::StripHoldout;

    pub fn is_terminal(self) -> bool {
        matches!(self, IterationState::Converged | IterationState::Escalate)
    }

    /// True while the holdout is absent from the working tree.
    pub fn holdout_stripped(self) -> bool {
        matches!(
            self,
            IterationState::AwaitAgent | IterationState::Gate0Review | IterationState::Merge
        )
    }

    /// Allowed successors.
    ///
    /// Gate-0 and Gate-1 failures skip ahead to `Judge`; `Loop` re-enters the
    /// next iteration at `StripHoldout`.
    pub fn successors(self) -> &'static [IterationState] {
        use IterationState as S;
        match self {
            S::StripHoldout => &[S::AwaitAgent],
            S::AwaitAgent => &[S::Gate0Review],
            S::Gate0Review => &[S::Merge],
            S::Merge => &[S::RestoreHoldout],
            S::RestoreHoldout => &[S::Gate1, S::Judge],
            S::Gate1 => &[S::Gate2, S::Judge],
            S::Gate2 => &[S::Gate3],
            S::Gate3 => &[S::Judge],
            S::Judge => &[S::Converged, S::Loop, S::Escalate],
            S::Loop => &[S::StripHoldout],
            S::Converged | S::Escalate => &[],
        }
    }

    pub fn can_transition_to(self, next: IterationState) -> bool {
        self.successors().contains(&next)
    }
}

impl fmt::Display for IterationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IterationState::StripHoldout => "STRIP_HOLDOUT",
            IterationState::AwaitAgent => "AWAIT_AGENT",
            IterationState::Gate0Review => "GATE0_REVIEW",
            IterationState::Merge => "MERGE",
            IterationState::RestoreHoldout => "RESTORE_HOLDOUT",
            IterationState::Gate1 => "GATE1",
            IterationState::Gate2 => "GATE2",
            IterationState::Gate3 => "GATE3",
            IterationState::Judge => "JUDGE",
            IterationState::Converged => "CONVERGED",
            IterationState::Loop => "LOOP",
            IterationState::Escalate => "ESCALATE",
        };
        f.write_str(name)
    }
}

/// Illegal transition attempted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: IterationState,
    pub to: IterationState,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal iteration transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

/// Tracks the current state and the path taken through one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMachine {
    current: IterationState,
    path: Vec<IterationState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::starting_at(IterationState::INITIAL)
    }
}

impl StateMachine {
    pub fn starting_at(state: IterationState) -> Self {
        Self {
            current: state,
            path: vec![state],
        }
    }

    pub fn current(&self) -> IterationState {
        self.current
    }

    pub fn path(&self) -> &[IterationState] {
        &self.path
    }

    pub fn advance(&mut self, next: IterationState) -> Result<IterationState, TransitionError> {
        if !self.current.can_transition_to(next) {
            return Err(TransitionError {
                from: self.current,
                to: next,
            });
        }
        self.current = next;
        self.path.push(next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        let mut sm = StateMachine::default();
        for next in [
            IterationState::AwaitAgent,
            IterationState::Gate0Review,
            IterationState::Merge,
            IterationState::RestoreHoldout,
            IterationState::Gate1,
            IterationState::Gate2,
            IterationState::Gate3,
            IterationState::Judge,
            IterationState::Converged,
        ] {
            sm.advance(next).expect("legal transition");
        }
        assert!(sm.current().is_terminal());
        assert_eq!(sm.path().len(), 10);
    }

    #[test]
    fn gate0_failure_still_merges_and_restores() {
        let mut sm = StateMachine::starting_at(IterationState::Gate0Review);
        assert!(sm.advance(IterationState::Gate1).is_err());
        sm.advance(IterationState::Merge).expect("merge");
        sm.advance(IterationState::RestoreHoldout).expect("restore");
        sm.advance(IterationState::Judge).expect("judge");
        sm.advance(IterationState::Loop).expect("loop");
        sm.advance(IterationState::StripHoldout).expect("next iteration");
    }

    #[test]
    fn terminal_states_have_no_successors() {
        assert!(IterationState::Converged.successors().is_empty());
        assert!(IterationState::Escalate.successors().is_empty());
        assert!(!IterationState::Loop.is_terminal());
    }

    #[test]
    fn gate2_cannot_skip_to_judge() {
        let err = StateMachine::starting_at(IterationState::Gate2)
            .advance(IterationState::Judge)
            .expect_err("gate2 always flows into gate3");
        assert_eq!(err.to_string(), "illegal iteration transition GATE2 -> JUDGE");
    }

    #[test]
    fn serializes_screaming_case() {
        let json = serde_json::to_string(&IterationState::RestoreHoldout).expect("json");
        assert_eq!(json, "\"RESTORE_HOLDOUT\"");
    }
}
