// src/target/state.rs

//! Target lifecycle state machine.
//!
//! The detailed states below are what the engine stores in history entries;
//! [`SimpleState`] is the four-way projection used by filters and summaries.
//! Transitions are driven exclusively by the engine tick (`engine::tick`);
//! this module only defines the vocabulary and its predicates.

use serde::{Deserialize, Serialize};

use crate::target::TargetId;

/// Detailed state of a target. The latest history entry carries the
/// current one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum State {
    /// Created but not yet asked to run.
    Passive,
    /// Asked to run (by a user or by a parent's success trigger), waiting
    /// for dependencies.
    Active { by_user: bool },
    /// A backend `start` has been scheduled; `attempt` counts submissions
    /// including recoverable retries.
    TriedToStart { attempt: u32 },
    /// The backend reported a fatal submission failure.
    FailedToStart { reason: String },
    /// The backend accepted the job.
    StartedRunning,
    /// Polling says the job is still going.
    StillBuilding,
    /// The job finished; the success condition is being checked.
    StillVerifyingSuccess,
    /// The condition already held on activation; no work was started.
    AlreadyDone,
    /// The job finished and the condition holds.
    RanSuccessfully,
    /// The job itself failed.
    FailedToRun { reason: String },
    /// The job finished but the condition does not hold.
    FailedFromCondition,
    /// Killed before ever becoming active.
    KilledFromPassive,
    /// Killed while active or running.
    Killed,
    /// A dependency failed or was killed; this target will never start.
    DeadBecauseOfDependencies { which: Vec<TargetId> },
    /// Redirected to an equivalent target; adopts its outcome.
    PointedTo { target: TargetId },
}

/// Four-way projection of [`State`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimpleState {
    Activable,
    InProgress,
    Successful,
    Failed,
}

impl State {
    pub fn simple(&self) -> SimpleState {
        match self {
            State::Passive => SimpleState::Activable,
            State::Active { .. }
            | State::TriedToStart { .. }
            | State::StartedRunning
            | State::StillBuilding
            | State::StillVerifyingSuccess
            | State::PointedTo { .. } => SimpleState::InProgress,
            State::AlreadyDone | State::RanSuccessfully => SimpleState::Successful,
            State::FailedToStart { .. }
            | State::FailedToRun { .. }
            | State::FailedFromCondition
            | State::KilledFromPassive
            | State::Killed
            | State::DeadBecauseOfDependencies { .. } => SimpleState::Failed,
        }
    }

    /// Terminal states never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.simple(),
            SimpleState::Successful | SimpleState::Failed
        )
    }

    /// States with an in-flight backend job (run parameters may mutate).
    pub fn is_running_family(&self) -> bool {
        matches!(
            self,
            State::StartedRunning | State::StillBuilding | State::StillVerifyingSuccess
        )
    }

    pub fn is_successful(&self) -> bool {
        self.simple() == SimpleState::Successful
    }

    pub fn is_failed(&self) -> bool {
        self.simple() == SimpleState::Failed
    }

    /// Short stable name used in events, summaries and logs.
    pub fn name(&self) -> &'static str {
        match self {
            State::Passive => "passive",
            State::Active { .. } => "active",
            State::TriedToStart { .. } => "tried-to-start",
            State::FailedToStart { .. } => "failed-to-start",
            State::StartedRunning => "started-running",
            State::StillBuilding => "still-building",
            State::StillVerifyingSuccess => "still-verifying-success",
            State::AlreadyDone => "already-done",
            State::RanSuccessfully => "ran-successfully",
            State::FailedToRun { .. } => "failed-to-run",
            State::FailedFromCondition => "failed-from-condition",
            State::KilledFromPassive => "killed-from-passive",
            State::Killed => "killed",
            State::DeadBecauseOfDependencies { .. } => "dead-because-of-dependencies",
            State::PointedTo { .. } => "pointed-to",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_covers_every_state() {
        assert_eq!(State::Passive.simple(), SimpleState::Activable);
        assert_eq!(
            State::Active { by_user: true }.simple(),
            SimpleState::InProgress
        );
        assert_eq!(State::AlreadyDone.simple(), SimpleState::Successful);
        assert_eq!(
            State::DeadBecauseOfDependencies { which: vec![] }.simple(),
            SimpleState::Failed
        );
    }

    #[test]
    fn terminal_states() {
        assert!(State::RanSuccessfully.is_terminal());
        assert!(State::Killed.is_terminal());
        assert!(State::KilledFromPassive.is_terminal());
        assert!(!State::StillBuilding.is_terminal());
        assert!(!State::PointedTo { target: "x".into() }.is_terminal());
    }

    #[test]
    fn running_family() {
        assert!(State::StartedRunning.is_running_family());
        assert!(State::StillVerifyingSuccess.is_running_family());
        assert!(!State::TriedToStart { attempt: 1 }.is_running_family());
        assert!(!State::Passive.is_running_family());
    }
}
