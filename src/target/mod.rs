// src/target/mod.rs

//! The target model: identity, history and the build process.
//!
//! A target is the unit of work. Its identity and structure are immutable
//! after creation; the only mutable part is the append-only `history`
//! (plus the backend-opaque run parameters inside `build_process`, which
//! only backends rewrite, and only while the target is running).

pub mod condition;
pub mod state;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use condition::Condition;
pub use state::{SimpleState, State};

use crate::host::Host;

pub type TargetId = String;

/// Mint a fresh globally-unique target id.
pub fn fresh_id() -> TargetId {
    format!("gf-{}", uuid::Uuid::new_v4())
}

/// One history record; the latest entry is the current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub state: State,
}

/// DAG-level deduplication policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Equivalence {
    #[default]
    None,
    /// On activation, redirect to any in-progress target with an equal
    /// condition and adopt its outcome.
    SameActiveCondition,
}

/// What actually runs when the target starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildProcess {
    /// Nothing to run; the target succeeds once its condition holds (or
    /// immediately, if it has none).
    NoOperation,
    /// Work dispatched to a named backend; `run_parameters` are opaque to
    /// everything but that backend.
    LongRunning {
        backend: String,
        run_parameters: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Edges of the DAG: ids this target waits for.
    #[serde(default)]
    pub depends_on: Vec<TargetId>,
    /// Ids whose failure makes this target fail.
    #[serde(default)]
    pub make_fail_if: Vec<TargetId>,
    /// Ids activated when this target succeeds.
    #[serde(default)]
    pub success_triggers: Vec<TargetId>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub equivalence: Equivalence,
    pub build_process: BuildProcess,
    #[serde(default)]
    pub host: Host,
    /// Out-of-band kill request; the engine honors it on the next tick.
    #[serde(default)]
    pub kill_requested: bool,
    /// Append-only; never rewritten.
    pub history: Vec<HistoryEntry>,
}

static PASSIVE: State = State::Passive;

impl Target {
    /// Create a fresh target in `Passive` state.
    pub fn new(name: impl Into<String>, host: Host, build_process: BuildProcess) -> Self {
        Self {
            id: fresh_id(),
            name: name.into(),
            tags: BTreeSet::new(),
            metadata: serde_json::Value::Null,
            depends_on: Vec::new(),
            make_fail_if: Vec::new(),
            success_triggers: Vec::new(),
            condition: None,
            equivalence: Equivalence::None,
            build_process,
            host,
            kill_requested: false,
            history: vec![HistoryEntry {
                at: Utc::now(),
                state: State::Passive,
            }],
        }
    }

    /// Current state: the latest history entry.
    pub fn state(&self) -> &State {
        match self.history.last() {
            Some(entry) => &entry.state,
            // Constructors always seed a Passive entry; a record without
            // one is treated as freshly created.
            None => &PASSIVE,
        }
    }

    pub fn simple_state(&self) -> SimpleState {
        self.state().simple()
    }

    /// Append a new state to the history.
    pub fn push_state(&mut self, state: State) {
        self.history.push(HistoryEntry {
            at: Utc::now(),
            state,
        });
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.history
            .first()
            .map(|entry| entry.at)
            .unwrap_or_else(Utc::now)
    }

    /// Whether a user (rather than a success trigger) activated this target.
    pub fn activated_by_user(&self) -> bool {
        self.history
            .iter()
            .any(|entry| matches!(entry.state, State::Active { by_user: true }))
    }

    /// A target can be killed until it reaches a terminal state.
    pub fn killable(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Latest `start` attempt counter, if the target has tried to start.
    pub fn start_attempts(&self) -> u32 {
        self.history
            .iter()
            .rev()
            .find_map(|entry| match &entry.state {
                State::TriedToStart { attempt } => Some(*attempt),
                _ => None,
            })
            .unwrap_or(0)
    }

    /// The backend name, for `LongRunning` targets.
    pub fn backend_name(&self) -> Option<&str> {
        match &self.build_process {
            BuildProcess::NoOperation => None,
            BuildProcess::LongRunning { backend, .. } => Some(backend),
        }
    }

    /// Run parameters, for `LongRunning` targets.
    pub fn run_parameters(&self) -> Option<&serde_json::Value> {
        match &self.build_process {
            BuildProcess::NoOperation => None,
            BuildProcess::LongRunning { run_parameters, .. } => Some(run_parameters),
        }
    }

    /// Replace run parameters with what the backend handed back.
    ///
    /// Callers must only do this while the state is in the running family.
    pub fn set_run_parameters(&mut self, rp: serde_json::Value) {
        if let BuildProcess::LongRunning { run_parameters, .. } = &mut self.build_process {
            *run_parameters = rp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_targets_are_passive() {
        let t = Target::new("build-index", Host::Localhost, BuildProcess::NoOperation);
        assert_eq!(*t.state(), State::Passive);
        assert_eq!(t.simple_state(), SimpleState::Activable);
        assert!(t.killable());
        assert!(!t.activated_by_user());
        assert!(t.id.starts_with("gf-"));
    }

    #[test]
    fn history_tracks_latest_state() {
        let mut t = Target::new("t", Host::Localhost, BuildProcess::NoOperation);
        t.push_state(State::Active { by_user: true });
        t.push_state(State::TriedToStart { attempt: 1 });
        t.push_state(State::TriedToStart { attempt: 2 });

        assert_eq!(*t.state(), State::TriedToStart { attempt: 2 });
        assert_eq!(t.start_attempts(), 2);
        assert!(t.activated_by_user());
        assert_eq!(t.history.len(), 4);
    }

    #[test]
    fn serde_roundtrip_preserves_history() {
        let mut t = Target::new("t", Host::Localhost, BuildProcess::NoOperation);
        t.push_state(State::Active { by_user: false });
        t.push_state(State::RanSuccessfully);

        let json = serde_json::to_string(&t).unwrap();
        let back: Target = serde_json::from_str(&json).unwrap();
        assert_eq!(back.history, t.history);
        assert_eq!(*back.state(), State::RanSuccessfully);
        assert!(!back.killable());
    }
}
