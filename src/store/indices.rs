// src/store/indices.rs

//! Advisory indices over the target store.
//!
//! Owned exclusively by the engine thread. They speed up discovery but are
//! never authoritative: a full scan can always rebuild them, and correctness
//! never depends on them alone.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::target::{SimpleState, Target, TargetId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Indices {
    pub active_ids: BTreeSet<TargetId>,
    pub passive_ids: BTreeSet<TargetId>,
    pub finished_ids: BTreeSet<TargetId>,
    /// Equivalence pointers: redirected id → pointee id.
    pub pointer_map: BTreeMap<TargetId, TargetId>,
}

impl Indices {
    /// Re-classify a target after a write.
    pub fn note(&mut self, target: &Target) {
        let id = &target.id;
        self.active_ids.remove(id);
        self.passive_ids.remove(id);
        self.finished_ids.remove(id);

        match target.simple_state() {
            SimpleState::Activable => {
                self.passive_ids.insert(id.clone());
            }
            SimpleState::InProgress => {
                self.active_ids.insert(id.clone());
            }
            SimpleState::Successful | SimpleState::Failed => {
                self.finished_ids.insert(id.clone());
            }
        }

        if let crate::target::State::PointedTo { target: pointee } = target.state() {
            self.pointer_map.insert(id.clone(), pointee.clone());
        }
    }

    /// Ids the engine must look at each tick.
    pub fn work_set(&self) -> BTreeSet<TargetId> {
        self.active_ids
            .union(&self.passive_ids)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use crate::target::{BuildProcess, State};

    #[test]
    fn note_moves_ids_between_sets() {
        let mut indices = Indices::default();
        let mut t = Target::new("t", Host::Localhost, BuildProcess::NoOperation);

        indices.note(&t);
        assert!(indices.passive_ids.contains(&t.id));

        t.push_state(State::Active { by_user: true });
        indices.note(&t);
        assert!(indices.active_ids.contains(&t.id));
        assert!(!indices.passive_ids.contains(&t.id));

        t.push_state(State::RanSuccessfully);
        indices.note(&t);
        assert!(indices.finished_ids.contains(&t.id));
        assert!(!indices.active_ids.contains(&t.id));
    }

    #[test]
    fn pointers_are_recorded() {
        let mut indices = Indices::default();
        let mut t = Target::new("t", Host::Localhost, BuildProcess::NoOperation);
        t.push_state(State::PointedTo {
            target: "gf-other".to_string(),
        });
        indices.note(&t);
        assert_eq!(
            indices.pointer_map.get(&t.id).map(String::as_str),
            Some("gf-other")
        );
    }
}
