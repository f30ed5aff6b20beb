// src/engine/mod.rs

//! The engine: single-writer loop that drives targets through their
//! lifecycle.
//!
//! Exactly one engine instance owns history writes. API handlers and the
//! CLI talk to it through the store (creating fresh targets) and the
//! durable command pipe; the engine drains commands at the top of each
//! tick, so every state transition funnels through one place.
//!
//! A tick has three phases (see [`tick`]): discovery, classification,
//! application. `step` runs one tick and reports what happened;
//! [`runtime::run_service`] repeats it with an idle delay.

pub mod commands;
pub mod runtime;
pub mod tick;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::backend::BackendRegistry;
use crate::config::EngineSection;
use crate::errors::{GridflowError, Result};
use crate::filter::{compile, eval, Filter, TimeConstraint};
use crate::host::SessionPool;
use crate::store::{Indices, Store};
use crate::target::{State, Target, TargetId};

pub use commands::{append_command, Command, CommandPipe};
pub use runtime::{run_service, ServiceOptions};

/// One entry of a tick's report: something advanced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WhatHappened {
    Activated { id: TargetId, by_user: bool },
    Restarted { old: TargetId, new: TargetId },
    KillRequested { id: TargetId },
    Killed { id: TargetId, from_passive: bool },
    PointedTo { id: TargetId, pointee: TargetId },
    PointerResolved { id: TargetId, success: bool },
    DependenciesDead { id: TargetId, which: Vec<TargetId> },
    MadeToFail { id: TargetId, by: TargetId },
    AlreadyDone { id: TargetId },
    Started { id: TargetId, attempt: u32 },
    StartPostponed { id: TargetId, attempt: u32, reason: String },
    FailedToStart { id: TargetId, reason: String },
    Succeeded { id: TargetId },
    FailedToRun { id: TargetId, reason: String },
    FailedFromCondition { id: TargetId },
    InvariantViolation { id: TargetId, detail: String },
    Paused,
    Resumed,
}

/// The single-writer engine.
pub struct Engine {
    store: Store,
    registry: BackendRegistry,
    config: EngineSection,
    indices: Indices,
    commands: CommandPipe,
    /// Transport-session limits per host.
    sessions: Arc<SessionPool>,
    /// Per-host cap on concurrent backend operations.
    host_slots: Arc<SessionPool>,
    /// Global cap on concurrent backend operations.
    workers: Arc<Semaphore>,
    /// Backoff gates for recoverable start failures (in-memory only; a
    /// restart simply retries immediately).
    retry_not_before: HashMap<TargetId, DateTime<Utc>>,
    paused: bool,
    invariant_violations: u64,
}

impl Engine {
    /// Open the store, run the recovery scan, and wire up the command pipe.
    pub async fn new(config: EngineSection, registry: BackendRegistry) -> Result<Self> {
        let store = Store::open(&config.db_root).await?;
        let report = store.recovery_scan().await?;
        if !report.running.is_empty() {
            debug!(count = report.running.len(), "re-ingesting running targets");
        }

        let commands = CommandPipe::open(
            store.commands_log_path(),
            store.root().join("commands.offset"),
        )
        .await?;

        Ok(Self {
            sessions: Arc::new(SessionPool::new(config.sessions_per_host)),
            host_slots: Arc::new(SessionPool::new(config.workers_per_host)),
            workers: Arc::new(Semaphore::new(config.workers_total)),
            store,
            registry,
            config,
            indices: report.indices,
            commands,
            retry_not_before: HashMap::new(),
            paused: false,
            invariant_violations: 0,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &EngineSection {
        &self.config
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Count of CAS mismatches and impossible states observed; a health
    /// check flag, never a process exit.
    pub fn invariant_violations(&self) -> u64 {
        self.invariant_violations
    }

    /// True when there is nothing in flight and nothing waiting.
    pub fn is_idle(&self) -> bool {
        self.indices.active_ids.is_empty() && self.retry_not_before.is_empty()
    }

    /// Validate and persist a batch of fresh targets.
    ///
    /// Ids may reference each other inside the batch (clients pre-assign
    /// ids with [`crate::target::fresh_id`]); the dependency graph of the
    /// batch must be acyclic and every referenced id must exist in the
    /// batch or in the store.
    pub async fn submit(&mut self, targets: Vec<Target>) -> Result<Vec<TargetId>> {
        validate_submission(&self.store, &targets).await?;

        let mut ids = Vec::with_capacity(targets.len());
        for target in &targets {
            self.store.create(target).await?;
            self.indices.note(target);
            ids.push(target.id.clone());
        }
        self.store.save_indices(&self.indices).await?;
        debug!(count = ids.len(), "targets submitted");
        Ok(ids)
    }

    /// Append a command to the durable pipe; it takes effect at the top of
    /// the next tick.
    pub async fn enqueue(&self, command: &Command) -> Result<()> {
        append_command(&self.store.commands_log_path(), command).await?;
        Ok(())
    }

    /// Apply one control command immediately (engine thread only).
    pub(crate) async fn apply_control(
        &mut self,
        command: Command,
        events: &mut Vec<WhatHappened>,
    ) -> Result<()> {
        match command {
            Command::Step => {}
            Command::Pause => {
                if !self.paused {
                    self.paused = true;
                    events.push(WhatHappened::Paused);
                }
            }
            Command::Resume => {
                if self.paused {
                    self.paused = false;
                    events.push(WhatHappened::Resumed);
                }
            }
            Command::Activate(id) => self.control_activate(&id, events).await?,
            Command::Kill(id) => self.control_kill(&id, events).await?,
            Command::Restart(id) => self.control_restart(&id, events).await?,
        }
        Ok(())
    }

    async fn control_activate(
        &mut self,
        id: &str,
        events: &mut Vec<WhatHappened>,
    ) -> Result<()> {
        let mut target = match self.store.maybe_get(id).await? {
            Some(target) => target,
            None => {
                warn!(id, "activate: no such target");
                return Ok(());
            }
        };
        if *target.state() != State::Passive {
            // Already active or terminal; activation is idempotent.
            return Ok(());
        }
        let expected = target.history.len();
        target.push_state(State::Active { by_user: true });
        if self.write_target(&target, expected, events).await? {
            events.push(WhatHappened::Activated {
                id: target.id.clone(),
                by_user: true,
            });
        }
        Ok(())
    }

    async fn control_kill(&mut self, id: &str, events: &mut Vec<WhatHappened>) -> Result<()> {
        let mut target = match self.store.maybe_get(id).await? {
            Some(target) => target,
            None => {
                warn!(id, "kill: no such target");
                return Ok(());
            }
        };
        let state = target.state().clone();
        if state.is_terminal() {
            return Ok(());
        }

        let expected = target.history.len();
        if state.is_running_family() {
            // A backend job exists; the tick fires backend.kill.
            if !target.kill_requested {
                target.kill_requested = true;
                if self.write_target(&target, expected, events).await? {
                    events.push(WhatHappened::KillRequested {
                        id: target.id.clone(),
                    });
                }
            }
            return Ok(());
        }

        // Nothing has been submitted to a backend yet.
        let from_passive = state == State::Passive;
        target.push_state(if from_passive {
            State::KilledFromPassive
        } else {
            State::Killed
        });
        self.retry_not_before.remove(&target.id);
        if self.write_target(&target, expected, events).await? {
            events.push(WhatHappened::Killed {
                id: target.id.clone(),
                from_passive,
            });
        }
        Ok(())
    }

    async fn control_restart(
        &mut self,
        id: &str,
        events: &mut Vec<WhatHappened>,
    ) -> Result<()> {
        let target = match self.store.maybe_get(id).await? {
            Some(target) => target,
            None => {
                warn!(id, "restart: no such target");
                return Ok(());
            }
        };
        if !target.state().is_terminal() {
            warn!(id, state = target.state().name(), "restart: target is not terminal");
            return Ok(());
        }

        let mut fresh = target.clone();
        fresh.id = crate::target::fresh_id();
        fresh.kill_requested = false;
        fresh.history.clear();
        fresh.push_state(State::Passive);
        fresh.push_state(State::Active { by_user: true });

        self.store.create(&fresh).await?;
        self.indices.note(&fresh);
        events.push(WhatHappened::Restarted {
            old: target.id.clone(),
            new: fresh.id.clone(),
        });
        Ok(())
    }

    /// CAS write + index maintenance. A mismatch is recorded as an
    /// invariant violation and the write is skipped.
    pub(crate) async fn write_target(
        &mut self,
        target: &Target,
        expected: usize,
        events: &mut Vec<WhatHappened>,
    ) -> Result<bool> {
        match self.store.update_cas(target, expected).await {
            Ok(()) => {
                self.indices.note(target);
                Ok(true)
            }
            Err(crate::store::StoreError::CasMismatch { expected, found, .. }) => {
                self.invariant_violations += 1;
                events.push(WhatHappened::InvariantViolation {
                    id: target.id.clone(),
                    detail: format!(
                        "concurrent write detected (expected history {expected}, found {found})"
                    ),
                });
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Check intra-batch references and acyclicity before anything is written.
pub(crate) async fn validate_submission(store: &Store, targets: &[Target]) -> Result<()> {
    let batch_ids: std::collections::BTreeSet<&str> =
        targets.iter().map(|t| t.id.as_str()).collect();
    if batch_ids.len() != targets.len() {
        return Err(GridflowError::ConfigError(
            "submission contains duplicate target ids".to_string(),
        ));
    }

    for target in targets {
        if store.maybe_get(&target.id).await?.is_some() {
            return Err(GridflowError::ConfigError(format!(
                "target id already exists: {}",
                target.id
            )));
        }
        for referenced in target
            .depends_on
            .iter()
            .chain(&target.make_fail_if)
            .chain(&target.success_triggers)
        {
            if !batch_ids.contains(referenced.as_str())
                && store.maybe_get(referenced).await?.is_none()
            {
                return Err(GridflowError::TargetNotFound(referenced.clone()));
            }
        }
    }

    // Cycles can only form inside the batch: stored targets cannot name
    // ids that did not exist when they were created.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for target in targets {
        graph.add_node(target.id.as_str());
    }
    for target in targets {
        for dep in &target.depends_on {
            if batch_ids.contains(dep.as_str()) {
                graph.add_edge(dep.as_str(), target.id.as_str(), ());
            }
        }
    }
    if let Err(cycle) = toposort(&graph, None) {
        return Err(GridflowError::DependencyCycle(format!(
            "cycle detected involving target '{}'",
            cycle.node_id()
        )));
    }

    Ok(())
}

/// Evaluate a filter against the whole store (API + CLI query path).
///
/// The compiled time constraint prunes candidates before the residual
/// predicate runs.
pub async fn run_query(store: &Store, filter: &Filter, now: DateTime<Utc>) -> Result<Vec<Target>> {
    let compiled = compile(filter, now);
    let mut matching = Vec::new();
    for id in store.list_ids().await? {
        let target = match store.maybe_get(&id).await? {
            Some(target) => target,
            None => continue,
        };
        if let Some(TimeConstraint::CreatedAfter(bound)) = compiled.time {
            if target.created_at() < bound {
                continue;
            }
        }
        if eval(&compiled.predicate, &target, now) {
            matching.push(target);
        }
    }
    Ok(matching)
}
