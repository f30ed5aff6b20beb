// src/engine/tick.rs

//! One engine tick: discovery, classification, application.
//!
//! Classification ([`classify`]) is a pure function over a target and a
//! snapshot of the records it references, so the transition table can be
//! unit tested without Tokio, hosts or a store. The async shell around it
//! lives in [`Engine::step`]: it fetches the work set, applies inline
//! transitions sequentially (still single-writer), and dispatches backend
//! I/O to bounded concurrent workers whose outcomes are written back
//! through compare-and-set.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::backend::{Backend, KillOutcome, PollOutcome, StartOutcome};
use crate::engine::{Engine, WhatHappened};
use crate::errors::Result;
use crate::host::{Host, SessionPool};
use crate::target::{BuildProcess, Equivalence, SimpleState, State, Target, TargetId};

/// What the engine decided to do with one target this tick.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TickAction {
    Nothing,
    /// Dependencies that are still passive must be activated first.
    ActivateDeps(Vec<TargetId>),
    MarkDead(Vec<TargetId>),
    MakeFail { by: TargetId },
    /// Condition skip-check followed by a backend start.
    StartCheck { attempt: u32 },
    Poll,
    Verify,
    /// Nothing was ever submitted; the target dies without backend help.
    KillNow { from_passive: bool },
    KillBackend,
    ResolvePointer { pointee: TargetId },
}

/// Pure transition decision for one target.
pub(crate) fn classify(
    target: &Target,
    cache: &HashMap<TargetId, Target>,
    now: DateTime<Utc>,
    retry_gate: Option<DateTime<Utc>>,
) -> TickAction {
    let state = target.state();
    if state.is_terminal() {
        return TickAction::Nothing;
    }

    // A kill request beats everything else.
    if target.kill_requested {
        return if state.is_running_family() {
            TickAction::KillBackend
        } else {
            TickAction::KillNow {
                from_passive: *state == State::Passive,
            }
        };
    }

    match state {
        State::Passive => TickAction::Nothing,
        State::PointedTo { target: pointee } => TickAction::ResolvePointer {
            pointee: pointee.clone(),
        },
        State::StartedRunning | State::StillBuilding => TickAction::Poll,
        State::StillVerifyingSuccess => TickAction::Verify,
        State::TriedToStart { attempt } => {
            if let Some(gate) = retry_gate {
                if now < gate {
                    return TickAction::Nothing;
                }
            }
            TickAction::StartCheck {
                attempt: attempt + 1,
            }
        }
        State::Active { .. } => {
            // make_fail_if trumps everything, fallback or not.
            for by in &target.make_fail_if {
                if cache
                    .get(by)
                    .map(|d| d.state().is_failed())
                    .unwrap_or(false)
                {
                    return TickAction::MakeFail { by: by.clone() };
                }
            }

            let mut dead = Vec::new();
            let mut passive_deps = Vec::new();
            let mut waiting = false;
            for dep_id in &target.depends_on {
                match cache.get(dep_id) {
                    // A dependency that does not exist can never succeed.
                    None => dead.push(dep_id.clone()),
                    Some(dep) => match dep.simple_state() {
                        SimpleState::Failed => dead.push(dep_id.clone()),
                        SimpleState::Successful => {}
                        SimpleState::Activable => {
                            passive_deps.push(dep_id.clone());
                            waiting = true;
                        }
                        SimpleState::InProgress => waiting = true,
                    },
                }
            }
            if !dead.is_empty() {
                return TickAction::MarkDead(dead);
            }
            if !passive_deps.is_empty() {
                return TickAction::ActivateDeps(passive_deps);
            }
            if waiting {
                return TickAction::Nothing;
            }
            TickAction::StartCheck { attempt: 1 }
        }
        // Terminal variants were handled by the is_terminal guard.
        _ => TickAction::Nothing,
    }
}

/// Pick the target an equivalent one should point at, if any.
///
/// Candidates must share `SameActiveCondition` equivalence and an equal
/// condition, and be in progress. One that has already started wins;
/// among merely-Active peers the smallest id proceeds and the others
/// point at it.
pub(crate) fn find_equivalent(
    target: &Target,
    cache: &HashMap<TargetId, Target>,
) -> Option<TargetId> {
    if target.equivalence != Equivalence::SameActiveCondition {
        return None;
    }
    let condition = target.condition.as_ref()?;

    let mut candidates: Vec<&Target> = cache
        .values()
        .filter(|u| {
            u.id != target.id
                && u.equivalence == Equivalence::SameActiveCondition
                && u.condition.as_ref() == Some(condition)
                && !u.state().is_terminal()
                && !matches!(u.state(), State::PointedTo { .. } | State::Passive)
        })
        .collect();
    candidates.sort_by(|a, b| a.id.cmp(&b.id));

    if let Some(started) = candidates
        .iter()
        .find(|u| u.state().is_running_family() || matches!(u.state(), State::TriedToStart { .. }))
    {
        return Some(started.id.clone());
    }
    candidates
        .into_iter()
        .find(|u| u.id < target.id)
        .map(|u| u.id.clone())
}

/// Work dispatched to the bounded worker pool.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum OpKind {
    StartCheck { attempt: u32 },
    Poll,
    Verify,
    KillBackend,
}

/// Outcome of one worker op, applied back on the engine thread.
#[derive(Debug)]
pub(crate) enum OpResult {
    ConditionHeld,
    NoOpDone { verified: bool },
    StartOk { rp: serde_json::Value, attempt: u32 },
    StartRecoverable { attempt: u32, reason: String },
    StartFatal { attempt: u32, reason: String },
    CheckTryAgain { reason: String },
    UpdateStillRunning { rp: serde_json::Value },
    UpdateDone { rp: serde_json::Value, verified: Option<bool> },
    UpdateFailed { rp: serde_json::Value, reason: String },
    UpdateTryAgain { reason: String },
    VerifyHolds,
    VerifyFails,
    VerifyTryAgain { reason: String },
    KillDone,
    KillTryAgain { reason: String },
}

impl Engine {
    /// Run one tick and report what advanced.
    pub async fn step(&mut self) -> Result<Vec<WhatHappened>> {
        let mut events = Vec::new();

        // Phase 1a: drain the command pipe; the offset becomes durable
        // only after the commands took effect.
        let (commands, new_offset) = self.commands.drain().await?;
        for command in commands {
            self.apply_control(command, &mut events).await?;
        }
        self.commands.commit(new_offset).await?;

        if self.paused {
            self.store.save_indices(&self.indices).await?;
            return Ok(events);
        }

        // Phase 1b: load the work set and everything it references.
        let work_ids: Vec<TargetId> = self.indices.work_set().into_iter().collect();
        let mut cache: HashMap<TargetId, Target> = HashMap::new();
        for id in &work_ids {
            match self.store.maybe_get(id).await? {
                Some(target) => {
                    cache.insert(id.clone(), target);
                }
                None => {
                    warn!(id, "indexed target vanished from the store");
                    self.indices.active_ids.remove(id);
                    self.indices.passive_ids.remove(id);
                }
            }
        }

        let mut referenced: BTreeSet<TargetId> = BTreeSet::new();
        for target in cache.values() {
            referenced.extend(target.depends_on.iter().cloned());
            referenced.extend(target.make_fail_if.iter().cloned());
            if let State::PointedTo { target: pointee } = target.state() {
                referenced.insert(pointee.clone());
            }
        }
        for id in referenced {
            if !cache.contains_key(&id) {
                if let Some(target) = self.store.maybe_get(&id).await? {
                    cache.insert(id, target);
                }
            }
        }

        // Phase 2: classify against the snapshot.
        let now = Utc::now();
        let actions: Vec<(TargetId, TickAction)> = work_ids
            .iter()
            .filter_map(|id| {
                cache.get(id).map(|target| {
                    let gate = self.retry_not_before.get(id).copied();
                    (id.clone(), classify(target, &cache, now, gate))
                })
            })
            .collect();

        // Phase 3a: inline transitions, applied sequentially; the cache is
        // kept current so later decisions in the same tick see them.
        let mut ops: Vec<(Target, OpKind)> = Vec::new();
        for (id, action) in actions {
            match action {
                TickAction::Nothing => {}
                TickAction::StartCheck { attempt } => {
                    let Some(target) = cache.get(&id) else { continue };
                    if let Some(pointee) = find_equivalent(target, &cache) {
                        let mut updated = target.clone();
                        let expected = updated.history.len();
                        updated.push_state(State::PointedTo {
                            target: pointee.clone(),
                        });
                        if self.write_target(&updated, expected, &mut events).await? {
                            events.push(WhatHappened::PointedTo {
                                id: id.clone(),
                                pointee,
                            });
                            cache.insert(id, updated);
                        }
                    } else {
                        ops.push((target.clone(), OpKind::StartCheck { attempt }));
                    }
                }
                TickAction::Poll => {
                    if let Some(target) = cache.get(&id) {
                        ops.push((target.clone(), OpKind::Poll));
                    }
                }
                TickAction::Verify => {
                    if let Some(target) = cache.get(&id) {
                        ops.push((target.clone(), OpKind::Verify));
                    }
                }
                TickAction::KillBackend => {
                    if let Some(target) = cache.get(&id) {
                        ops.push((target.clone(), OpKind::KillBackend));
                    }
                }
                TickAction::ActivateDeps(deps) => {
                    for dep_id in deps {
                        let Some(dep) = cache.get(&dep_id) else { continue };
                        if *dep.state() != State::Passive {
                            continue; // someone earlier in this tick already did it
                        }
                        let mut updated = dep.clone();
                        let expected = updated.history.len();
                        updated.push_state(State::Active { by_user: false });
                        if self.write_target(&updated, expected, &mut events).await? {
                            events.push(WhatHappened::Activated {
                                id: dep_id.clone(),
                                by_user: false,
                            });
                            cache.insert(dep_id, updated);
                        }
                    }
                }
                TickAction::MarkDead(which) => {
                    let Some(target) = cache.get(&id) else { continue };
                    let mut updated = target.clone();
                    let expected = updated.history.len();
                    updated.push_state(State::DeadBecauseOfDependencies {
                        which: which.clone(),
                    });
                    if self.write_target(&updated, expected, &mut events).await? {
                        events.push(WhatHappened::DependenciesDead { id: id.clone(), which });
                        cache.insert(id, updated);
                    }
                }
                TickAction::MakeFail { by } => {
                    let Some(target) = cache.get(&id) else { continue };
                    let mut updated = target.clone();
                    let expected = updated.history.len();
                    updated.push_state(State::FailedToRun {
                        reason: format!("make-fail-if triggered by {by}"),
                    });
                    if self.write_target(&updated, expected, &mut events).await? {
                        events.push(WhatHappened::MadeToFail { id: id.clone(), by });
                        cache.insert(id, updated);
                    }
                }
                TickAction::KillNow { from_passive } => {
                    let Some(target) = cache.get(&id) else { continue };
                    let mut updated = target.clone();
                    let expected = updated.history.len();
                    updated.push_state(if from_passive {
                        State::KilledFromPassive
                    } else {
                        State::Killed
                    });
                    self.retry_not_before.remove(&id);
                    if self.write_target(&updated, expected, &mut events).await? {
                        events.push(WhatHappened::Killed {
                            id: id.clone(),
                            from_passive,
                        });
                        cache.insert(id, updated);
                    }
                }
                TickAction::ResolvePointer { pointee } => {
                    let outcome = cache.get(&pointee).map(|p| p.simple_state());
                    match outcome {
                        Some(SimpleState::Successful) => {
                            let Some(target) = cache.get(&id) else { continue };
                            let mut updated = target.clone();
                            let expected = updated.history.len();
                            updated.push_state(State::RanSuccessfully);
                            events.push(WhatHappened::PointerResolved {
                                id: id.clone(),
                                success: true,
                            });
                            self.finalize_success(
                                updated,
                                expected,
                                &mut events,
                                WhatHappened::Succeeded { id: id.clone() },
                            )
                            .await?;
                        }
                        Some(SimpleState::Failed) => {
                            let Some(target) = cache.get(&id) else { continue };
                            let mut updated = target.clone();
                            let expected = updated.history.len();
                            updated.push_state(State::FailedToRun {
                                reason: format!("equivalent target {pointee} failed"),
                            });
                            if self.write_target(&updated, expected, &mut events).await? {
                                events.push(WhatHappened::PointerResolved {
                                    id: id.clone(),
                                    success: false,
                                });
                                cache.insert(id, updated);
                            }
                        }
                        // Still in progress, or the pointee vanished; wait.
                        _ => {}
                    }
                }
            }
        }

        // Phase 3b: backend I/O under the worker caps. Ops that find no
        // free slot stay pending for the next tick.
        let mut join_set: JoinSet<(Target, usize, OpResult)> = JoinSet::new();
        for (target, kind) in ops {
            let global = match self.workers.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("global worker cap reached; deferring remaining ops");
                    break;
                }
            };
            let host_slot = match self.host_slots.try_acquire(&target.host).await {
                Some(permit) => permit,
                None => {
                    debug!(host = %target.host.key(), "per-host worker cap reached; deferring");
                    continue;
                }
            };

            let backend = target
                .backend_name()
                .and_then(|name| self.registry.get(name));
            let expected = target.history.len();
            join_set.spawn(run_op(
                target,
                expected,
                kind,
                backend,
                self.sessions.clone(),
                Duration::from_secs(self.config.start_deadline_secs),
                Duration::from_secs(self.config.update_deadline_secs),
                global,
                host_slot,
            ));
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((target, expected, result)) => {
                    self.apply_op_result(target, expected, result, &mut events)
                        .await?;
                }
                Err(e) => {
                    self.invariant_violations += 1;
                    warn!(error = %e, "tick worker crashed");
                }
            }
        }

        self.store.save_indices(&self.indices).await?;
        Ok(events)
    }

    async fn apply_op_result(
        &mut self,
        mut target: Target,
        expected: usize,
        result: OpResult,
        events: &mut Vec<WhatHappened>,
    ) -> Result<()> {
        let id = target.id.clone();
        match result {
            OpResult::ConditionHeld => {
                target.push_state(State::AlreadyDone);
                self.finalize_success(target, expected, events, WhatHappened::AlreadyDone { id })
                    .await?;
            }
            OpResult::NoOpDone { verified: true } => {
                target.push_state(State::RanSuccessfully);
                self.finalize_success(target, expected, events, WhatHappened::Succeeded { id })
                    .await?;
            }
            OpResult::NoOpDone { verified: false } => {
                target.push_state(State::FailedFromCondition);
                if self.write_target(&target, expected, events).await? {
                    events.push(WhatHappened::FailedFromCondition { id });
                }
            }
            OpResult::StartOk { rp, attempt } => {
                target.push_state(State::TriedToStart { attempt });
                target.set_run_parameters(rp);
                target.push_state(State::StartedRunning);
                self.retry_not_before.remove(&id);
                if self.write_target(&target, expected, events).await? {
                    events.push(WhatHappened::Started { id, attempt });
                }
            }
            OpResult::StartRecoverable { attempt, reason } => {
                target.push_state(State::TriedToStart { attempt });
                let delay = self.backoff_delay(&id, attempt);
                let gate = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(300));
                self.retry_not_before.insert(id.clone(), gate);
                if self.write_target(&target, expected, events).await? {
                    events.push(WhatHappened::StartPostponed {
                        id,
                        attempt,
                        reason,
                    });
                }
            }
            OpResult::StartFatal { attempt, reason } => {
                target.push_state(State::TriedToStart { attempt });
                target.push_state(State::FailedToStart {
                    reason: reason.clone(),
                });
                self.retry_not_before.remove(&id);
                if self.write_target(&target, expected, events).await? {
                    events.push(WhatHappened::FailedToStart { id, reason });
                }
            }
            OpResult::CheckTryAgain { reason } => {
                debug!(%id, %reason, "condition check postponed");
            }
            OpResult::UpdateStillRunning { rp } => {
                let rp_changed = target.run_parameters() != Some(&rp);
                let first_poll = matches!(target.state(), State::StartedRunning);
                if first_poll {
                    target.push_state(State::StillBuilding);
                }
                if rp_changed {
                    target.set_run_parameters(rp);
                }
                if first_poll || rp_changed {
                    self.write_target(&target, expected, events).await?;
                }
            }
            OpResult::UpdateDone { rp, verified } => {
                target.set_run_parameters(rp);
                target.push_state(State::StillVerifyingSuccess);
                match verified {
                    Some(true) => {
                        target.push_state(State::RanSuccessfully);
                        self.finalize_success(
                            target,
                            expected,
                            events,
                            WhatHappened::Succeeded { id },
                        )
                        .await?;
                    }
                    Some(false) => {
                        target.push_state(State::FailedFromCondition);
                        if self.write_target(&target, expected, events).await? {
                            events.push(WhatHappened::FailedFromCondition { id });
                        }
                    }
                    // Condition unevaluable right now; park in
                    // StillVerifyingSuccess and verify next tick.
                    None => {
                        self.write_target(&target, expected, events).await?;
                    }
                }
            }
            OpResult::UpdateFailed { rp, reason } => {
                target.set_run_parameters(rp);
                target.push_state(State::FailedToRun {
                    reason: reason.clone(),
                });
                if self.write_target(&target, expected, events).await? {
                    events.push(WhatHappened::FailedToRun { id, reason });
                }
            }
            OpResult::UpdateTryAgain { reason } => {
                debug!(%id, %reason, "poll postponed");
            }
            OpResult::VerifyHolds => {
                target.push_state(State::RanSuccessfully);
                self.finalize_success(target, expected, events, WhatHappened::Succeeded { id })
                    .await?;
            }
            OpResult::VerifyFails => {
                target.push_state(State::FailedFromCondition);
                if self.write_target(&target, expected, events).await? {
                    events.push(WhatHappened::FailedFromCondition { id });
                }
            }
            OpResult::VerifyTryAgain { reason } => {
                debug!(%id, %reason, "verification postponed");
            }
            OpResult::KillDone => {
                target.push_state(State::Killed);
                self.retry_not_before.remove(&id);
                if self.write_target(&target, expected, events).await? {
                    events.push(WhatHappened::Killed {
                        id,
                        from_passive: false,
                    });
                }
            }
            OpResult::KillTryAgain { reason } => {
                debug!(%id, %reason, "kill postponed");
            }
        }
        Ok(())
    }

    /// Write a succeeded target and the activation of its success-trigger
    /// children as one batch (children first, so a crash between renames
    /// re-runs the parent's transition instead of losing the children).
    async fn finalize_success(
        &mut self,
        target: Target,
        expected: usize,
        events: &mut Vec<WhatHappened>,
        headline: WhatHappened,
    ) -> Result<()> {
        let mut batch: Vec<(Target, usize)> = Vec::new();
        let mut child_events = Vec::new();

        for child_id in &target.success_triggers {
            match self.store.maybe_get(child_id).await? {
                Some(mut child) if *child.state() == State::Passive => {
                    let child_expected = child.history.len();
                    child.push_state(State::Active { by_user: false });
                    child_events.push(WhatHappened::Activated {
                        id: child.id.clone(),
                        by_user: false,
                    });
                    batch.push((child, child_expected));
                }
                Some(_) => {} // already active or terminal
                None => warn!(child = %child_id, "success trigger names a missing target"),
            }
        }
        batch.push((target, expected));

        match self.store.write_batch(&batch).await {
            Ok(()) => {
                for (t, _) in &batch {
                    self.indices.note(t);
                    self.retry_not_before.remove(&t.id);
                }
                events.extend(child_events);
                events.push(headline);
            }
            Err(crate::store::StoreError::CasMismatch { id, expected, found }) => {
                self.invariant_violations += 1;
                events.push(WhatHappened::InvariantViolation {
                    id,
                    detail: format!(
                        "concurrent write detected during success batch (expected history {expected}, found {found})"
                    ),
                });
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn backoff_delay(&self, id: &str, attempt: u32) -> Duration {
        let exp = self
            .config
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.config.backoff_cap_ms) as f64;
        Duration::from_millis((capped * jitter_factor(id, attempt)) as u64)
    }
}

/// Deterministic ±20% jitter so retrying targets do not stampede.
fn jitter_factor(id: &str, attempt: u32) -> f64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    id.hash(&mut hasher);
    attempt.hash(&mut hasher);
    0.8 + 0.4 * ((hasher.finish() % 2001) as f64 / 2000.0)
}

/// One unit of backend work; runs on the worker pool holding its permits.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_op(
    target: Target,
    expected: usize,
    kind: OpKind,
    backend: Option<Arc<dyn Backend>>,
    sessions: Arc<SessionPool>,
    start_deadline: Duration,
    update_deadline: Duration,
    _global: OwnedSemaphorePermit,
    _host_slot: OwnedSemaphorePermit,
) -> (Target, usize, OpResult) {
    let host = target.host.clone();
    let _session = sessions.acquire(&host).await;

    let result = match kind {
        OpKind::StartCheck { attempt } => {
            op_start_check(&target, attempt, backend, &host, start_deadline, update_deadline).await
        }
        OpKind::Poll => op_poll(&target, backend, &host, update_deadline).await,
        OpKind::Verify => op_verify(&target, &host, update_deadline).await,
        OpKind::KillBackend => op_kill(&target, backend, &host, update_deadline).await,
    };
    (target, expected, result)
}

async fn op_start_check(
    target: &Target,
    attempt: u32,
    backend: Option<Arc<dyn Backend>>,
    host: &Host,
    start_deadline: Duration,
    update_deadline: Duration,
) -> OpResult {
    // Skip-check: work whose condition already holds never starts.
    if let Some(condition) = &target.condition {
        match timeout(update_deadline, condition.eval(host)).await {
            Ok(Ok(true)) => return OpResult::ConditionHeld,
            Ok(Ok(false)) => {}
            Ok(Err(e)) => {
                return OpResult::CheckTryAgain {
                    reason: e.to_string(),
                }
            }
            Err(_) => {
                return OpResult::CheckTryAgain {
                    reason: "condition check timed out".to_string(),
                }
            }
        }
    }

    match &target.build_process {
        // Nothing to run: succeeds unless an unmet condition says otherwise.
        BuildProcess::NoOperation => OpResult::NoOpDone {
            verified: target.condition.is_none(),
        },
        BuildProcess::LongRunning {
            backend: name,
            run_parameters,
        } => {
            let Some(backend) = backend else {
                return OpResult::StartFatal {
                    attempt,
                    reason: format!("no such backend: {name}"),
                };
            };
            match timeout(start_deadline, backend.start(run_parameters, host)).await {
                Ok(StartOutcome::Started(rp)) => OpResult::StartOk { rp, attempt },
                Ok(StartOutcome::Recoverable(reason)) => {
                    OpResult::StartRecoverable { attempt, reason }
                }
                Ok(StartOutcome::Fatal(reason)) => OpResult::StartFatal { attempt, reason },
                Err(_) => OpResult::StartRecoverable {
                    attempt,
                    reason: format!("start exceeded its {}s deadline", start_deadline.as_secs()),
                },
            }
        }
    }
}

async fn op_poll(
    target: &Target,
    backend: Option<Arc<dyn Backend>>,
    host: &Host,
    update_deadline: Duration,
) -> OpResult {
    let (name, rp) = match &target.build_process {
        BuildProcess::LongRunning {
            backend,
            run_parameters,
        } => (backend, run_parameters),
        BuildProcess::NoOperation => {
            return OpResult::UpdateFailed {
                rp: serde_json::Value::Null,
                reason: "running state without a build process".to_string(),
            }
        }
    };
    let Some(backend) = backend else {
        return OpResult::UpdateFailed {
            rp: rp.clone(),
            reason: format!("no such backend: {name}"),
        };
    };

    match timeout(update_deadline, backend.update(rp, host)).await {
        Ok(PollOutcome::StillRunning(rp)) => OpResult::UpdateStillRunning { rp },
        Ok(PollOutcome::Succeeded(rp)) => {
            let verified = verify_condition(target, host, update_deadline).await;
            OpResult::UpdateDone { rp, verified }
        }
        Ok(PollOutcome::Failed(rp, reason)) => OpResult::UpdateFailed { rp, reason },
        Ok(PollOutcome::TryAgain(reason)) => OpResult::UpdateTryAgain { reason },
        Err(_) => OpResult::UpdateTryAgain {
            reason: format!("update exceeded its {}s deadline", update_deadline.as_secs()),
        },
    }
}

/// `Some(holds)` or `None` when transport trouble prevents an answer.
async fn verify_condition(target: &Target, host: &Host, deadline: Duration) -> Option<bool> {
    match &target.condition {
        None => Some(true),
        Some(condition) => match timeout(deadline, condition.eval(host)).await {
            Ok(Ok(holds)) => Some(holds),
            Ok(Err(_)) | Err(_) => None,
        },
    }
}

async fn op_verify(target: &Target, host: &Host, deadline: Duration) -> OpResult {
    match verify_condition(target, host, deadline).await {
        Some(true) => OpResult::VerifyHolds,
        Some(false) => OpResult::VerifyFails,
        None => OpResult::VerifyTryAgain {
            reason: "condition unevaluable right now".to_string(),
        },
    }
}

async fn op_kill(
    target: &Target,
    backend: Option<Arc<dyn Backend>>,
    host: &Host,
    deadline: Duration,
) -> OpResult {
    match &target.build_process {
        BuildProcess::NoOperation => OpResult::KillDone,
        BuildProcess::LongRunning { run_parameters, .. } => {
            let Some(backend) = backend else {
                // No backend to cancel with; the job (if any) is orphaned
                // and the target still dies.
                return OpResult::KillDone;
            };
            match timeout(deadline, backend.kill(run_parameters, host)).await {
                Ok(KillOutcome::Killed) => OpResult::KillDone,
                Ok(KillOutcome::TryAgain(reason)) => OpResult::KillTryAgain { reason },
                Err(_) => OpResult::KillTryAgain {
                    reason: "kill timed out".to_string(),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;

    fn plain(name: &str) -> Target {
        Target::new(name, Host::Localhost, BuildProcess::NoOperation)
    }

    fn cache_of(targets: &[&Target]) -> HashMap<TargetId, Target> {
        targets
            .iter()
            .map(|t| (t.id.clone(), (*t).clone()))
            .collect()
    }

    #[test]
    fn passive_targets_do_nothing() {
        let t = plain("t");
        let action = classify(&t, &HashMap::new(), Utc::now(), None);
        assert_eq!(action, TickAction::Nothing);
    }

    #[test]
    fn active_without_deps_starts() {
        let mut t = plain("t");
        t.push_state(State::Active { by_user: true });
        let action = classify(&t, &HashMap::new(), Utc::now(), None);
        assert_eq!(action, TickAction::StartCheck { attempt: 1 });
    }

    #[test]
    fn passive_dependencies_are_activated_first() {
        let dep = plain("dep");
        let mut t = plain("t");
        t.depends_on = vec![dep.id.clone()];
        t.push_state(State::Active { by_user: true });

        let cache = cache_of(&[&dep, &t]);
        assert_eq!(
            classify(&t, &cache, Utc::now(), None),
            TickAction::ActivateDeps(vec![dep.id.clone()])
        );
    }

    #[test]
    fn in_progress_dependencies_mean_waiting() {
        let mut dep = plain("dep");
        dep.push_state(State::Active { by_user: false });
        let mut t = plain("t");
        t.depends_on = vec![dep.id.clone()];
        t.push_state(State::Active { by_user: true });

        let cache = cache_of(&[&dep, &t]);
        assert_eq!(classify(&t, &cache, Utc::now(), None), TickAction::Nothing);
    }

    #[test]
    fn failed_dependency_kills_the_dependent() {
        let mut dep = plain("dep");
        dep.push_state(State::FailedToRun {
            reason: "exit 2".to_string(),
        });
        let mut t = plain("t");
        t.depends_on = vec![dep.id.clone()];
        t.push_state(State::Active { by_user: true });

        let cache = cache_of(&[&dep, &t]);
        assert_eq!(
            classify(&t, &cache, Utc::now(), None),
            TickAction::MarkDead(vec![dep.id.clone()])
        );
    }

    #[test]
    fn missing_dependency_is_dead() {
        let mut t = plain("t");
        t.depends_on = vec!["gf-never-created".to_string()];
        t.push_state(State::Active { by_user: true });

        assert_eq!(
            classify(&t, &HashMap::new(), Utc::now(), None),
            TickAction::MarkDead(vec!["gf-never-created".to_string()])
        );
    }

    #[test]
    fn make_fail_if_trumps_satisfied_dependencies() {
        let mut dep = plain("dep");
        dep.push_state(State::RanSuccessfully);
        let mut trigger = plain("trigger");
        trigger.push_state(State::Killed);

        let mut t = plain("t");
        t.depends_on = vec![dep.id.clone()];
        t.make_fail_if = vec![trigger.id.clone()];
        t.push_state(State::Active { by_user: true });

        let cache = cache_of(&[&dep, &trigger, &t]);
        assert_eq!(
            classify(&t, &cache, Utc::now(), None),
            TickAction::MakeFail {
                by: trigger.id.clone()
            }
        );
    }

    #[test]
    fn running_states_poll_and_verify() {
        let mut t = plain("t");
        t.push_state(State::Active { by_user: true });
        t.push_state(State::TriedToStart { attempt: 1 });
        t.push_state(State::StartedRunning);
        assert_eq!(classify(&t, &HashMap::new(), Utc::now(), None), TickAction::Poll);

        t.push_state(State::StillBuilding);
        assert_eq!(classify(&t, &HashMap::new(), Utc::now(), None), TickAction::Poll);

        t.push_state(State::StillVerifyingSuccess);
        assert_eq!(classify(&t, &HashMap::new(), Utc::now(), None), TickAction::Verify);
    }

    #[test]
    fn retry_gate_postpones_start() {
        let mut t = plain("t");
        t.push_state(State::Active { by_user: true });
        t.push_state(State::TriedToStart { attempt: 2 });

        let now = Utc::now();
        let gate = now + chrono::Duration::seconds(30);
        assert_eq!(classify(&t, &HashMap::new(), now, Some(gate)), TickAction::Nothing);
        assert_eq!(
            classify(&t, &HashMap::new(), gate, Some(gate)),
            TickAction::StartCheck { attempt: 3 }
        );
    }

    #[test]
    fn kill_requests_beat_everything() {
        let mut passive = plain("p");
        passive.kill_requested = true;
        assert_eq!(
            classify(&passive, &HashMap::new(), Utc::now(), None),
            TickAction::KillNow { from_passive: true }
        );

        let mut running = plain("r");
        running.push_state(State::Active { by_user: true });
        running.push_state(State::TriedToStart { attempt: 1 });
        running.push_state(State::StartedRunning);
        running.kill_requested = true;
        assert_eq!(
            classify(&running, &HashMap::new(), Utc::now(), None),
            TickAction::KillBackend
        );

        let mut done = plain("d");
        done.push_state(State::RanSuccessfully);
        done.kill_requested = true;
        assert_eq!(
            classify(&done, &HashMap::new(), Utc::now(), None),
            TickAction::Nothing
        );
    }

    #[test]
    fn equivalence_prefers_started_candidates() {
        use crate::target::Condition;

        let condition = Condition::VolumeExists {
            path: "/tmp/shared".into(),
        };

        let mut started = plain("started");
        started.equivalence = Equivalence::SameActiveCondition;
        started.condition = Some(condition.clone());
        started.push_state(State::Active { by_user: true });
        started.push_state(State::TriedToStart { attempt: 1 });
        started.push_state(State::StartedRunning);

        let mut newcomer = plain("newcomer");
        newcomer.equivalence = Equivalence::SameActiveCondition;
        newcomer.condition = Some(condition.clone());
        newcomer.push_state(State::Active { by_user: true });

        let cache = cache_of(&[&started, &newcomer]);
        assert_eq!(
            find_equivalent(&newcomer, &cache),
            Some(started.id.clone())
        );

        // Without a condition there is nothing to be equivalent about.
        let mut plain_one = plain("no-cond");
        plain_one.equivalence = Equivalence::SameActiveCondition;
        plain_one.push_state(State::Active { by_user: true });
        assert_eq!(find_equivalent(&plain_one, &cache), None);
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        for attempt in 1..20 {
            let factor = jitter_factor("gf-some-id", attempt);
            assert!((0.8..=1.2).contains(&factor), "factor {factor}");
        }
    }
}
