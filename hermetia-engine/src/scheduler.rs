// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! The scheduler: a single-threaded cooperative loop over a dynamically
//! growing goal graph.
//!
//! The worker owns every goal in an arena and deduplicates by target, so
//! at most one goal exists per derivation path and per store path; late
//! requesters attach as waiters. Ready goals are stepped one at a time;
//! offloaded work (builds, substituter downloads) posts events back to
//! the loop. Build slots are counting pools with FIFO waiter queues,
//! mutated only by the loop. Substitution goals outrank build goals in
//! the ready queue.
//!
//! Failure policy: a goal's failure is recorded on the goal; waiters see
//! `DependencyFailed` when they step. With `keep_going` off, running
//! goals are cancelled as soon as any goal fails. Dependency cycles are
//! detected when blocker edges are added and abort scheduling with a
//! fatal error.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hermetia_store_core::derivation::Derivation;
use hermetia_store_core::store_path::StorePath;

use crate::build_result::BuildResult;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::goal::{
    DerivationGoal, GoalId, GoalKind, GoalLookup, GoalRequest, GoalState, PathValidityGoal,
    SlotPool, StepCx, StepOutcome, SubstitutionGoal, WorkerEvent,
};
use crate::store::{LocalStore, Store};
use crate::substituter::Substituter;

struct GoalSlot {
    state: GoalState,
    kind: Option<GoalKind>,
    /// Goals this one awaits.
    blockers: HashSet<GoalId>,
    /// Goals whose resumption depends on this one.
    waiters: Vec<GoalId>,
    /// Result delivered by an offloaded task, consumed by the next step.
    mailbox: Option<BuildResult>,
    holds_slot: Option<SlotPool>,
    cancel: CancellationToken,
    enqueued: bool,
}

struct SlotPoolState {
    free: usize,
    waiters: VecDeque<GoalId>,
}

/// The scheduler and goal owner.
pub struct Worker {
    store: Arc<LocalStore>,
    config: Arc<EngineConfig>,
    substituters: Vec<Arc<dyn Substituter>>,
    goals: Vec<GoalSlot>,
    lookup: GoalLookup,
    ready: VecDeque<GoalId>,
    local_slots: SlotPoolState,
    remote_slots: SlotPoolState,
    user_waiters: VecDeque<GoalId>,
    running_tasks: usize,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    cancel_root: CancellationToken,
}

impl Worker {
    pub fn new(
        store: Arc<LocalStore>,
        config: Arc<EngineConfig>,
        substituters: Vec<Arc<dyn Substituter>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let remote_capacity = config.remote_builders.iter().map(|b| b.slots).sum();
        Worker {
            store,
            config: Arc::clone(&config),
            substituters,
            goals: Vec::new(),
            lookup: GoalLookup::new(),
            ready: VecDeque::new(),
            local_slots: SlotPoolState {
                free: config.max_build_jobs,
                waiters: VecDeque::new(),
            },
            remote_slots: SlotPoolState {
                free: remote_capacity,
                waiters: VecDeque::new(),
            },
            user_waiters: VecDeque::new(),
            running_tasks: 0,
            events_tx,
            events_rx,
            cancel_root: CancellationToken::new(),
        }
    }

    /// Request that a derivation's outputs be realised. Returns the
    /// (possibly pre-existing) goal; an inline derivation takes
    /// precedence over loading the `.drv` file from the store.
    pub fn want_derivation(
        &mut self,
        drv_path: StorePath,
        drv: Option<Derivation>,
    ) -> Result<GoalId, EngineError> {
        if let Some(&id) = self.lookup.drv_goals.get(&drv_path) {
            return Ok(id);
        }
        if let Some(drv) = &drv {
            self.check_derivation_cycle(&drv_path, drv)?;
        }
        let goal = DerivationGoal::new(drv_path.clone(), drv);
        let id = self.add_goal(GoalKind::Derivation(goal));
        self.lookup.drv_goals.insert(drv_path, id);
        Ok(id)
    }

    /// Request that a store path become valid.
    pub fn want_path(&mut self, path: StorePath) -> GoalId {
        if let Some(&id) = self.lookup.path_goals.get(&path) {
            return id;
        }
        let id = self.add_goal(GoalKind::PathValidity(PathValidityGoal::new(path.clone())));
        self.lookup.path_goals.insert(path, id);
        id
    }

    /// The recorded exit value of a finished goal.
    pub fn result(&self, id: GoalId) -> Option<&BuildResult> {
        self.lookup.results.get(&id)
    }

    /// Drive the goal graph until every requested goal is done.
    pub async fn run(&mut self, wanted: &[GoalId]) -> Result<(), EngineError> {
        loop {
            while let Some(id) = self.ready.pop_front() {
                self.goals[id].enqueued = false;
                if self.goals[id].state == GoalState::Done {
                    continue;
                }
                self.step_goal(id).await?;
            }

            if wanted
                .iter()
                .all(|&id| self.goals[id].state == GoalState::Done)
            {
                return Ok(());
            }

            if self.running_tasks == 0 {
                // No ready goals, nothing in flight: the graph is stuck.
                return Err(EngineError::configuration(
                    "scheduler stalled with unfinished goals",
                ));
            }

            let Some(event) = self.events_rx.recv().await else {
                return Err(EngineError::configuration("event channel closed"));
            };
            self.handle_event(event);
            while let Ok(event) = self.events_rx.try_recv() {
                self.handle_event(event);
            }
        }
    }

    /// Convenience: realise one derivation to completion.
    pub async fn realise(
        &mut self,
        drv_path: StorePath,
        drv: Option<Derivation>,
    ) -> Result<BuildResult, EngineError> {
        let id = self.want_derivation(drv_path, drv)?;
        self.run(&[id]).await?;
        Ok(self
            .result(id)
            .cloned()
            .expect("finished goal has a result"))
    }

    fn add_goal(&mut self, kind: GoalKind) -> GoalId {
        let id = self.goals.len();
        self.goals.push(GoalSlot {
            state: GoalState::Ready,
            kind: Some(kind),
            blockers: HashSet::new(),
            waiters: Vec::new(),
            mailbox: None,
            holds_slot: None,
            cancel: self.cancel_root.child_token(),
            enqueued: false,
        });
        self.enqueue(id);
        id
    }

    fn enqueue(&mut self, id: GoalId) {
        if self.goals[id].enqueued || self.goals[id].state == GoalState::Done {
            return;
        }
        self.goals[id].enqueued = true;
        // Substitutions outrank builds of the same target.
        let front = self.goals[id]
            .kind
            .as_ref()
            .is_some_and(|k| k.is_substitution());
        if front {
            self.ready.push_front(id);
        } else {
            self.ready.push_back(id);
        }
    }

    async fn step_goal(&mut self, id: GoalId) -> Result<(), EngineError> {
        let mut kind = self.goals[id]
            .kind
            .take()
            .expect("stepping a goal that is mid-step");
        let mailbox = self.goals[id].mailbox.take();
        self.goals[id].state = GoalState::Running;

        let mut cx = StepCx {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            substituters: &self.substituters,
            events: self.events_tx.clone(),
            goal_id: id,
            cancel: self.goals[id].cancel.clone(),
            lookup: &self.lookup,
            mailbox,
            running_tasks: self.running_tasks,
        };
        let outcome = kind.step(&mut cx).await;
        drop(cx);
        self.goals[id].kind = Some(kind);

        match outcome {
            StepOutcome::Done(result) => self.finish_goal(id, result),
            StepOutcome::Await(requests) => {
                let blockers = self.resolve_requests(&requests)?;
                let mut open = 0;
                for blocker in blockers {
                    if self.goals[blocker].state != GoalState::Done {
                        self.add_blocker_edge(id, blocker)?;
                        open += 1;
                    }
                }
                if open == 0 {
                    self.goals[id].state = GoalState::Ready;
                    self.enqueue(id);
                } else {
                    self.goals[id].state = GoalState::Waiting;
                }
                Ok(())
            }
            StepOutcome::AwaitSlot(pool) => {
                let state = self.pool_mut(pool);
                if state.free > 0 {
                    state.free -= 1;
                    self.goals[id].holds_slot = Some(pool);
                    self.goals[id].state = GoalState::Ready;
                    self.enqueue(id);
                } else {
                    state.waiters.push_back(id);
                    self.goals[id].state = GoalState::Waiting;
                }
                Ok(())
            }
            StepOutcome::AwaitUserLock => {
                self.user_waiters.push_back(id);
                self.goals[id].state = GoalState::Waiting;
                Ok(())
            }
            StepOutcome::AwaitTask => {
                self.running_tasks += 1;
                self.goals[id].state = GoalState::Waiting;
                Ok(())
            }
            StepOutcome::Yield => {
                self.goals[id].state = GoalState::Ready;
                self.enqueue(id);
                Ok(())
            }
        }
    }

    fn resolve_requests(&mut self, requests: &[GoalRequest]) -> Result<Vec<GoalId>, EngineError> {
        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            let id = match request {
                GoalRequest::Derivation(path) => self.want_derivation(path.clone(), None)?,
                GoalRequest::Substitution(path) => {
                    if let Some(&id) = self.lookup.subst_goals.get(path) {
                        id
                    } else {
                        let id = self
                            .add_goal(GoalKind::Substitution(SubstitutionGoal::new(path.clone())));
                        self.lookup.subst_goals.insert(path.clone(), id);
                        id
                    }
                }
                GoalRequest::PathValidity(path) => self.want_path(path.clone()),
            };
            ids.push(id);
        }
        Ok(ids)
    }

    /// Subscribe `waiter` to `blocker`, refusing edges that would close a
    /// cycle in the blocker graph.
    fn add_blocker_edge(&mut self, waiter: GoalId, blocker: GoalId) -> Result<(), EngineError> {
        if self.reaches(blocker, waiter) {
            let path = match self.goals[waiter].kind.as_ref() {
                Some(GoalKind::Derivation(g)) => g.drv_path().clone(),
                _ => StorePath::from_base_path("00000000000000000000000000000000-cycle")
                    .expect("static path"),
            };
            return Err(EngineError::DependencyCycle(path));
        }
        self.goals[waiter].blockers.insert(blocker);
        self.goals[blocker].waiters.push(waiter);
        Ok(())
    }

    /// Whether `from` transitively awaits `to` in the blocker graph.
    fn reaches(&self, from: GoalId, to: GoalId) -> bool {
        if from == to {
            return true;
        }
        let mut seen = HashSet::new();
        let mut queue = vec![from];
        while let Some(current) = queue.pop() {
            if !seen.insert(current) {
                continue;
            }
            for &blocker in &self.goals[current].blockers {
                if blocker == to {
                    return true;
                }
                queue.push(blocker);
            }
        }
        false
    }

    /// Reject derivations whose static input graph loops back to
    /// themselves before any goal is created for them.
    fn check_derivation_cycle(
        &self,
        drv_path: &StorePath,
        drv: &Derivation,
    ) -> Result<(), EngineError> {
        let store_dir = self.store.store_dir();
        let mut seen = HashSet::new();
        let mut queue: Vec<StorePath> = drv.input_drvs.keys().cloned().collect();
        while let Some(current) = queue.pop() {
            if current == *drv_path {
                return Err(EngineError::DependencyCycle(drv_path.clone()));
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            let real = store_dir.full_path(&current);
            let Ok(text) = std::fs::read_to_string(&real) else {
                continue;
            };
            let Some(name) = current.name().as_str().strip_suffix(".drv") else {
                continue;
            };
            if let Ok(input) = hermetia_store_core::derivation::aterm::parse(store_dir, &text, name)
            {
                queue.extend(input.input_drvs.keys().cloned());
            }
        }
        Ok(())
    }

    /// Record a goal's exit value, wake waiters, release resources, and
    /// apply the failure policy.
    fn finish_goal(&mut self, id: GoalId, result: BuildResult) -> Result<(), EngineError> {
        let failed = !result.is_success();
        self.goals[id].state = GoalState::Done;
        self.lookup.results.insert(id, result);

        if let Some(pool) = self.goals[id].holds_slot.take() {
            self.release_slot(pool);
        }

        let waiters = std::mem::take(&mut self.goals[id].waiters);
        for waiter in waiters {
            self.goals[waiter].blockers.remove(&id);
            if self.goals[waiter].blockers.is_empty()
                && self.goals[waiter].state == GoalState::Waiting
            {
                self.goals[waiter].state = GoalState::Ready;
                self.enqueue(waiter);
            }
        }

        if failed && !self.config.keep_going {
            // Cancel everything still running; not-yet-started goals will
            // observe the failed dependency when they step.
            self.cancel_root.cancel();
        }
        Ok(())
    }

    fn pool_mut(&mut self, pool: SlotPool) -> &mut SlotPoolState {
        match pool {
            SlotPool::Local => &mut self.local_slots,
            SlotPool::Remote => &mut self.remote_slots,
        }
    }

    fn release_slot(&mut self, pool: SlotPool) {
        let state = self.pool_mut(pool);
        if let Some(waiter) = state.waiters.pop_front() {
            // Hand the slot straight to the next waiter, FIFO.
            self.goals[waiter].holds_slot = Some(pool);
            self.goals[waiter].state = GoalState::Ready;
            self.enqueue(waiter);
        } else {
            self.pool_mut(pool).free += 1;
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::TaskFinished { goal, result } => {
                self.running_tasks = self.running_tasks.saturating_sub(1);
                self.goals[goal].mailbox = Some(result);
                if self.goals[goal].state != GoalState::Done {
                    self.goals[goal].state = GoalState::Ready;
                    self.enqueue(goal);
                }
                // A finished build may have released a user lock.
                while let Some(waiter) = self.user_waiters.pop_front() {
                    if self.goals[waiter].state != GoalState::Done {
                        self.goals[waiter].state = GoalState::Ready;
                        self.enqueue(waiter);
                    }
                }
            }
        }
    }
}

/// Summarise a set of results into a process exit code: 0 on success,
/// 100 for build failures, 101 when only dependency failures remain.
pub fn exit_code_for(results: &BTreeMap<StorePath, BuildResult>) -> i32 {
    use crate::build_result::BuildStatus;

    let mut worst = 0;
    for result in results.values() {
        if result.is_success() {
            continue;
        }
        let code = match result.status {
            BuildStatus::DependencyFailed => 101,
            _ => 100,
        };
        if worst == 0 || code < worst {
            worst = code;
        }
    }
    worst
}
