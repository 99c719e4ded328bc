// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Goals: cooperative tasks driven by the scheduler.
//!
//! A goal exposes a single `step` entry point returning a tagged
//! [`StepOutcome`]; the scheduler trampolines ready goals, subscribes
//! waiters to blockers, and owns every goal in an arena keyed by
//! [`GoalId`] (goals refer to each other by target, never by owning
//! reference). Long-running work (builds, substituter downloads) is
//! spawned onto the runtime and posts a [`WorkerEvent`] back to the loop.
//!
//! Three goal kinds:
//! - [`DerivationGoal`]: realise the outputs of one derivation;
//! - [`SubstitutionGoal`]: fetch one store path from a substituter;
//! - [`PathValidityGoal`]: make one store path valid by any means.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hermetia_store_core::derivation::{Derivation, OutputName, aterm};
use hermetia_store_core::placeholder::Placeholder;
use hermetia_store_core::store_path::StorePath;

use crate::build_result::{BuildResult, BuildStatus, Realisation};
use crate::builder::{self, BuildContext};
use crate::config::EngineConfig;
use crate::error::BuildError;
use crate::store::{LocalStore, Store};
use crate::substituter::{self, Substituter};
use crate::user_lock::{self, UserLock};

pub type GoalId = usize;

/// Observable goal lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalState {
    Waiting,
    Ready,
    Running,
    Done,
}

/// Which slot pool a goal is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPool {
    Local,
    Remote,
}

/// A request for a child goal, deduplicated by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GoalRequest {
    Derivation(StorePath),
    Substitution(StorePath),
    PathValidity(StorePath),
}

/// What a goal's `step` tells the scheduler to do next.
pub enum StepOutcome {
    /// The goal finished; waiters are woken exactly once.
    Done(BuildResult),
    /// Block on child goals (created and deduplicated by the scheduler).
    Await(Vec<GoalRequest>),
    /// Block until a build slot in the pool is granted.
    AwaitSlot(SlotPool),
    /// Block until some user lock is released, then retry.
    AwaitUserLock,
    /// Offloaded work is in flight; a [`WorkerEvent`] will wake us.
    AwaitTask,
    /// Re-enqueue at the tail of the ready queue.
    Yield,
}

/// Events posted back to the scheduler loop by offloaded tasks.
#[derive(Debug)]
pub enum WorkerEvent {
    TaskFinished { goal: GoalId, result: BuildResult },
}

/// Read-only view of sibling goals, for result lookups by target.
pub struct GoalLookup {
    pub drv_goals: HashMap<StorePath, GoalId>,
    pub subst_goals: HashMap<StorePath, GoalId>,
    pub path_goals: HashMap<StorePath, GoalId>,
    pub results: HashMap<GoalId, BuildResult>,
}

impl GoalLookup {
    pub fn new() -> Self {
        GoalLookup {
            drv_goals: HashMap::new(),
            subst_goals: HashMap::new(),
            path_goals: HashMap::new(),
            results: HashMap::new(),
        }
    }

    fn result_for(&self, request: &GoalRequest) -> Option<&BuildResult> {
        let id = match request {
            GoalRequest::Derivation(p) => self.drv_goals.get(p),
            GoalRequest::Substitution(p) => self.subst_goals.get(p),
            GoalRequest::PathValidity(p) => self.path_goals.get(p),
        }?;
        self.results.get(id)
    }
}

impl Default for GoalLookup {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a goal may touch during one `step`. Goals never reach the
/// scheduler's own state; mutations go through the returned outcome.
pub struct StepCx<'a> {
    pub store: Arc<LocalStore>,
    pub config: Arc<EngineConfig>,
    pub substituters: &'a [Arc<dyn Substituter>],
    pub events: mpsc::UnboundedSender<WorkerEvent>,
    pub goal_id: GoalId,
    pub cancel: CancellationToken,
    pub lookup: &'a GoalLookup,
    /// Result delivered by a finished offloaded task, if any.
    pub mailbox: Option<BuildResult>,
    /// Builds currently running; used to detect a drained user pool.
    pub running_tasks: usize,
}

/// The goal variants held in the scheduler arena.
pub enum GoalKind {
    Derivation(DerivationGoal),
    Substitution(SubstitutionGoal),
    PathValidity(PathValidityGoal),
}

impl GoalKind {
    pub async fn step(&mut self, cx: &mut StepCx<'_>) -> StepOutcome {
        match self {
            GoalKind::Derivation(g) => g.step(cx).await,
            GoalKind::Substitution(g) => g.step(cx).await,
            GoalKind::PathValidity(g) => g.step(cx).await,
        }
    }

    pub fn is_substitution(&self) -> bool {
        matches!(self, GoalKind::Substitution(_))
    }
}

// ---------------------------------------------------------------------------
// Derivation goal
// ---------------------------------------------------------------------------

enum DrvState {
    Init,
    Substituting,
    WaitingForInputs,
    AcquireSlot(SlotPool),
    AcquireUser(SlotPool),
    Building,
}

pub struct DerivationGoal {
    drv_path: StorePath,
    drv: Option<Derivation>,
    state: DrvState,
    tried_substitution: bool,
    input_requests: Vec<GoalRequest>,
}

impl DerivationGoal {
    pub fn new(drv_path: StorePath, drv: Option<Derivation>) -> Self {
        DerivationGoal {
            drv_path,
            drv,
            state: DrvState::Init,
            tried_substitution: false,
            input_requests: Vec::new(),
        }
    }

    pub fn drv_path(&self) -> &StorePath {
        &self.drv_path
    }

    async fn step(&mut self, cx: &mut StepCx<'_>) -> StepOutcome {
        loop {
            match &self.state {
                DrvState::Init => {
                    if self.drv.is_none() {
                        match self.load_derivation(cx).await {
                            Ok(drv) => self.drv = Some(drv),
                            Err(e) => return StepOutcome::Done(BuildResult::failure(e)),
                        }
                    }

                    let missing = match self.missing_outputs(cx).await {
                        Ok(missing) => missing,
                        Err(e) => return StepOutcome::Done(BuildResult::failure(e)),
                    };
                    if missing.is_empty() {
                        return StepOutcome::Done(
                            self.all_valid_result(cx, BuildStatus::AlreadyValid),
                        );
                    }

                    let drv = self.drv.as_ref().expect("derivation loaded above");
                    let substitutable = !self.tried_substitution
                        && drv.options.allow_substitutes
                        && !cx.substituters.is_empty()
                        && missing.iter().all(|(_, path)| path.is_some());
                    if substitutable {
                        self.tried_substitution = true;
                        self.state = DrvState::Substituting;
                        return StepOutcome::Await(
                            missing
                                .into_iter()
                                .filter_map(|(_, path)| path)
                                .map(GoalRequest::Substitution)
                                .collect(),
                        );
                    }

                    self.enter_inputs_phase();
                    if self.input_requests.is_empty() {
                        continue;
                    }
                    return StepOutcome::Await(self.input_requests.clone());
                }

                DrvState::Substituting => {
                    // Substitution failures are non-fatal; just re-check.
                    let missing = match self.missing_outputs(cx).await {
                        Ok(missing) => missing,
                        Err(e) => return StepOutcome::Done(BuildResult::failure(e)),
                    };
                    if missing.is_empty() {
                        return StepOutcome::Done(
                            self.all_valid_result(cx, BuildStatus::Substituted),
                        );
                    }
                    tracing::debug!(
                        "substitution incomplete for {}, falling back to build",
                        self.drv_path
                    );
                    self.enter_inputs_phase();
                    if self.input_requests.is_empty() {
                        self.state = DrvState::WaitingForInputs;
                        continue;
                    }
                    return StepOutcome::Await(self.input_requests.clone());
                }

                DrvState::WaitingForInputs => {
                    for request in &self.input_requests {
                        let Some(result) = cx.lookup.result_for(request) else {
                            return StepOutcome::Done(BuildResult::failure(BuildError::Misc(
                                "input goal finished without a recorded result".into(),
                            )));
                        };
                        if !result.is_success() {
                            let what = match request {
                                GoalRequest::Derivation(p)
                                | GoalRequest::Substitution(p)
                                | GoalRequest::PathValidity(p) => p.to_string(),
                            };
                            return StepOutcome::Done(BuildResult::failure(
                                BuildError::DependencyFailed(what),
                            ));
                        }
                    }

                    let pool = match self.choose_pool(cx) {
                        Ok(pool) => pool,
                        Err(e) => return StepOutcome::Done(BuildResult::failure(e)),
                    };
                    self.state = DrvState::AcquireSlot(pool);
                    return StepOutcome::AwaitSlot(pool);
                }

                DrvState::AcquireSlot(pool) => {
                    // Being stepped here means the slot was granted.
                    self.state = DrvState::AcquireUser(*pool);
                    continue;
                }

                DrvState::AcquireUser(pool) => {
                    let pool = *pool;
                    match self.acquire_build_user(cx) {
                        Ok(lock) => {
                            if let Err(e) = self.start_build(cx, pool, lock) {
                                return StepOutcome::Done(BuildResult::failure(e));
                            }
                            self.state = DrvState::Building;
                            return StepOutcome::AwaitTask;
                        }
                        Err(UserAcquireOutcome::Blocked) => {
                            if cx.running_tasks == 0 {
                                return StepOutcome::Done(BuildResult::failure(BuildError::Misc(
                                    "all build users are busy and no build is running".into(),
                                )));
                            }
                            return StepOutcome::AwaitUserLock;
                        }
                        Err(UserAcquireOutcome::Failed(e)) => {
                            return StepOutcome::Done(BuildResult::failure(e));
                        }
                    }
                }

                DrvState::Building => {
                    let Some(result) = cx.mailbox.take() else {
                        return StepOutcome::Yield;
                    };
                    return StepOutcome::Done(result);
                }
            }
        }
    }

    async fn load_derivation(&self, cx: &StepCx<'_>) -> Result<Derivation, BuildError> {
        let store_dir = cx.store.store_dir();
        let real = store_dir.full_path(&self.drv_path);
        let text = tokio::fs::read_to_string(&real).await.map_err(|e| {
            BuildError::InvalidInput(format!(
                "cannot read derivation '{}': {e}",
                real.display()
            ))
        })?;
        let name = self
            .drv_path
            .name()
            .as_str()
            .strip_suffix(".drv")
            .ok_or_else(|| {
                BuildError::InvalidInput(format!("'{}' is not a derivation path", self.drv_path))
            })?;
        aterm::parse(store_dir, &text, name)
            .map_err(|e| BuildError::InvalidInput(format!("malformed derivation: {e}")))
    }

    /// Outputs that still need realising, paired with their final path
    /// when that is known up front. Floating outputs are always missing.
    async fn missing_outputs(
        &self,
        cx: &StepCx<'_>,
    ) -> Result<Vec<(OutputName, Option<StorePath>)>, BuildError> {
        let drv = self.drv.as_ref().expect("derivation loaded");
        let mut missing = Vec::new();
        for (name, output) in &drv.outputs {
            match output
                .path(cx.store.store_dir(), &drv.name, name)
                .map_err(|e| BuildError::InvalidInput(e.to_string()))?
            {
                Some(path) => {
                    let valid = cx
                        .store
                        .is_valid_path(&path)
                        .await
                        .map_err(|e| BuildError::Misc(e.to_string()))?;
                    if !valid {
                        missing.push((name.clone(), Some(path)));
                    }
                }
                None => missing.push((name.clone(), None)),
            }
        }
        Ok(missing)
    }

    fn all_valid_result(&self, cx: &StepCx<'_>, status: BuildStatus) -> BuildResult {
        let drv = self.drv.as_ref().expect("derivation loaded");
        let mut outputs = BTreeMap::new();
        for (name, output) in &drv.outputs {
            if let Ok(Some(path)) = output.path(cx.store.store_dir(), &drv.name, name) {
                outputs.insert(name.clone(), Realisation::unsigned(path));
            }
        }
        BuildResult::success(status, outputs)
    }

    fn enter_inputs_phase(&mut self) {
        let drv = self.drv.as_ref().expect("derivation loaded");
        let mut requests = Vec::new();
        for drv_path in drv.input_drvs.keys() {
            requests.push(GoalRequest::Derivation(drv_path.clone()));
        }
        for src in &drv.input_srcs {
            requests.push(GoalRequest::PathValidity(src.clone()));
        }
        self.input_requests = requests;
        self.state = DrvState::WaitingForInputs;
    }

    fn choose_pool(&self, cx: &StepCx<'_>) -> Result<SlotPool, BuildError> {
        let drv = self.drv.as_ref().expect("derivation loaded");
        let local_ok = drv.platform == EngineConfig::local_platform()
            && cx.config.max_build_jobs > 0;
        let remote_ok = cx
            .config
            .remote_builders
            .iter()
            .any(|b| b.platforms.iter().any(|p| p == &drv.platform));

        if local_ok && (drv.options.prefer_local_build || !remote_ok) {
            return Ok(SlotPool::Local);
        }
        if remote_ok {
            return Ok(SlotPool::Remote);
        }
        if local_ok {
            return Ok(SlotPool::Local);
        }
        Err(BuildError::Misc(format!(
            "a machine able to build for '{}' is required, and none is configured",
            drv.platform
        )))
    }

    fn acquire_build_user(
        &self,
        cx: &StepCx<'_>,
    ) -> Result<Option<UserLock>, UserAcquireOutcome> {
        let Some(group) = &cx.config.build_users_group else {
            return Ok(None);
        };
        let members = resolve_group_members(group).map_err(UserAcquireOutcome::Failed)?;
        match user_lock::acquire_user_lock(&cx.config.pool_dir, &members) {
            Ok(Some(lock)) => Ok(Some(lock)),
            Ok(None) => Err(UserAcquireOutcome::Blocked),
            Err(e) => Err(UserAcquireOutcome::Failed(BuildError::Misc(format!(
                "acquiring build user: {e}"
            )))),
        }
    }

    /// Spawn the build task; its result comes back as a `WorkerEvent`.
    fn start_build(
        &self,
        cx: &mut StepCx<'_>,
        pool: SlotPool,
        user_lock: Option<UserLock>,
    ) -> Result<(), BuildError> {
        let drv = self.drv.clone().expect("derivation loaded");

        // Concrete inputs: sources plus the realised outputs of each
        // input derivation, with placeholder rewrites for upstream
        // content-addressed outputs.
        let mut input_paths: BTreeSet<StorePath> = drv.input_srcs.clone();
        let mut input_rewrites = BTreeMap::new();
        for (input_drv, wanted) in &drv.input_drvs {
            let result = cx
                .lookup
                .result_for(&GoalRequest::Derivation(input_drv.clone()))
                .ok_or_else(|| {
                    BuildError::Misc(format!("input '{input_drv}' has no recorded result"))
                })?;
            for output_name in wanted {
                let Some(realisation) = result.built_outputs.get(output_name) else {
                    return Err(BuildError::DependencyFailed(format!(
                        "input '{input_drv}' did not produce output '{output_name}'"
                    )));
                };
                input_paths.insert(realisation.out_path.clone());
                input_rewrites.insert(
                    Placeholder::ca_output(input_drv, output_name).render(),
                    cx.store.store_dir().display_path(&realisation.out_path),
                );
            }
        }

        if pool == SlotPool::Remote {
            return self.start_remote_build(cx, drv);
        }

        let context = BuildContext {
            store: Arc::clone(&cx.store),
            config: Arc::clone(&cx.config),
            drv_path: self.drv_path.clone(),
            drv,
            input_paths,
            input_rewrites,
            user_lock,
            cancel: cx.cancel.clone(),
        };
        let events = cx.events.clone();
        let goal_id = cx.goal_id;
        tokio::spawn(async move {
            let result = builder::run(context).await;
            let _ = events.send(WorkerEvent::TaskFinished {
                goal: goal_id,
                result,
            });
        });
        Ok(())
    }

    /// Dispatch the build to a remote worker over the serve protocol.
    /// The builder's `url` is the command that provides the stream
    /// (typically `ssh <host> ... --serve --write`).
    fn start_remote_build(&self, cx: &mut StepCx<'_>, drv: Derivation) -> Result<(), BuildError> {
        let builder_config = cx
            .config
            .remote_builders
            .iter()
            .find(|b| b.platforms.iter().any(|p| p == &drv.platform))
            .cloned()
            .ok_or_else(|| {
                BuildError::Misc(format!("no remote builder for platform '{}'", drv.platform))
            })?;

        let store_dir = cx.store.store_dir().clone();
        let drv_path = self.drv_path.clone();
        let drv_text = drv
            .canonical_text(&store_dir)
            .map_err(|e| BuildError::InvalidInput(e.to_string()))?;
        let options = crate::serve_protocol::WireBuildOptions {
            max_silent_time: drv.options.max_silent_time.or(cx.config.max_silent_time),
            build_timeout: drv.options.build_timeout.or(cx.config.build_timeout),
            max_log_size: cx.config.max_log_size,
            nr_repeats: cx.config.nr_repeats,
            keep_failed: cx.config.keep_failed,
        };

        let events = cx.events.clone();
        let goal_id = cx.goal_id;
        tokio::spawn(async move {
            let result = remote_build(&builder_config.url, &store_dir, &drv_path, &drv_text, &options)
                .await
                .unwrap_or_else(|e| {
                    BuildResult::failure(BuildError::Misc(format!(
                        "remote build on '{}' failed: {e}",
                        builder_config.url
                    )))
                });
            let _ = events.send(WorkerEvent::TaskFinished {
                goal: goal_id,
                result,
            });
        });
        Ok(())
    }
}

/// Run one build on a remote worker: spawn the transport command and
/// speak the serve protocol over its stdio.
async fn remote_build(
    url: &str,
    store_dir: &hermetia_store_core::store_path::StoreDir,
    drv_path: &StorePath,
    drv_text: &str,
    options: &crate::serve_protocol::WireBuildOptions,
) -> Result<BuildResult, crate::serve_protocol::ProtocolError> {
    use crate::serve_protocol;
    use std::process::Stdio;

    let mut parts = url.split_whitespace();
    let program = parts.next().ok_or_else(|| {
        serve_protocol::ProtocolError::Malformed("empty remote builder command".into())
    })?;
    let mut child = tokio::process::Command::new(program)
        .args(parts)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;

    let mut writer = child.stdin.take().expect("stdin is piped");
    let mut reader = child.stdout.take().expect("stdout is piped");

    let version = serve_protocol::handshake_client(&mut reader, &mut writer).await?;
    let result = serve_protocol::build_derivation(
        &mut reader,
        &mut writer,
        version,
        store_dir,
        drv_path,
        drv_text,
        options,
    )
    .await?;

    drop(writer);
    let _ = child.wait().await;
    Ok(result)
}

enum UserAcquireOutcome {
    Blocked,
    Failed(BuildError),
}

fn resolve_group_members(group_name: &str) -> Result<Vec<(u32, u32)>, BuildError> {
    let group = nix::unistd::Group::from_name(group_name)
        .map_err(|e| BuildError::Misc(format!("looking up group '{group_name}': {e}")))?
        .ok_or_else(|| {
            BuildError::Misc(format!("build users group '{group_name}' does not exist"))
        })?;
    let gid = group.gid.as_raw();
    let mut members = Vec::new();
    for name in &group.mem {
        let user = nix::unistd::User::from_name(name)
            .map_err(|e| BuildError::Misc(format!("looking up user '{name}': {e}")))?
            .ok_or_else(|| BuildError::Misc(format!("build user '{name}' does not exist")))?;
        members.push((user.uid.as_raw(), gid));
    }
    if members.is_empty() {
        return Err(BuildError::Misc(format!(
            "build users group '{group_name}' has no members"
        )));
    }
    Ok(members)
}

// ---------------------------------------------------------------------------
// Substitution goal
// ---------------------------------------------------------------------------

enum SubstState {
    Init,
    Fetching,
}

pub struct SubstitutionGoal {
    path: StorePath,
    state: SubstState,
}

impl SubstitutionGoal {
    pub fn new(path: StorePath) -> Self {
        SubstitutionGoal {
            path,
            state: SubstState::Init,
        }
    }

    async fn step(&mut self, cx: &mut StepCx<'_>) -> StepOutcome {
        match self.state {
            SubstState::Init => {
                match cx.store.is_valid_path(&self.path).await {
                    Ok(true) => {
                        return StepOutcome::Done(BuildResult::success(
                            BuildStatus::AlreadyValid,
                            BTreeMap::new(),
                        ));
                    }
                    Ok(false) => {}
                    Err(e) => {
                        return StepOutcome::Done(BuildResult::failure(BuildError::Misc(
                            e.to_string(),
                        )));
                    }
                }
                if cx.substituters.is_empty() {
                    return StepOutcome::Done(BuildResult::failure(
                        BuildError::SubstituterUnavailable("no substituters configured".into()),
                    ));
                }

                let store = Arc::clone(&cx.store);
                let config = Arc::clone(&cx.config);
                let substituters: Vec<Arc<dyn Substituter>> = cx.substituters.to_vec();
                let path = self.path.clone();
                let events = cx.events.clone();
                let goal_id = cx.goal_id;
                let cancel = cx.cancel.clone();
                tokio::spawn(async move {
                    let result =
                        substituter::substitute_path(store, config, substituters, path, cancel)
                            .await;
                    let _ = events.send(WorkerEvent::TaskFinished {
                        goal: goal_id,
                        result,
                    });
                });
                self.state = SubstState::Fetching;
                StepOutcome::AwaitTask
            }
            SubstState::Fetching => match cx.mailbox.take() {
                Some(result) => StepOutcome::Done(result),
                None => StepOutcome::Yield,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Path validity goal
// ---------------------------------------------------------------------------

enum PathState {
    Init,
    Substituting,
}

pub struct PathValidityGoal {
    path: StorePath,
    state: PathState,
}

impl PathValidityGoal {
    pub fn new(path: StorePath) -> Self {
        PathValidityGoal {
            path,
            state: PathState::Init,
        }
    }

    async fn step(&mut self, cx: &mut StepCx<'_>) -> StepOutcome {
        match self.state {
            PathState::Init => {
                match cx.store.is_valid_path(&self.path).await {
                    Ok(true) => {
                        return StepOutcome::Done(BuildResult::success(
                            BuildStatus::AlreadyValid,
                            BTreeMap::new(),
                        ));
                    }
                    Ok(false) => {}
                    Err(e) => {
                        return StepOutcome::Done(BuildResult::failure(BuildError::Misc(
                            e.to_string(),
                        )));
                    }
                }
                self.state = PathState::Substituting;
                StepOutcome::Await(vec![GoalRequest::Substitution(self.path.clone())])
            }
            PathState::Substituting => {
                match cx.store.is_valid_path(&self.path).await {
                    Ok(true) => StepOutcome::Done(BuildResult::success(
                        BuildStatus::Substituted,
                        BTreeMap::new(),
                    )),
                    Ok(false) => StepOutcome::Done(BuildResult::failure(
                        BuildError::InvalidInput(format!(
                            "path '{}' is not valid and cannot be substituted",
                            self.path
                        )),
                    )),
                    Err(e) => StepOutcome::Done(BuildResult::failure(BuildError::Misc(
                        e.to_string(),
                    ))),
                }
            }
        }
    }
}
