// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! The derivation builder: drives one derivation from prepared inputs to
//! registered outputs.
//!
//! ```text
//! PrepareScratch → MaterialiseEnv → SpawnChild → Supervise → Ingest → Register
//! ```
//!
//! Scratch paths: an input-addressed output is built at its final path
//! when that path is free, otherwise at a fallback path derived by XORing
//! the digest with a per-build nonce. Floating content-addressed outputs
//! build at a random path of the correct shape and are renamed once their
//! content hash (and thus their final path) is known.
//!
//! Rewrite maps: `input_rewrites` substitutes placeholders with scratch
//! paths when materialising env and args; `output_rewrites` substitutes
//! scratch digests with final digests when ingesting outputs. Both are
//! applied only to artifacts the builder produced in its scratch
//! locations.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::AsyncBufReadExt as _;
use tokio_util::sync::CancellationToken;

use hermetia_store_core::content_address::{
    ContentAddress, ContentAddressMethodAlgorithm, FileIngestionMethod,
};
use hermetia_store_core::derivation::{Derivation, DerivationOutput, OutputName, SandboxMode};
use hermetia_store_core::hash::{Algorithm, Hash};
use hermetia_store_core::placeholder::Placeholder;
use hermetia_store_core::store_path::{
    STORE_PATH_DIGEST_BYTES, StorePath, StorePathDigest, StoreReferences,
};

use crate::build_result::{BuildResult, BuildStatus, Realisation};
use crate::canonicalize;
use crate::config::{EngineConfig, SandboxPolicy};
use crate::error::{BuildError, ExitReason};
use crate::pathlocks::PathLock;
use crate::rewrite::{self, DigestRewriter};
use crate::sandbox::{NoSandbox, Sandbox, SandboxChild, SandboxMount, SandboxSpec};
use crate::store::{LocalStore, PathInfo, Store, StoreError, digest_bytes, remove_path_all};
use crate::user_lock::UserLock;

/// Everything the scheduler hands to one build attempt.
pub struct BuildContext {
    pub store: Arc<LocalStore>,
    pub config: Arc<EngineConfig>,
    pub drv_path: StorePath,
    pub drv: Derivation,
    /// Concrete input paths: sources plus realised outputs of input
    /// derivations. The builder extends this to the full closure.
    pub input_paths: BTreeSet<StorePath>,
    /// Placeholder rewrites for upstream content-addressed outputs,
    /// resolved by the scheduler from realisations.
    pub input_rewrites: BTreeMap<String, String>,
    pub user_lock: Option<UserLock>,
    pub cancel: CancellationToken,
}

/// Run the build, including determinism re-runs. Never panics the goal:
/// every failure is folded into a [`BuildResult`].
pub async fn run(ctx: BuildContext) -> BuildResult {
    let start_time = now_secs();
    let mut result = match build_once(&ctx, 0).await {
        Ok(outputs) => {
            let mut result = BuildResult::success(BuildStatus::Built, outputs);
            result.times_built = 1;
            result
        }
        Err(e) => {
            let mut result = BuildResult::failure(e);
            result.start_time = start_time;
            result.stop_time = now_secs();
            return result;
        }
    };

    for round in 1..=ctx.config.nr_repeats {
        match repeat_build(&ctx, round).await {
            Ok(true) => result.times_built += 1,
            Ok(false) => {
                result = BuildResult::failure(BuildError::NotDeterministic);
                result.times_built = round + 1;
                break;
            }
            Err(e) => {
                result = BuildResult::failure(e);
                break;
            }
        }
    }

    result.start_time = start_time;
    result.stop_time = now_secs();
    result
}

/// One full pass: prepare, spawn, supervise, ingest, register.
async fn build_once(
    ctx: &BuildContext,
    round: u32,
) -> Result<BTreeMap<OutputName, Realisation>, BuildError> {
    let store = &ctx.store;
    let store_dir = store.store_dir().clone();

    // Inputs must all be present on disk before anything is spawned.
    let input_closure = compute_input_closure(ctx).await?;
    for input in &input_closure {
        if !store_dir.full_path(input).exists() {
            return Err(BuildError::InvalidInput(format!(
                "missing input store path '{input}'"
            )));
        }
    }

    let scratch = compute_scratch_outputs(ctx, round).await?;

    std::fs::create_dir_all(&ctx.config.build_dir)
        .map_err(|e| BuildError::Misc(format!("failed to create build dir root: {e}")))?;
    let build_tmp = tempfile::Builder::new()
        .prefix("hermetia-build-")
        .tempdir_in(&ctx.config.build_dir)
        .map_err(|e| {
            BuildError::Misc(format!(
                "failed to create build dir in {}: {e}",
                ctx.config.build_dir.display()
            ))
        })?;

    let isolation = select_isolation(ctx, build_tmp.path())?;
    let env = materialise_env(ctx, build_tmp.path(), &scratch)
        .map_err(|e| BuildError::Misc(format!("failed to set up environment: {e}")))?;

    // Make sure no stale file squats on a scratch location.
    for out in &scratch {
        let host = isolation.host_path(&store_dir.full_path(&out.scratch));
        if let Some(parent) = host.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        remove_path_all(&host);
    }

    let spec = SandboxSpec {
        builder: rewrite::rewrite_text(&ctx.drv.builder, &all_input_rewrites(ctx, &scratch)),
        args: ctx
            .drv
            .args
            .iter()
            .map(|a| rewrite::rewrite_text(a, &all_input_rewrites(ctx, &scratch)))
            .collect(),
        env,
        work_dir: build_tmp.path().to_path_buf(),
        mounts: sandbox_mounts(ctx, &input_closure),
        writable_paths: Vec::new(),
        allow_network: ctx.drv.is_fixed_output(),
        hostname: "localhost".to_string(),
        identity: ctx.user_lock.as_ref().map(|l| (l.uid(), l.gid())),
    };

    let supervision = spawn_and_supervise(ctx, &spec, &isolation).await;
    if let Err(e) = supervision {
        cleanup_scratch(ctx, &isolation, &scratch);
        cleanup_isolation(&isolation);
        return Err(e);
    }

    let outputs = ingest_outputs(ctx, &isolation, scratch, &input_closure).await;
    cleanup_isolation(&isolation);
    outputs
}

fn cleanup_isolation(isolation: &Isolation) {
    match isolation {
        Isolation::None => {}
        #[cfg(target_os = "linux")]
        Isolation::Chroot { root } => remove_path_all(root),
    }
}

/// Re-run the builder and compare produced NAR hashes against what the
/// first round registered. Returns whether the build reproduced.
async fn repeat_build(ctx: &BuildContext, round: u32) -> Result<bool, BuildError> {
    let store = &ctx.store;

    // Rebuild into fallback scratch paths, hash, compare, discard.
    let scratch = compute_scratch_outputs(ctx, round).await?;
    let input_closure = compute_input_closure(ctx).await?;

    let build_tmp = tempfile::Builder::new()
        .prefix("hermetia-check-")
        .tempdir_in(&ctx.config.build_dir)
        .map_err(|e| BuildError::Misc(format!("failed to create check dir: {e}")))?;
    let isolation = select_isolation(ctx, build_tmp.path())?;
    let env = materialise_env(ctx, build_tmp.path(), &scratch)
        .map_err(|e| BuildError::Misc(format!("failed to set up environment: {e}")))?;

    for out in &scratch {
        let host = isolation.host_path(&store.store_dir().full_path(&out.scratch));
        if let Some(parent) = host.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        remove_path_all(&host);
    }

    let spec = SandboxSpec {
        builder: rewrite::rewrite_text(&ctx.drv.builder, &all_input_rewrites(ctx, &scratch)),
        args: ctx
            .drv
            .args
            .iter()
            .map(|a| rewrite::rewrite_text(a, &all_input_rewrites(ctx, &scratch)))
            .collect(),
        env,
        work_dir: build_tmp.path().to_path_buf(),
        mounts: sandbox_mounts(ctx, &input_closure),
        writable_paths: Vec::new(),
        allow_network: ctx.drv.is_fixed_output(),
        hostname: "localhost".to_string(),
        identity: ctx.user_lock.as_ref().map(|l| (l.uid(), l.gid())),
    };

    spawn_and_supervise(ctx, &spec, &isolation).await?;

    let mut reproduced = true;
    for out in &scratch {
        let host = isolation.host_path(&store.store_dir().full_path(&out.scratch));
        if !host.exists() {
            reproduced = false;
            break;
        }
        canonicalize::canonicalize_path_metadata(&host)
            .await
            .map_err(|e| BuildError::Misc(format!("canonicalize: {e}")))?;
        // Normalise self-digests before comparing so path-embedded scratch
        // digests do not mask a bit-identical rebuild.
        let rewriter = scratch_to_final_rewriter(&scratch)?;
        apply_tree_rewrites(&host, rewriter).await?;

        let Some(registered) = out.registered_path.as_ref() else {
            // Floating outputs have no pre-known path to compare against.
            remove_path_all(&host);
            continue;
        };
        let expected = store
            .query_path_info(registered)
            .await
            .map_err(store_err)?
            .ok_or_else(|| BuildError::Misc(format!("output '{registered}' vanished")))?;

        let (nar_hash, _, _) = store
            .hash_and_scan(&host, &BTreeSet::new(), None)
            .await
            .map_err(store_err)?;
        if nar_hash != expected.nar_hash {
            tracing::warn!(
                "output {} of {} differs between rounds",
                out.name,
                ctx.drv_path
            );
            reproduced = false;
        }
        remove_path_all(&host);
    }

    Ok(reproduced)
}

// ---------------------------------------------------------------------------
// Scratch output planning
// ---------------------------------------------------------------------------

struct ScratchOutput {
    name: OutputName,
    output: DerivationOutput,
    /// Known before the build for input-addressed and fixed-CA outputs.
    final_path: Option<StorePath>,
    /// Where the builder writes.
    scratch: StorePath,
    /// Set once the first round has registered the output; used by
    /// determinism re-runs.
    registered_path: Option<StorePath>,
}

async fn compute_scratch_outputs(
    ctx: &BuildContext,
    round: u32,
) -> Result<Vec<ScratchOutput>, BuildError> {
    let store = &ctx.store;
    let nonce = build_nonce();
    let mut result = Vec::new();

    for (name, output) in &ctx.drv.outputs {
        let final_path = output
            .path(store.store_dir(), &ctx.drv.name, name)
            .map_err(|e| BuildError::InvalidInput(format!("output '{name}': {e}")))?;

        let scratch = match &final_path {
            Some(path) => {
                let valid = store.is_valid_path(path).await.map_err(store_err)?;
                if valid || round > 0 {
                    // The final location is occupied (or this is a
                    // determinism re-run): build at a fallback path.
                    fallback_path(path, &nonce)
                } else {
                    path.clone()
                }
            }
            None => {
                let path_name = ctx.drv.output_path_name(name);
                StorePath::new(random_digest(), path_name)
            }
        };

        result.push(ScratchOutput {
            name: name.clone(),
            output: output.clone(),
            registered_path: final_path.clone().filter(|_| round > 0),
            final_path,
            scratch,
        });
    }
    Ok(result)
}

/// Fallback path: same name, digest XORed with a per-build nonce, so a
/// rebuild can proceed while the canonical path stays untouched.
fn fallback_path(path: &StorePath, nonce: &[u8; STORE_PATH_DIGEST_BYTES]) -> StorePath {
    let mut bytes = *path.digest().as_bytes();
    for (b, n) in bytes.iter_mut().zip(nonce) {
        *b ^= n;
    }
    StorePath::new(StorePathDigest::new(bytes), path.name().clone())
}

fn build_nonce() -> [u8; STORE_PATH_DIGEST_BYTES] {
    let mut nonce = [0u8; STORE_PATH_DIGEST_BYTES];
    let _ = ring::rand::SecureRandom::fill(&ring::rand::SystemRandom::new(), &mut nonce);
    nonce
}

fn random_digest() -> StorePathDigest {
    let mut bytes = [0u8; STORE_PATH_DIGEST_BYTES];
    let _ = ring::rand::SecureRandom::fill(&ring::rand::SystemRandom::new(), &mut bytes);
    StorePathDigest::new(bytes)
}

async fn compute_input_closure(ctx: &BuildContext) -> Result<BTreeSet<StorePath>, BuildError> {
    let mut closure = BTreeSet::new();
    for input in &ctx.input_paths {
        closure.extend(
            ctx.store
                .compute_closure(input)
                .await
                .map_err(|e| BuildError::InvalidInput(e.to_string()))?,
        );
    }
    Ok(closure)
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

fn all_input_rewrites(ctx: &BuildContext, scratch: &[ScratchOutput]) -> BTreeMap<String, String> {
    let mut rewrites = ctx.input_rewrites.clone();
    for out in scratch {
        rewrites.insert(
            Placeholder::standard_output(&out.name).render(),
            ctx.store.store_dir().display_path(&out.scratch),
        );
    }
    rewrites
}

/// Build the environment map, matching the original `initEnv()` ordering:
/// overridable defaults, then derivation env (with placeholders rewritten
/// and `passAsFile` honoured), then the system vars the derivation cannot
/// override.
fn materialise_env(
    ctx: &BuildContext,
    build_dir: &Path,
    scratch: &[ScratchOutput],
) -> std::io::Result<BTreeMap<String, String>> {
    let store_dir = ctx.store.store_dir();
    let rewrites = all_input_rewrites(ctx, scratch);
    let build_dir_str = build_dir.to_string_lossy().to_string();
    let mut env = BTreeMap::new();

    // Phase 1: defaults the derivation may override.
    env.insert("PATH".into(), "/path-not-set".into());
    env.insert("HOME".into(), "/homeless-shelter".into());
    env.insert("NIX_STORE".into(), store_dir.as_str().to_string());
    env.insert("NIX_BUILD_CORES".into(), ctx.config.cores.to_string());

    if let Some(sa) = &ctx.drv.structured_attrs {
        // Structured mode: one JSON file, no individual env vars.
        let mut json = serde_json::Value::Object(sa.attrs.clone());
        let mut outputs_json = serde_json::Map::new();
        for out in scratch {
            outputs_json.insert(
                out.name.to_string(),
                serde_json::Value::String(store_dir.display_path(&out.scratch)),
            );
        }
        if let Some(object) = json.as_object_mut() {
            object.insert("outputs".into(), serde_json::Value::Object(outputs_json));
        }
        let text = rewrite::rewrite_text(&json.to_string(), &rewrites);
        let json_path = build_dir.join(".attrs.json");
        std::fs::write(&json_path, text)?;
        env.insert(
            "NIX_ATTRS_JSON_FILE".into(),
            json_path.to_string_lossy().to_string(),
        );
    } else {
        let pass_as_file = &ctx.drv.options.pass_as_file;
        for (key, value) in &ctx.drv.env {
            if key == "passAsFile" {
                continue;
            }
            let value = rewrite::rewrite_text(value, &rewrites);
            if pass_as_file.contains(key) {
                let name_hash = digest_bytes(Algorithm::Sha256, key.as_bytes());
                let file_name = format!(".attr-{}", name_hash.to_base32());
                let file_path = build_dir.join(&file_name);
                std::fs::write(&file_path, value)?;
                env.insert(
                    format!("{key}Path"),
                    file_path.to_string_lossy().to_string(),
                );
            } else {
                env.insert(key.clone(), value);
            }
        }
    }

    // Phase 3: system vars set after the derivation env win.
    env.insert("NIX_BUILD_TOP".into(), build_dir_str.clone());
    env.insert("TMPDIR".into(), build_dir_str.clone());
    env.insert("TEMPDIR".into(), build_dir_str.clone());
    env.insert("TMP".into(), build_dir_str.clone());
    env.insert("TEMP".into(), build_dir_str.clone());
    env.insert("PWD".into(), build_dir_str);

    let mut output_names = Vec::new();
    for out in scratch {
        env.insert(out.name.to_string(), store_dir.display_path(&out.scratch));
        output_names.push(out.name.to_string());
    }
    env.insert("outputs".into(), output_names.join(" "));

    if ctx.drv.is_fixed_output() {
        env.insert("NIX_OUTPUT_CHECKED".into(), "1".into());
        for var in &ctx.drv.options.impure_env_vars {
            if let Ok(value) = std::env::var(var) {
                env.insert(var.clone(), value);
            }
        }
    }

    env.insert("NIX_LOG_FD".into(), "2".into());
    env.insert("TERM".into(), "xterm-256color".into());

    Ok(env)
}

// ---------------------------------------------------------------------------
// Isolation selection
// ---------------------------------------------------------------------------

enum Isolation {
    None,
    #[cfg(target_os = "linux")]
    Chroot { root: PathBuf },
}

impl Isolation {
    /// Where a sandbox-visible path actually lives on the host.
    fn host_path(&self, path: &Path) -> PathBuf {
        match self {
            Isolation::None => path.to_path_buf(),
            #[cfg(target_os = "linux")]
            Isolation::Chroot { root } => {
                root.join(path.strip_prefix("/").unwrap_or(path))
            }
        }
    }
}

fn select_isolation(ctx: &BuildContext, build_tmp: &Path) -> Result<Isolation, BuildError> {
    let requested = ctx.drv.options.sandbox;
    let policy = ctx.config.sandbox;

    let enabled = match (policy, requested) {
        (SandboxPolicy::Disabled, _) => false,
        (SandboxPolicy::Enabled, SandboxMode::Disabled) => {
            return Err(BuildError::InvalidInput(
                "derivation disables the sandbox but the engine policy does not allow that"
                    .to_string(),
            ));
        }
        (SandboxPolicy::Enabled, _) => true,
        (SandboxPolicy::Relaxed, SandboxMode::Disabled) => false,
        (SandboxPolicy::Relaxed, _) => true,
    };

    if !enabled {
        return Ok(Isolation::None);
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Isolation::Chroot {
            root: build_tmp.with_extension("root"),
        })
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = build_tmp;
        // No namespace support: fall back to the plain child process.
        Ok(Isolation::None)
    }
}

fn sandbox_mounts(ctx: &BuildContext, input_closure: &BTreeSet<StorePath>) -> Vec<SandboxMount> {
    let store_dir = ctx.store.store_dir();
    let mut mounts = Vec::new();

    for input in input_closure {
        let path = store_dir.full_path(input);
        mounts.push(SandboxMount {
            source: path.clone(),
            target: path,
            read_only: true,
            optional: false,
        });
    }
    for path in &ctx.config.sandbox_paths {
        mounts.push(SandboxMount {
            source: path.clone(),
            target: path.clone(),
            read_only: true,
            optional: true,
        });
    }
    if ctx.config.sandbox == SandboxPolicy::Relaxed {
        for dep in &ctx.drv.options.impure_host_deps {
            mounts.push(SandboxMount {
                source: PathBuf::from(dep),
                target: PathBuf::from(dep),
                read_only: true,
                optional: true,
            });
        }
    }
    mounts
}

// ---------------------------------------------------------------------------
// Supervision
// ---------------------------------------------------------------------------

async fn spawn_and_supervise(
    ctx: &BuildContext,
    spec: &SandboxSpec,
    isolation: &Isolation,
) -> Result<(), BuildError> {
    let child = match isolation {
        Isolation::None => NoSandbox::new()
            .spawn(spec)
            .await
            .map_err(sandbox_err)?,
        #[cfg(target_os = "linux")]
        Isolation::Chroot { root } => crate::linux_sandbox::LinuxSandbox::new(root.clone())
            .spawn(spec)
            .await
            .map_err(sandbox_err)?,
    };

    let log_sink = open_build_log(ctx);
    supervise_child(ctx, child, log_sink).await
}

fn sandbox_err(e: crate::sandbox::SandboxError) -> BuildError {
    match e {
        crate::sandbox::SandboxError::Setup(msg) => BuildError::SandboxSetupFailed(msg),
        other => BuildError::Misc(other.to_string()),
    }
}

type LogSink = Arc<std::sync::Mutex<dyn std::io::Write + Send>>;

/// Open the persistent build log, `<log-dir>/drvs/<xx>/<rest>.bz2`.
fn open_build_log(ctx: &BuildContext) -> LogSink {
    let Some(log_dir) = &ctx.config.log_dir else {
        return Arc::new(std::sync::Mutex::new(std::io::sink()));
    };

    let base_name = ctx.drv_path.to_string();
    let (prefix, rest) = base_name.split_at(2);
    let dir = log_dir.join("drvs").join(prefix);
    let result = std::fs::create_dir_all(&dir)
        .and_then(|()| std::fs::File::create(dir.join(format!("{rest}.bz2"))));
    match result {
        Ok(file) => Arc::new(std::sync::Mutex::new(bzip2::write::BzEncoder::new(
            file,
            bzip2::Compression::default(),
        ))),
        Err(e) => {
            tracing::warn!("failed to open build log for {}: {e}", ctx.drv_path);
            Arc::new(std::sync::Mutex::new(std::io::sink()))
        }
    }
}

/// Drain the child's output into the log sink while enforcing the
/// wall-clock timeout, the max-silent timeout, the log size cap, and
/// cancellation. The child was spawned in its own process group so kills
/// take the whole tree.
async fn supervise_child(
    ctx: &BuildContext,
    mut child: SandboxChild,
    log_sink: LogSink,
) -> Result<(), BuildError> {
    let child_pid = child.pid();
    let options = &ctx.drv.options;
    let wall_timeout = options.build_timeout.or(ctx.config.build_timeout);
    let max_silent = options.max_silent_time.or(ctx.config.max_silent_time);
    let max_log_size = ctx.config.max_log_size;

    let last_output = Arc::new(std::sync::Mutex::new(tokio::time::Instant::now()));
    let log_bytes = Arc::new(AtomicU64::new(0));

    let stdout_task = drain_stream(
        child.take_stdout(),
        Arc::clone(&log_sink),
        Arc::clone(&last_output),
        Arc::clone(&log_bytes),
    );
    let stderr_task = drain_stream(
        child.take_stderr(),
        Arc::clone(&log_sink),
        Arc::clone(&last_output),
        Arc::clone(&log_bytes),
    );

    let kill_child = |child: &mut SandboxChild| {
        kill_process_group(child_pid);
        if let Some(lock) = &ctx.user_lock {
            lock.kill();
        }
    };

    let deadline = wall_timeout.map(|d| tokio::time::Instant::now() + d);
    let status = loop {
        let poll_interval = Duration::from_millis(50);

        tokio::select! {
            result = child.wait() => {
                match result {
                    Ok(status) => break status,
                    Err(e) => return Err(BuildError::Misc(format!("wait error: {e}"))),
                }
            }
            _ = ctx.cancel.cancelled() => {
                kill_child(&mut child);
                let _ = child.kill().await;
                return Err(BuildError::Cancelled);
            }
            _ = tokio::time::sleep(poll_interval) => {
                if let Some(deadline) = deadline {
                    if tokio::time::Instant::now() >= deadline {
                        kill_child(&mut child);
                        let _ = child.kill().await;
                        return Err(BuildError::Timeout);
                    }
                }
                if let Some(max_silent) = max_silent {
                    let elapsed = last_output.lock().unwrap().elapsed();
                    if elapsed >= max_silent {
                        kill_child(&mut child);
                        let _ = child.kill().await;
                        return Err(BuildError::SilentTimeout);
                    }
                }
                if max_log_size > 0 && log_bytes.load(Ordering::Relaxed) > max_log_size {
                    kill_child(&mut child);
                    let _ = child.kill().await;
                    return Err(BuildError::LogSizeExceeded);
                }
            }
        }
    };

    // Flush trailing output before the sink is dropped (bzip2 trailer).
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    if status.success() {
        Ok(())
    } else {
        use std::os::unix::process::ExitStatusExt as _;
        let reason = match (status.code(), status.signal()) {
            (Some(code), _) => ExitReason::Code(code),
            (None, Some(signal)) => ExitReason::Signal(signal),
            (None, None) => ExitReason::Code(-1),
        };
        Err(BuildError::BuilderFailed(reason))
    }
}

fn drain_stream(
    stream: Option<impl tokio::io::AsyncRead + Send + Unpin + 'static>,
    sink: LogSink,
    last_output: Arc<std::sync::Mutex<tokio::time::Instant>>,
    log_bytes: Arc<AtomicU64>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(stream) = stream {
            let mut reader = tokio::io::BufReader::new(stream).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                *last_output.lock().unwrap() = tokio::time::Instant::now();
                log_bytes.fetch_add(line.len() as u64 + 1, Ordering::Relaxed);
                let mut sink = sink.lock().unwrap();
                let _ = writeln!(sink, "{line}");
            }
        }
    })
}

/// SIGKILL the entire process group rooted at `pid`.
#[allow(unsafe_code)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: plain POSIX kill on a process group we created via
        // process_group(0) at spawn time.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

async fn ingest_outputs(
    ctx: &BuildContext,
    isolation: &Isolation,
    mut scratch: Vec<ScratchOutput>,
    input_closure: &BTreeSet<StorePath>,
) -> Result<BTreeMap<OutputName, Realisation>, BuildError> {
    let store = &ctx.store;
    let store_dir = store.store_dir().clone();

    // Every output must exist, and move from the sandbox view into the
    // real store before anything else happens.
    for out in &scratch {
        let host = isolation.host_path(&store_dir.full_path(&out.scratch));
        let real = store_dir.full_path(&out.scratch);
        if !host.exists() {
            cleanup_scratch(ctx, isolation, &scratch);
            return Err(BuildError::Misc(format!(
                "builder for '{}' failed to produce output path for '{}'",
                ctx.drv_path, out.name
            )));
        }
        if host != real {
            move_path(&host, &real).map_err(|e| BuildError::Misc(e.to_string()))?;
        }
    }

    // Floating outputs first: their final digests feed the rewrite map
    // that input-addressed outputs are rewritten with.
    let mut output_rewrites = DigestRewriter::new();
    for out in &mut scratch {
        if let Some(method) = out.output.floating_method() {
            let final_path = ingest_floating(ctx, out, method, input_closure, &mut output_rewrites)
                .await?;
            out.final_path = Some(final_path);
        }
    }

    let mut infos: Vec<(OutputName, PathInfo)> = Vec::new();
    let mut realisations = BTreeMap::new();

    for out in &scratch {
        let final_path = match &out.output {
            DerivationOutput::InputAddressed(path) => {
                finalise_input_addressed(ctx, out, path, &mut output_rewrites).await?
            }
            DerivationOutput::CaFixed(ca) => finalise_fixed(ctx, out, ca).await?,
            DerivationOutput::CaFloating(_) | DerivationOutput::Impure(_) => out
                .final_path
                .clone()
                .ok_or_else(|| BuildError::Misc("floating output not ingested".into()))?,
            DerivationOutput::Deferred => {
                return Err(BuildError::InvalidInput(format!(
                    "output '{}' is still deferred at build time",
                    out.name
                )));
            }
        };

        // Candidates for the reference scan: the input closure plus every
        // output of this derivation (cross-references and self).
        let mut candidates = input_closure.clone();
        for other in &scratch {
            if let Some(p) = &other.final_path {
                candidates.insert(p.clone());
            }
        }
        candidates.remove(&final_path);

        let real = store_dir.full_path(&final_path);
        let (nar_hash, nar_size, references) = store
            .hash_and_scan(&real, &candidates, Some(&final_path))
            .await
            .map_err(store_err)?;

        let ca = match &out.output {
            DerivationOutput::CaFixed(ca) => Some(ca.clone()),
            DerivationOutput::CaFloating(method) | DerivationOutput::Impure(method) => {
                content_address_for(&real, *method).await.ok()
            }
            _ => None,
        };

        infos.push((
            out.name.clone(),
            PathInfo {
                path: final_path.clone(),
                deriver: Some(ctx.drv_path.clone()),
                nar_hash,
                nar_size,
                references,
                registration_time: 0,
                ultimate: true,
                signatures: BTreeSet::new(),
                ca,
            },
        ));
        realisations.insert(out.name.clone(), Realisation::unsigned(final_path));
    }

    if let Err(e) = check_output_constraints(ctx, &infos).await {
        for (_, info) in &infos {
            // Keep paths that were already valid (floating duplicates).
            if !store.is_valid_path(&info.path).await.unwrap_or(false) {
                remove_path_all(&store_dir.full_path(&info.path));
            }
        }
        return Err(e);
    }

    // Registration: take the path locks in sorted order, re-check
    // validity (a substitution may have won the race), then commit the
    // whole derivation in one transaction.
    let mut locks = Vec::new();
    for (_, info) in &infos {
        let lock_target = store_dir.full_path(&info.path);
        let lock = tokio::task::spawn_blocking(move || PathLock::lock(&lock_target))
            .await
            .map_err(|e| BuildError::Misc(e.to_string()))?
            .map_err(|e| BuildError::Misc(format!("path lock: {e}")))?;
        locks.push(lock);
    }

    store
        .register_valid_paths(infos.iter().map(|(_, info)| info.clone()).collect())
        .await
        .map_err(store_err)?;
    drop(locks);

    Ok(realisations)
}

/// Ingest one floating content-addressed output: hash modulo the scratch
/// self-digest, derive the final path, rewrite, and rename.
async fn ingest_floating(
    ctx: &BuildContext,
    out: &ScratchOutput,
    method: ContentAddressMethodAlgorithm,
    input_closure: &BTreeSet<StorePath>,
    output_rewrites: &mut DigestRewriter,
) -> Result<StorePath, BuildError> {
    let store = &ctx.store;
    let store_dir = store.store_dir().clone();
    let real_scratch = store_dir.full_path(&out.scratch);

    canonicalize::canonicalize_path_metadata(&real_scratch)
        .await
        .map_err(|e| BuildError::Misc(format!("canonicalize: {e}")))?;

    // References and self-reference detection over the scratch bytes.
    let (_, _, refs) = store
        .hash_and_scan(&real_scratch, input_closure, Some(&out.scratch))
        .await
        .map_err(store_err)?;
    let self_ref = refs.contains(&out.scratch);
    let other_refs: BTreeSet<StorePath> =
        refs.into_iter().filter(|r| r != &out.scratch).collect();

    // Hash with the scratch digest blanked so the final path does not
    // depend on the randomly chosen scratch location.
    let modulo = zeroing_rewriter(&out.scratch)?;
    let content_hash = hash_modulo(&real_scratch, method, &modulo).await?;

    let final_path = store_dir
        .make_fixed_output_path(
            out.scratch.name(),
            ingestion_method(method),
            &content_hash,
            &StoreReferences {
                others: other_refs,
                self_ref,
            },
        )
        .map_err(|e| BuildError::Misc(e.to_string()))?;

    // Patch self-references from the scratch digest to the final digest.
    if self_ref {
        let mut rewriter = DigestRewriter::new();
        rewriter
            .insert(&out.scratch.digest_string(), &final_path.digest_string())
            .map_err(|e| BuildError::Misc(e.to_string()))?;
        apply_tree_rewrites(&real_scratch, rewriter).await?;
    }
    output_rewrites
        .insert(&out.scratch.digest_string(), &final_path.digest_string())
        .map_err(|e| BuildError::Misc(e.to_string()))?;

    let real_final = store_dir.full_path(&final_path);
    if store
        .is_valid_path(&final_path)
        .await
        .map_err(store_err)?
    {
        // Already produced by someone else: identical content is a
        // cache hit, anything else is a clash.
        let existing = hermetia_nar::dump_path_to_vec(&real_final)
            .map_err(|e| BuildError::Misc(e.to_string()))?;
        let ours = hermetia_nar::dump_path_to_vec(&real_scratch)
            .map_err(|e| BuildError::Misc(e.to_string()))?;
        remove_path_all(&real_scratch);
        if existing == ours {
            return Ok(final_path);
        }
        return Err(BuildError::OutputClash(final_path));
    }

    remove_path_all(&real_final);
    move_path(&real_scratch, &real_final).map_err(|e| BuildError::Misc(e.to_string()))?;
    Ok(final_path)
}

async fn finalise_input_addressed(
    ctx: &BuildContext,
    out: &ScratchOutput,
    final_path: &StorePath,
    output_rewrites: &mut DigestRewriter,
) -> Result<StorePath, BuildError> {
    let store_dir = ctx.store.store_dir().clone();
    let real_scratch = store_dir.full_path(&out.scratch);

    if out.scratch != *final_path {
        output_rewrites
            .insert(&out.scratch.digest_string(), &final_path.digest_string())
            .map_err(|e| BuildError::Misc(e.to_string()))?;
    }
    // Rewrite scratch digests (own and sibling outputs') to final ones.
    apply_tree_rewrites(&real_scratch, output_rewrites.clone()).await?;

    canonicalize::canonicalize_path_metadata(&real_scratch)
        .await
        .map_err(|e| BuildError::Misc(format!("canonicalize: {e}")))?;

    if out.scratch != *final_path {
        let real_final = store_dir.full_path(final_path);
        remove_path_all(&real_final);
        move_path(&real_scratch, &real_final).map_err(|e| BuildError::Misc(e.to_string()))?;
    }
    Ok(final_path.clone())
}

async fn finalise_fixed(
    ctx: &BuildContext,
    out: &ScratchOutput,
    ca: &ContentAddress,
) -> Result<StorePath, BuildError> {
    let store_dir = ctx.store.store_dir().clone();
    let real_scratch = store_dir.full_path(&out.scratch);

    canonicalize::canonicalize_path_metadata(&real_scratch)
        .await
        .map_err(|e| BuildError::Misc(format!("canonicalize: {e}")))?;

    let observed = content_address_for(&real_scratch, ca.method())
        .await
        .map_err(|e| BuildError::Misc(e.to_string()))?;
    if observed.hash() != ca.hash() {
        remove_path_all(&real_scratch);
        return Err(BuildError::HashMismatch {
            output: out.name.to_string(),
            expected: ca.hash().format_base32(),
            got: observed.hash().format_base32(),
        });
    }

    let final_path = out
        .final_path
        .clone()
        .ok_or_else(|| BuildError::Misc("fixed output without a final path".into()))?;
    if out.scratch != final_path {
        let real_final = store_dir.full_path(&final_path);
        remove_path_all(&real_final);
        move_path(&real_scratch, &real_final).map_err(|e| BuildError::Misc(e.to_string()))?;
    }
    Ok(final_path)
}

async fn content_address_for(
    real_path: &Path,
    method: ContentAddressMethodAlgorithm,
) -> Result<ContentAddress, BuildError> {
    let algo = method.algorithm();
    let hash = match method {
        ContentAddressMethodAlgorithm::Flat(_) | ContentAddressMethodAlgorithm::Text => {
            let data = tokio::fs::read(real_path)
                .await
                .map_err(|e| BuildError::Misc(format!("flat output is not a regular file: {e}")))?;
            digest_bytes(algo, &data)
        }
        ContentAddressMethodAlgorithm::Recursive(_) => {
            let path = real_path.to_path_buf();
            let nar = tokio::task::spawn_blocking(move || hermetia_nar::dump_path_to_vec(&path))
                .await
                .map_err(|e| BuildError::Misc(e.to_string()))?
                .map_err(|e| BuildError::Misc(e.to_string()))?;
            digest_bytes(algo, &nar)
        }
    };
    Ok(match method {
        ContentAddressMethodAlgorithm::Text => ContentAddress::Text { hash },
        ContentAddressMethodAlgorithm::Flat(_) => ContentAddress::Fixed {
            method: FileIngestionMethod::Flat,
            hash,
        },
        ContentAddressMethodAlgorithm::Recursive(_) => ContentAddress::Fixed {
            method: FileIngestionMethod::Recursive,
            hash,
        },
    })
}

fn ingestion_method(method: ContentAddressMethodAlgorithm) -> FileIngestionMethod {
    match method {
        ContentAddressMethodAlgorithm::Recursive(_) => FileIngestionMethod::Recursive,
        _ => FileIngestionMethod::Flat,
    }
}

/// NAR (or flat) hash of a tree with one digest blanked out.
async fn hash_modulo(
    real_path: &Path,
    method: ContentAddressMethodAlgorithm,
    modulo: &DigestRewriter,
) -> Result<Hash, BuildError> {
    let algo = method.algorithm();
    let bytes = match method {
        ContentAddressMethodAlgorithm::Flat(_) | ContentAddressMethodAlgorithm::Text => {
            tokio::fs::read(real_path)
                .await
                .map_err(|e| BuildError::Misc(format!("flat output is not a regular file: {e}")))?
        }
        ContentAddressMethodAlgorithm::Recursive(_) => {
            let path = real_path.to_path_buf();
            tokio::task::spawn_blocking(move || hermetia_nar::dump_path_to_vec(&path))
                .await
                .map_err(|e| BuildError::Misc(e.to_string()))?
                .map_err(|e| BuildError::Misc(e.to_string()))?
        }
    };
    let mut bytes = bytes;
    modulo.rewrite_all(&mut bytes);
    Ok(digest_bytes(algo, &bytes))
}

fn zeroing_rewriter(scratch: &StorePath) -> Result<DigestRewriter, BuildError> {
    let zeros = "0".repeat(hermetia_store_core::store_path::STORE_PATH_DIGEST_CHARS);
    let mut rewriter = DigestRewriter::new();
    rewriter
        .insert(&scratch.digest_string(), &zeros)
        .map_err(|e| BuildError::Misc(e.to_string()))?;
    Ok(rewriter)
}

fn scratch_to_final_rewriter(scratch: &[ScratchOutput]) -> Result<DigestRewriter, BuildError> {
    let mut rewriter = DigestRewriter::new();
    for out in scratch {
        let Some(final_path) = out.registered_path.as_ref().or(out.final_path.as_ref()) else {
            continue;
        };
        if out.scratch != *final_path {
            rewriter
                .insert(&out.scratch.digest_string(), &final_path.digest_string())
                .map_err(|e| BuildError::Misc(e.to_string()))?;
        }
    }
    Ok(rewriter)
}

async fn apply_tree_rewrites(path: &Path, rewriter: DigestRewriter) -> Result<bool, BuildError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || rewrite::rewrite_tree(&path, &rewriter))
        .await
        .map_err(|e| BuildError::Misc(e.to_string()))?
        .map_err(|e| BuildError::Misc(format!("rewriting outputs: {e}")))
}

/// Enforce `{allowed,disallowed}{References,Requisites}` against the
/// computed references and closures.
async fn check_output_constraints(
    ctx: &BuildContext,
    infos: &[(OutputName, PathInfo)],
) -> Result<(), BuildError> {
    let checks = &ctx.drv.options.output_checks;
    if checks.is_trivial() {
        return Ok(());
    }

    let store_dir = ctx.store.store_dir().clone();
    let own_outputs: BTreeSet<String> = infos
        .iter()
        .map(|(_, info)| store_dir.display_path(&info.path))
        .collect();

    for (name, info) in infos {
        let refs: BTreeSet<String> = info
            .references
            .iter()
            .map(|r| store_dir.display_path(r))
            .collect();

        for disallowed in &checks.disallowed_references {
            if refs.contains(disallowed) {
                return Err(BuildError::OutputRejected(format!(
                    "output '{name}' is not allowed to refer to path '{disallowed}'"
                )));
            }
        }
        if let Some(allowed) = &checks.allowed_references {
            let mut full_allowed = allowed.clone();
            full_allowed.extend(own_outputs.iter().cloned());
            for r in &refs {
                if !full_allowed.contains(r) {
                    return Err(BuildError::OutputRejected(format!(
                        "output '{name}' is not allowed to refer to path '{r}'"
                    )));
                }
            }
        }

        if checks.disallowed_requisites.is_empty() && checks.allowed_requisites.is_none() {
            continue;
        }
        // Requisite checks walk the freshly registered closure; at this
        // point references are registered, so the walk stays local.
        let mut closure = BTreeSet::new();
        let mut queue: Vec<StorePath> = info.references.iter().cloned().collect();
        while let Some(current) = queue.pop() {
            if !closure.insert(store_dir.display_path(&current)) {
                continue;
            }
            if let Ok(Some(current_info)) = ctx.store.query_path_info(&current).await {
                queue.extend(current_info.references);
            }
        }

        for disallowed in &checks.disallowed_requisites {
            if closure.contains(disallowed) {
                return Err(BuildError::OutputRejected(format!(
                    "output '{name}' closure contains disallowed path '{disallowed}'"
                )));
            }
        }
        if let Some(allowed) = &checks.allowed_requisites {
            let mut full_allowed = allowed.clone();
            full_allowed.extend(own_outputs.iter().cloned());
            for p in &closure {
                if !full_allowed.contains(p) {
                    return Err(BuildError::OutputRejected(format!(
                        "output '{name}' closure contains path '{p}' not in allowedRequisites"
                    )));
                }
            }
        }
    }
    Ok(())
}

fn cleanup_scratch(ctx: &BuildContext, isolation: &Isolation, scratch: &[ScratchOutput]) {
    let store_dir = ctx.store.store_dir();
    for out in scratch {
        let real = store_dir.full_path(&out.scratch);
        for candidate in [isolation.host_path(&real), real.clone()] {
            if !candidate.exists() {
                continue;
            }
            if ctx.config.keep_failed {
                let failed = real.with_file_name(format!("{}.failed", out.scratch));
                let _ = move_path(&candidate, &failed);
            } else {
                remove_path_all(&candidate);
            }
        }
    }
}

/// Rename, falling back to copy-and-delete across filesystems.
fn move_path(from: &Path, to: &Path) -> std::io::Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    let nar = hermetia_nar::dump_path_to_vec(from).map_err(std::io::Error::other)?;
    hermetia_nar::restore(&mut nar.as_slice(), to).map_err(std::io::Error::other)?;
    remove_path_all(from);
    Ok(())
}

fn store_err(e: StoreError) -> BuildError {
    match e {
        StoreError::Io(msg) if msg.contains("No space left") => BuildError::StoreFull,
        other => BuildError::Misc(other.to_string()),
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
