// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Engine configuration.
//!
//! A single [`EngineConfig`] value is built at startup (from a TOML file
//! and/or CLI flags) and threaded through construction. Goals only ever see
//! read-only references; there is no process-wide mutable state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, IoContext};

/// Engine-level sandbox policy. The per-derivation option can only relax
/// this within what the policy allows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxPolicy {
    Disabled,
    #[default]
    Enabled,
    Relaxed,
}

/// One configured remote builder, reachable over the serve protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteBuilderConfig {
    /// Connection spec, e.g. `ssh://builder1`.
    pub url: String,
    /// Platforms this builder can build for.
    pub platforms: Vec<String>,
    /// Concurrent build slots on this builder.
    #[serde(default = "default_remote_slots")]
    pub slots: usize,
    /// System features the builder advertises.
    #[serde(default)]
    pub system_features: Vec<String>,
}

fn default_remote_slots() -> usize {
    1
}

/// One configured substituter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstituterConfig {
    /// Location; currently `file://` binary caches.
    pub url: String,
    /// Lower numbers are consulted first.
    #[serde(default = "default_priority")]
    pub priority: u32,
}

fn default_priority() -> u32 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path to the store directory.
    pub store_dir: PathBuf,

    /// Path to the metadata database.
    pub db_path: PathBuf,

    /// Parent directory for temporary build directories.
    pub build_dir: PathBuf,

    /// Directory where bzip2-compressed build logs are written.
    /// `None` disables log persistence (useful in tests).
    pub log_dir: Option<PathBuf>,

    /// Local build parallelism. 0 disables local builds entirely.
    pub max_build_jobs: usize,

    /// Number of CPU cores advertised to each build.
    pub cores: usize,

    /// Keep scheduling unrelated goals after a failure.
    pub keep_going: bool,

    /// Keep failed build outputs under a `.failed` suffix.
    pub keep_failed: bool,

    /// Engine-wide sandbox policy.
    pub sandbox: SandboxPolicy,

    /// Unix group whose members serve as build users; `None` disables
    /// build-user isolation (builds run as the engine's own user).
    pub build_users_group: Option<String>,

    /// Directory for build-user file locks.
    pub pool_dir: PathBuf,

    /// Default wall-clock limit for builds; per-derivation options win.
    #[serde(with = "opt_secs")]
    pub build_timeout: Option<Duration>,

    /// Default max-silent limit for builds; per-derivation options win.
    #[serde(with = "opt_secs")]
    pub max_silent_time: Option<Duration>,

    /// Cap on captured build log size in bytes. 0 means unlimited.
    pub max_log_size: u64,

    /// Re-run every build this many extra times and compare outputs.
    pub nr_repeats: u32,

    /// Substituters in priority order.
    pub substituters: Vec<SubstituterConfig>,

    /// Signatures required per substituted path.
    pub sigs_needed: usize,

    /// Trusted public keys in `name:base64` form.
    pub trusted_keys: Vec<String>,

    /// Remote builders, keyed by supported platform at scheduling time.
    pub remote_builders: Vec<RemoteBuilderConfig>,

    /// Extra host paths mounted read-only into every sandbox.
    pub sandbox_paths: Vec<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            store_dir: PathBuf::from("/nix/store"),
            db_path: PathBuf::from("/nix/var/nix/db/db.sqlite"),
            build_dir: PathBuf::from("/nix/var/nix/builds"),
            log_dir: Some(PathBuf::from("/nix/var/log/nix")),
            max_build_jobs: cores,
            cores,
            keep_going: true,
            keep_failed: false,
            sandbox: SandboxPolicy::default(),
            build_users_group: None,
            pool_dir: PathBuf::from("/nix/var/nix/userpool"),
            build_timeout: None,
            max_silent_time: None,
            max_log_size: 0,
            nr_repeats: 0,
            substituters: Vec::new(),
            sigs_needed: 1,
            trusted_keys: Vec::new(),
            remote_builders: Vec::new(),
            sandbox_paths: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let contents = std::fs::read_to_string(path)
            .io_context(|| format!("failed to read config file at {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation. Anything wrong here is a
    /// [`EngineError::Configuration`] and fatal.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.store_dir.is_absolute() {
            return Err(EngineError::configuration(format!(
                "store_dir must be absolute, got {}",
                self.store_dir.display()
            )));
        }
        if self.max_build_jobs == 0 && self.remote_builders.is_empty() {
            tracing::warn!("local builds disabled and no remote builders configured");
        }
        for key in &self.trusted_keys {
            key.parse::<hermetia_store_core::signature::PublicKey>()
                .map_err(|e| {
                    EngineError::configuration(format!("invalid trusted key '{key}': {e}"))
                })?;
        }
        for builder in &self.remote_builders {
            if builder.platforms.is_empty() {
                return Err(EngineError::configuration(format!(
                    "remote builder '{}' declares no platforms",
                    builder.url
                )));
            }
        }
        Ok(())
    }

    /// The platform this engine builds natively.
    pub fn local_platform() -> &'static str {
        if cfg!(all(target_os = "linux", target_arch = "x86_64")) {
            "x86_64-linux"
        } else if cfg!(all(target_os = "linux", target_arch = "aarch64")) {
            "aarch64-linux"
        } else if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
            "aarch64-darwin"
        } else if cfg!(all(target_os = "macos", target_arch = "x86_64")) {
            "x86_64-darwin"
        } else {
            "unknown"
        }
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
