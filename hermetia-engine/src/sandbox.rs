// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Sandbox abstraction for build isolation.
//!
//! The builder process must see: the derivation's input closure
//! (read-only), a fresh writable /tmp, the basic /dev nodes, its scratch
//! output directories (writable), and nothing else. No network unless the
//! derivation is fixed-output. Identity inside the sandbox is the leased
//! build user; the hostname is synthesised.
//!
//! Implementations:
//! - [`NoSandbox`]: plain child process with a scrubbed environment, for
//!   `sandbox = disabled` and platforms without namespace support.
//! - `LinuxSandbox` (see `linux_sandbox`): user/mount/uts/net namespaces
//!   plus a bind-mounted chroot.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// A mount entry in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxMount {
    /// Source path on the host.
    pub source: PathBuf,
    /// Destination path in the sandbox.
    pub target: PathBuf,
    /// Whether the mount is read-only.
    pub read_only: bool,
    /// Whether a missing source is tolerated.
    pub optional: bool,
}

/// Everything a sandbox needs to know to run one builder.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub builder: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// The build's temporary directory (becomes the working directory).
    pub work_dir: PathBuf,
    /// Read-only views: the input closure plus configured sandbox paths.
    pub mounts: Vec<SandboxMount>,
    /// Writable locations: scratch output parents.
    pub writable_paths: Vec<PathBuf>,
    /// Fixed-output derivations are granted network access.
    pub allow_network: bool,
    /// Hostname visible inside the sandbox.
    pub hostname: String,
    /// Leased identity (uid, gid); `None` runs as the engine's own user.
    pub identity: Option<(u32, u32)>,
}

/// Errors from sandbox operations. `Setup` failures are reported to the
/// scheduler as `SandboxSetupFailed`, distinct from builder failures.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox setup failed: {0}")]
    Setup(String),

    #[error("sandbox spawn failed: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A sandbox implementation turns a [`SandboxSpec`] into a supervised
/// child process.
pub trait Sandbox: Send + Sync {
    fn spawn(
        &self,
        spec: &SandboxSpec,
    ) -> impl std::future::Future<Output = Result<SandboxChild, SandboxError>> + Send;
}

/// A running builder process inside a sandbox.
#[derive(Debug)]
pub struct SandboxChild {
    inner: tokio::process::Child,
}

impl SandboxChild {
    pub fn from_child(child: tokio::process::Child) -> Self {
        Self { inner: child }
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, SandboxError> {
        Ok(self.inner.wait().await?)
    }

    pub async fn kill(&mut self) -> Result<(), SandboxError> {
        Ok(self.inner.kill().await?)
    }

    /// Take stdout for reading (can only be called once).
    pub fn take_stdout(&mut self) -> Option<tokio::process::ChildStdout> {
        self.inner.stdout.take()
    }

    /// Take stderr for reading (can only be called once).
    pub fn take_stderr(&mut self) -> Option<tokio::process::ChildStderr> {
        self.inner.stderr.take()
    }

    /// Process ID, for process-group kills.
    pub fn pid(&self) -> Option<u32> {
        self.inner.id()
    }
}

/// No-isolation passthrough: the builder runs as a plain child process
/// with only the supplied environment. Used when the sandbox policy is
/// disabled and by the engine's own tests.
pub struct NoSandbox;

impl NoSandbox {
    pub fn new() -> Self {
        NoSandbox
    }
}

impl Default for NoSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Sandbox for NoSandbox {
    async fn spawn(&self, spec: &SandboxSpec) -> Result<SandboxChild, SandboxError> {
        use std::process::Stdio;

        let mut cmd = tokio::process::Command::new(&spec.builder);
        cmd.args(&spec.args)
            .current_dir(&spec.work_dir)
            .env_clear()
            .envs(spec.env.iter())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A fresh process group so timeouts can kill the whole tree.
            .process_group(0);

        let child = cmd.spawn().map_err(|e| {
            SandboxError::Spawn(format!("failed to spawn '{}': {e}", spec.builder))
        })?;

        Ok(SandboxChild::from_child(child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_spec(work_dir: PathBuf, script: &str) -> SandboxSpec {
        SandboxSpec {
            builder: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            env: BTreeMap::new(),
            work_dir,
            mounts: Vec::new(),
            writable_paths: Vec::new(),
            allow_network: false,
            hostname: "localhost".into(),
            identity: None,
        }
    }

    #[tokio::test]
    async fn test_no_sandbox_runs_builder() {
        let dir = tempfile::TempDir::new().unwrap();
        let spec = sh_spec(dir.path().to_path_buf(), "echo done > result");

        let mut child = NoSandbox::new().spawn(&spec).await.unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("result")).unwrap().trim(),
            "done"
        );
    }

    #[tokio::test]
    async fn test_environment_is_scrubbed() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut spec = sh_spec(
            dir.path().to_path_buf(),
            "printf '%s' \"${HOME:-unset}\" > result",
        );
        spec.env.insert("HOME".into(), "/homeless-shelter".into());

        let mut child = NoSandbox::new().spawn(&spec).await.unwrap();
        child.wait().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("result")).unwrap(),
            "/homeless-shelter"
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut spec = sh_spec(dir.path().to_path_buf(), "true");
        spec.builder = "/does/not/exist".into();

        let err = NoSandbox::new().spawn(&spec).await.unwrap_err();
        assert!(matches!(err, SandboxError::Spawn(_)));
    }
}
