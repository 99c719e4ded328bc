// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Linux build isolation via namespaces and a bind-mounted chroot.
//!
//! The child unshares user, mount, and uts namespaces (plus a network
//! namespace unless the derivation is fixed-output), maps the leased
//! build uid/gid to the conventional sandbox identity, sets the hostname
//! to the synthesised value, bind-mounts exactly the declared filesystem
//! view into a scratch root, and chroots into it before exec'ing the
//! builder.
//!
//! Unprivileged user namespaces must be enabled on the host
//! (`kernel.unprivileged_userns_clone = 1`).

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Path, PathBuf};

use crate::sandbox::{Sandbox, SandboxChild, SandboxError, SandboxMount, SandboxSpec};

/// Uid/gid the builder appears as inside the user namespace, matching the
/// long-standing sandbox convention.
const SANDBOX_UID: u32 = 1000;
const SANDBOX_GID: u32 = 100;

/// Namespace-based sandbox. `chroot_root` is a scratch directory next to
/// the build dir; it is populated with mount points by the parent and
/// torn down with the build's temporary directory.
pub struct LinuxSandbox {
    chroot_root: PathBuf,
}

impl LinuxSandbox {
    pub fn new(chroot_root: PathBuf) -> Self {
        Self { chroot_root }
    }

    /// The build's temporary directory, used as the `nixbld` home entry
    /// in the sandbox's synthesised `/etc/passwd`.
    fn build_top(spec: &SandboxSpec) -> &Path {
        &spec.work_dir
    }

    /// Create every mount point (and the fresh /tmp) under the chroot
    /// root while still in the parent, so the child only has to mount.
    fn prepare_root(&self, spec: &SandboxSpec) -> Result<(), SandboxError> {
        std::fs::create_dir_all(&self.chroot_root)?;
        std::fs::create_dir_all(self.chroot_root.join("tmp"))?;
        std::fs::create_dir_all(self.chroot_root.join("etc"))?;
        std::fs::create_dir_all(self.chroot_root.join("proc"))?;

        // Minimal /etc so name lookups inside the sandbox see the
        // synthesised hostname and the stub passwd entries.
        std::fs::write(
            self.chroot_root.join("etc/hosts"),
            format!("127.0.0.1 {} localhost\n::1 localhost\n", spec.hostname),
        )?;
        std::fs::write(
            self.chroot_root.join("etc/passwd"),
            format!(
                "root:x:0:0:Nobody:/:/noshell\nnixbld:x:{SANDBOX_UID}:{SANDBOX_GID}:Build user:{}:/noshell\nnobody:x:65534:65534:Nobody:/:/noshell\n",
                Self::build_top(spec).display()
            ),
        )?;
        std::fs::write(
            self.chroot_root.join("etc/group"),
            format!("root:x:0:\nnixbld:x:{SANDBOX_GID}:\nnogroup:x:65534:\n"),
        )?;

        for mount in self.all_mounts(spec) {
            if mount.optional && !mount.source.exists() {
                continue;
            }
            let target = self.target_in_root(&mount.target);
            let meta = std::fs::metadata(&mount.source).map_err(|e| {
                SandboxError::Setup(format!(
                    "sandbox mount source {} unavailable: {e}",
                    mount.source.display()
                ))
            })?;
            if meta.is_dir() {
                std::fs::create_dir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                if !target.exists() {
                    std::fs::write(&target, b"")?;
                }
            }
        }
        Ok(())
    }

    /// The declared mounts plus the build directory, writable scratch
    /// paths, and the standard device nodes.
    fn all_mounts(&self, spec: &SandboxSpec) -> Vec<SandboxMount> {
        let mut mounts = spec.mounts.clone();

        mounts.push(SandboxMount {
            source: spec.work_dir.clone(),
            target: spec.work_dir.clone(),
            read_only: false,
            optional: false,
        });
        for path in &spec.writable_paths {
            mounts.push(SandboxMount {
                source: path.clone(),
                target: path.clone(),
                read_only: false,
                optional: false,
            });
        }
        for dev in ["null", "zero", "full", "random", "urandom", "tty"] {
            let path = PathBuf::from(format!("/dev/{dev}"));
            mounts.push(SandboxMount {
                source: path.clone(),
                target: path,
                read_only: false,
                optional: true,
            });
        }
        mounts
    }

    fn target_in_root(&self, target: &Path) -> PathBuf {
        let relative = target.strip_prefix("/").unwrap_or(target);
        self.chroot_root.join(relative)
    }
}

impl Sandbox for LinuxSandbox {
    #[allow(unsafe_code)]
    async fn spawn(&self, spec: &SandboxSpec) -> Result<SandboxChild, SandboxError> {
        use std::os::unix::process::CommandExt;
        use std::process::Stdio;

        self.prepare_root(spec)?;

        let allow_network = spec.allow_network;
        let hostname = spec.hostname.clone();
        let (host_uid, host_gid) = match spec.identity {
            Some((uid, gid)) => (uid, gid),
            // Without a leased build user, map the engine's own identity.
            None => (
                nix::unistd::getuid().as_raw(),
                nix::unistd::getgid().as_raw(),
            ),
        };

        // Everything the child touches is precomputed here: the post-fork
        // environment must not allocate more than it has to.
        let chroot_root = CString::new(self.chroot_root.as_os_str().as_bytes())
            .map_err(|_| SandboxError::Setup("chroot root contains NUL".into()))?;
        let work_dir = CString::new(spec.work_dir.as_os_str().as_bytes())
            .map_err(|_| SandboxError::Setup("work dir contains NUL".into()))?;
        let mut bind_mounts: Vec<(CString, CString, bool)> = Vec::new();
        for mount in self.all_mounts(spec) {
            if mount.optional && !mount.source.exists() {
                continue;
            }
            let source = CString::new(mount.source.as_os_str().as_bytes())
                .map_err(|_| SandboxError::Setup("mount source contains NUL".into()))?;
            let target = CString::new(self.target_in_root(&mount.target).as_os_str().as_bytes())
                .map_err(|_| SandboxError::Setup("mount target contains NUL".into()))?;
            bind_mounts.push((source, target, mount.read_only));
        }
        let proc_target = CString::new(
            self.chroot_root.join("proc").as_os_str().as_bytes(),
        )
        .map_err(|_| SandboxError::Setup("proc target contains NUL".into()))?;

        let mut cmd = std::process::Command::new(&spec.builder);
        cmd.args(&spec.args)
            .env_clear()
            .envs(spec.env.iter())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        // SAFETY: the closure runs in the forked child before exec. The
        // process is single-threaded there; unshare, mount, chroot, and
        // writes to /proc/self are permitted. Errors are reported back
        // through the spawn error pipe and surface as Setup failures.
        unsafe {
            cmd.pre_exec(move || {
                use nix::mount::{MsFlags, mount};
                use nix::sched::{CloneFlags, unshare};

                let mut flags = CloneFlags::CLONE_NEWUSER
                    | CloneFlags::CLONE_NEWNS
                    | CloneFlags::CLONE_NEWUTS
                    | CloneFlags::CLONE_NEWIPC;
                if !allow_network {
                    flags |= CloneFlags::CLONE_NEWNET;
                }
                unshare(flags).map_err(io_err("unshare"))?;

                std::fs::write(
                    "/proc/self/uid_map",
                    format!("{SANDBOX_UID} {host_uid} 1\n"),
                )?;
                std::fs::write("/proc/self/setgroups", "deny\n")?;
                std::fs::write(
                    "/proc/self/gid_map",
                    format!("{SANDBOX_GID} {host_gid} 1\n"),
                )?;

                nix::unistd::sethostname(hostname.as_str()).map_err(io_err("sethostname"))?;

                // Make the mount tree private so nothing leaks back out.
                mount(
                    None::<&str>,
                    "/",
                    None::<&str>,
                    MsFlags::MS_PRIVATE | MsFlags::MS_REC,
                    None::<&str>,
                )
                .map_err(io_err("remount private"))?;

                for (source, target, read_only) in &bind_mounts {
                    mount(
                        Some(source.as_c_str()),
                        target.as_c_str(),
                        None::<&str>,
                        MsFlags::MS_BIND | MsFlags::MS_REC,
                        None::<&str>,
                    )
                    .map_err(io_err("bind mount"))?;
                    if *read_only {
                        mount(
                            None::<&str>,
                            target.as_c_str(),
                            None::<&str>,
                            MsFlags::MS_BIND
                                | MsFlags::MS_REMOUNT
                                | MsFlags::MS_RDONLY
                                | MsFlags::MS_REC,
                            None::<&str>,
                        )
                        .map_err(io_err("remount read-only"))?;
                    }
                }

                mount(
                    Some("proc"),
                    proc_target.as_c_str(),
                    Some("proc"),
                    MsFlags::empty(),
                    None::<&str>,
                )
                .map_err(io_err("mount proc"))?;

                nix::unistd::chroot(chroot_root.as_c_str()).map_err(io_err("chroot"))?;
                nix::unistd::chdir(work_dir.as_c_str()).map_err(io_err("chdir"))?;

                Ok(())
            });
        }

        let mut tokio_cmd = tokio::process::Command::from(cmd);
        let child = tokio_cmd.spawn().map_err(|e| {
            SandboxError::Setup(format!(
                "failed to start '{}' in sandbox: {e}",
                spec.builder
            ))
        })?;

        Ok(SandboxChild::from_child(child))
    }
}

fn io_err(what: &'static str) -> impl Fn(nix::errno::Errno) -> std::io::Error {
    move |e| std::io::Error::other(format!("{what}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(work_dir: PathBuf) -> SandboxSpec {
        SandboxSpec {
            builder: "/bin/sh".into(),
            args: vec!["-c".into(), "true".into()],
            env: BTreeMap::new(),
            work_dir,
            mounts: vec![SandboxMount {
                source: "/bin".into(),
                target: "/bin".into(),
                read_only: true,
                optional: false,
            }],
            writable_paths: Vec::new(),
            allow_network: false,
            hostname: "localhost".into(),
            identity: None,
        }
    }

    #[test]
    fn test_prepare_root_creates_mount_points() {
        let tmp = tempfile::TempDir::new().unwrap();
        let work_dir = tmp.path().join("build");
        std::fs::create_dir(&work_dir).unwrap();
        let root = tmp.path().join("chroot");

        let sandbox = LinuxSandbox::new(root.clone());
        sandbox.prepare_root(&spec(work_dir.clone())).unwrap();

        assert!(root.join("tmp").is_dir());
        assert!(root.join("proc").is_dir());
        assert!(root.join("bin").is_dir());
        assert!(
            root.join(work_dir.strip_prefix("/").unwrap()).is_dir(),
            "work dir mount point should exist inside the root"
        );
        let hosts = std::fs::read_to_string(root.join("etc/hosts")).unwrap();
        assert!(hosts.contains("localhost"));
    }

    #[test]
    fn test_device_nodes_are_optional() {
        let tmp = tempfile::TempDir::new().unwrap();
        let work_dir = tmp.path().join("build");
        std::fs::create_dir(&work_dir).unwrap();

        let sandbox = LinuxSandbox::new(tmp.path().join("chroot"));
        let mounts = sandbox.all_mounts(&spec(work_dir));
        let dev_null = mounts
            .iter()
            .find(|m| m.target == Path::new("/dev/null"))
            .expect("/dev/null should be in the mount list");
        assert!(dev_null.optional);
    }
}
