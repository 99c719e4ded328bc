// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Build user allocation.
//!
//! A build runs under a leased unprivileged identity so that concurrent
//! builds cannot observe or interfere with each other's scratch space.
//! Two strategies, both coordinated by file locks so multiple engine
//! processes share one pool:
//!
//! - group members: lock `<pool>/<uid>` for a member of the configured
//!   build-users group (single uid per build);
//! - auto-allocated ranges: lock `<pool>/auto-<slot>` for a contiguous
//!   uid range, for builds that need nested user namespaces.
//!
//! The lock is released when the [`UserLock`] is dropped.

use std::fs;
use std::io::{self, ErrorKind};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::unistd::{geteuid, getuid};

/// Number of uids granted to one ranged lease. Large enough for a full
/// in-sandbox uid namespace mapping.
pub const IDS_PER_RANGE: u32 = 65536;

/// A held build-user lease. The file lock is released on drop.
pub struct UserLock {
    /// Kept open to hold the flock.
    _fd: Flock<fs::File>,
    first_uid: u32,
    first_gid: u32,
    nr_ids: u32,
}

impl UserLock {
    pub fn uid(&self) -> u32 {
        self.first_uid
    }

    pub fn gid(&self) -> u32 {
        self.first_gid
    }

    pub fn uid_count(&self) -> u32 {
        self.nr_ids
    }

    /// The leased uid range as `(first, last)` inclusive.
    pub fn uid_range(&self) -> (u32, u32) {
        (self.first_uid, self.first_uid + self.nr_ids - 1)
    }

    /// SIGKILL every process currently running under the leased identity.
    /// Used for timeout enforcement and cleanup; callers await reaping of
    /// their own children separately.
    pub fn kill(&self) {
        kill_user_processes(self.first_uid, self.nr_ids);
    }
}

/// Try to lease a single build user from the group member list. `None`
/// means every member is busy; the caller parks until a lock drops.
pub fn acquire_user_lock(
    pool_dir: &Path,
    group_members: &[(u32, u32)],
) -> io::Result<Option<UserLock>> {
    fs::create_dir_all(pool_dir)?;

    for &(uid, gid) in group_members {
        let lock_path = pool_dir.join(uid.to_string());

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&lock_path)?;

        let fd = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(fd) => fd,
            Err((_, Errno::EWOULDBLOCK | Errno::EINTR)) => continue,
            Err((_, errno)) => return Err(errno.into()),
        };

        // The engine must never run builds as itself.
        if uid == getuid().as_raw() || uid == geteuid().as_raw() {
            return Err(io::Error::new(
                ErrorKind::PermissionDenied,
                format!("the engine's own user must not be in the build users group (UID {uid})"),
            ));
        }

        return Ok(Some(UserLock {
            _fd: fd,
            first_uid: uid,
            first_gid: gid,
            nr_ids: 1,
        }));
    }

    Ok(None)
}

/// Try to lease a uid range for a build that needs nested namespaces.
/// Slot `i` covers `[start_uid + i*IDS_PER_RANGE, ...)`.
pub fn acquire_uid_range(
    pool_dir: &Path,
    start_uid: u32,
    nr_slots: u32,
) -> io::Result<Option<UserLock>> {
    fs::create_dir_all(pool_dir)?;

    for slot in 0..nr_slots {
        let lock_path = pool_dir.join(format!("auto-{slot}"));

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&lock_path)?;

        let fd = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(fd) => fd,
            Err((_, Errno::EWOULDBLOCK | Errno::EINTR)) => continue,
            Err((_, errno)) => return Err(errno.into()),
        };

        let first_uid = start_uid + slot * IDS_PER_RANGE;
        return Ok(Some(UserLock {
            _fd: fd,
            first_uid,
            // Nested-namespace builds map gid 0 themselves.
            first_gid: first_uid,
            nr_ids: IDS_PER_RANGE,
        }));
    }

    Ok(None)
}

/// SIGKILL every process whose real uid falls in `[first_uid,
/// first_uid + nr_ids)`, by walking `/proc`.
#[cfg(target_os = "linux")]
fn kill_user_processes(first_uid: u32, nr_ids: u32) {
    let Ok(entries) = fs::read_dir("/proc") else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        let Ok(status) = fs::read_to_string(entry.path().join("status")) else {
            continue;
        };
        let uid = status
            .lines()
            .find_map(|line| line.strip_prefix("Uid:"))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|s| s.parse::<u32>().ok());
        if let Some(uid) = uid {
            if uid >= first_uid && uid < first_uid + nr_ids {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn kill_user_processes(_first_uid: u32, _nr_ids: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_self_uid_rejected() {
        let tmp = TempDir::new().unwrap();
        let pool_dir = tmp.path().join("userpool");

        let my_uid = getuid().as_raw();
        let members = vec![(my_uid, 30000)];

        assert!(
            acquire_user_lock(&pool_dir, &members).is_err(),
            "must reject the engine's own UID"
        );
    }

    #[test]
    fn test_acquires_and_releases() {
        let tmp = TempDir::new().unwrap();
        let pool_dir = tmp.path().join("userpool");

        let members = vec![(30001, 30000), (30002, 30000)];

        let lock1 = acquire_user_lock(&pool_dir, &members).unwrap().expect("slot 1");
        assert_eq!(lock1.uid(), 30001);
        assert_eq!(lock1.gid(), 30000);
        assert_eq!(lock1.uid_count(), 1);

        let lock2 = acquire_user_lock(&pool_dir, &members).unwrap().expect("slot 2");
        assert_eq!(lock2.uid(), 30002);

        // Pool exhausted.
        assert!(acquire_user_lock(&pool_dir, &members).unwrap().is_none());

        drop(lock1);
        let lock3 = acquire_user_lock(&pool_dir, &members).unwrap().expect("reacquire");
        assert_eq!(lock3.uid(), 30001);
    }

    #[test]
    fn test_uid_range_allocation() {
        let tmp = TempDir::new().unwrap();
        let pool_dir = tmp.path().join("userpool");

        let lock1 = acquire_uid_range(&pool_dir, 100_000, 2).unwrap().expect("slot 0");
        assert_eq!(lock1.uid(), 100_000);
        assert_eq!(lock1.uid_count(), IDS_PER_RANGE);
        assert_eq!(lock1.uid_range(), (100_000, 100_000 + IDS_PER_RANGE - 1));

        let lock2 = acquire_uid_range(&pool_dir, 100_000, 2).unwrap().expect("slot 1");
        assert_eq!(lock2.uid(), 100_000 + IDS_PER_RANGE);

        assert!(acquire_uid_range(&pool_dir, 100_000, 2).unwrap().is_none());
    }
}
