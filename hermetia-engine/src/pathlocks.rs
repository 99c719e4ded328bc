// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Filesystem-based path locks.
//!
//! Each store path `<path>` is protected by an exclusive `flock()` on
//! `<path>.lock`, so registration of a path is serialised across
//! processes (concurrent builds, substitutions, GC) without in-process
//! mutexes. A substitution and a local build for the same path take this
//! lock before committing; whichever wins, the loser re-checks validity
//! and aborts.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

/// An exclusive lock on a store path, backed by `flock()` on
/// `<path>.lock`. Released on drop.
pub struct PathLock {
    _flock: Flock<File>,
    _lock_path: PathBuf,
}

impl PathLock {
    /// Acquire an exclusive lock on `path`, blocking until it is free.
    pub fn lock(path: &Path) -> io::Result<Self> {
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let flock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| io::Error::other(format!("flock failed: {errno}")))?;

        Ok(Self {
            _flock: flock,
            _lock_path: lock_path,
        })
    }

    /// Non-blocking variant; `None` when another holder has it.
    pub fn try_lock(path: &Path) -> io::Result<Option<Self>> {
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(Self {
                _flock: flock,
                _lock_path: lock_path,
            })),
            Err((_, nix::errno::Errno::EWOULDBLOCK | nix::errno::Errno::EINTR)) => Ok(None),
            Err((_, errno)) => Err(errno.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_creates_lock_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("some-path");

        let _lock = PathLock::lock(&path).unwrap();

        assert!(PathBuf::from(format!("{}.lock", path.display())).exists());
    }

    #[test]
    fn test_try_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contested");

        let held = PathLock::lock(&path).unwrap();
        assert!(PathLock::try_lock(&path).unwrap().is_none());

        drop(held);
        assert!(PathLock::try_lock(&path).unwrap().is_some());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("drop-test");

        {
            let _lock = PathLock::lock(&path).unwrap();
        }
        let _lock = PathLock::lock(&path).unwrap();
    }
}
