// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Path metadata canonicalization for ingested outputs.
//!
//! Before a path is hashed and registered, its metadata is normalised so
//! the NAR hash only depends on contents:
//! - permissions: write bits cleared, only the owner-execute bit kept
//! - timestamps: mtime set to Unix epoch 1
//! - ownership: reset to root:root when running as root

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;

use nix::unistd::{Gid, Uid, geteuid};

/// Unix epoch + 1 second, the canonical store timestamp.
const EPOCH_PLUS_ONE: i64 = 1;

/// Set atime and mtime on `path` without following symlinks.
#[allow(unsafe_code)]
fn set_timestamp(path: &Path, seconds: i64) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let times = [
        libc::timespec {
            tv_sec: seconds,
            tv_nsec: 0,
        },
        libc::timespec {
            tv_sec: seconds,
            tv_nsec: 0,
        },
    ];
    // SAFETY: c_path is a valid null-terminated string and times is a
    // 2-element array on the stack. AT_SYMLINK_NOFOLLOW keeps symlinks
    // themselves untouched.
    let ret = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Canonicalize all metadata under `path` recursively. Runs the blocking
/// filesystem walk on the blocking pool.
pub async fn canonicalize_path_metadata(path: &Path) -> io::Result<()> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || canonicalize_path_metadata_sync(&path))
        .await
        .map_err(io::Error::other)?
}

pub fn canonicalize_path_metadata_sync(path: &Path) -> io::Result<()> {
    canonicalize_entry(path)?;

    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            canonicalize_path_metadata_sync(&entry?.path())?;
        }
    }

    Ok(())
}

fn canonicalize_entry(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;

    // Symlinks carry no independent permissions or timestamps.
    if metadata.is_symlink() {
        return Ok(());
    }

    let mode = metadata.permissions().mode();
    let new_mode = if mode & 0o111 != 0 || metadata.is_dir() {
        0o555
    } else {
        0o444
    };
    if new_mode != mode & 0o777 {
        fs::set_permissions(path, fs::Permissions::from_mode(new_mode))?;
    }

    set_timestamp(path, EPOCH_PLUS_ONE)?;

    if geteuid().is_root() {
        nix::unistd::chown(path, Some(Uid::from_raw(0)), Some(Gid::from_raw(0)))
            .map_err(io::Error::other)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt as _;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_permissions_canonicalized() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, "hello").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o666)).unwrap();
        let tool = dir.path().join("tool");
        fs::write(&tool, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o777)).unwrap();

        canonicalize_path_metadata(&file).await.unwrap();
        canonicalize_path_metadata(&tool).await.unwrap();

        assert_eq!(fs::metadata(&file).unwrap().permissions().mode() & 0o777, 0o444);
        assert_eq!(fs::metadata(&tool).unwrap().permissions().mode() & 0o777, 0o555);
    }

    #[tokio::test]
    async fn test_timestamps_reset() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, "hello").unwrap();

        canonicalize_path_metadata(&file).await.unwrap();

        assert_eq!(fs::metadata(&file).unwrap().mtime(), EPOCH_PLUS_ONE);
    }

    #[tokio::test]
    async fn test_recurses_into_directories() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/file"), "x").unwrap();
        fs::set_permissions(root.join("sub/file"), fs::Permissions::from_mode(0o666)).unwrap();

        canonicalize_path_metadata(&root).await.unwrap();

        assert_eq!(
            fs::metadata(root.join("sub/file")).unwrap().permissions().mode() & 0o777,
            0o444
        );
        assert_eq!(fs::metadata(root.join("sub")).unwrap().mtime(), EPOCH_PLUS_ONE);
    }
}
