// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Restoring a NAR byte stream back to a filesystem tree.
//!
//! Used when ingesting substituted paths. Permissions are written the
//! canonical way (0444 for files, 0555 for executables and directories);
//! timestamps are left to the canonicaliser.

use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::NarError;

/// Unpack the NAR in `input` to `target`. The target must not exist yet.
pub fn restore(input: &mut impl Read, target: &Path) -> Result<(), NarError> {
    let magic = read_bytes(input)?;
    if magic != b"nix-archive-1" {
        return Err(NarError::Malformed(format!(
            "bad archive magic {:?}",
            String::from_utf8_lossy(&magic)
        )));
    }
    restore_node(input, target)
}

fn restore_node(input: &mut impl Read, target: &Path) -> Result<(), NarError> {
    expect_token(input, "(")?;
    expect_token(input, "type")?;

    let kind = read_bytes(input)?;
    match kind.as_slice() {
        b"regular" => {
            let mut token = read_bytes(input)?;
            let mut executable = false;
            if token == b"executable" {
                executable = true;
                // Executable marker carries an empty payload.
                let empty = read_bytes(input)?;
                if !empty.is_empty() {
                    return Err(NarError::Malformed("non-empty executable marker".into()));
                }
                token = read_bytes(input)?;
            }
            if token != b"contents" {
                return Err(NarError::Malformed(format!(
                    "expected 'contents', got {:?}",
                    String::from_utf8_lossy(&token)
                )));
            }
            let contents = read_bytes(input)?;
            fs::write(target, &contents).map_err(|e| NarError::io(target, e))?;
            let mode = if executable { 0o555 } else { 0o444 };
            fs::set_permissions(target, fs::Permissions::from_mode(mode))
                .map_err(|e| NarError::io(target, e))?;
        }
        b"symlink" => {
            expect_token(input, "target")?;
            let link_target = read_bytes(input)?;
            let link_target = std::str::from_utf8(&link_target)
                .map_err(|_| NarError::Malformed("symlink target is not UTF-8".into()))?;
            std::os::unix::fs::symlink(link_target, target)
                .map_err(|e| NarError::io(target, e))?;
        }
        b"directory" => {
            fs::create_dir(target).map_err(|e| NarError::io(target, e))?;
            let mut prev_name: Option<Vec<u8>> = None;
            loop {
                let token = read_bytes(input)?;
                if token == b")" {
                    fs::set_permissions(target, fs::Permissions::from_mode(0o555))
                        .map_err(|e| NarError::io(target, e))?;
                    return Ok(());
                }
                if token != b"entry" {
                    return Err(NarError::Malformed(format!(
                        "expected 'entry', got {:?}",
                        String::from_utf8_lossy(&token)
                    )));
                }
                expect_token(input, "(")?;
                expect_token(input, "name")?;
                let name = read_bytes(input)?;
                if name.is_empty()
                    || name == b"."
                    || name == b".."
                    || name.contains(&b'/')
                    || name.contains(&0)
                {
                    return Err(NarError::InvalidEntryName(
                        String::from_utf8_lossy(&name).into_owned(),
                    ));
                }
                if let Some(prev) = &prev_name {
                    if prev >= &name {
                        return Err(NarError::Malformed(
                            "directory entries are not sorted".into(),
                        ));
                    }
                }
                prev_name = Some(name.clone());

                expect_token(input, "node")?;
                let child = target.join(String::from_utf8_lossy(&name).as_ref());
                restore_node(input, &child)?;
                expect_token(input, ")")?;
            }
        }
        other => {
            return Err(NarError::Malformed(format!(
                "unknown node type {:?}",
                String::from_utf8_lossy(other)
            )));
        }
    }

    expect_token(input, ")")?;
    Ok(())
}

fn read_bytes(input: &mut impl Read) -> Result<Vec<u8>, NarError> {
    let mut len_buf = [0u8; 8];
    input
        .read_exact(&mut len_buf)
        .map_err(|_| NarError::UnexpectedEof)?;
    let len = u64::from_le_bytes(len_buf);
    if len > 1 << 40 {
        return Err(NarError::Malformed(format!("implausible token length {len}")));
    }

    let mut data = vec![0u8; len as usize];
    input.read_exact(&mut data).map_err(|_| NarError::UnexpectedEof)?;

    let rem = (len % 8) as usize;
    if rem != 0 {
        let mut pad = [0u8; 8];
        input
            .read_exact(&mut pad[..8 - rem])
            .map_err(|_| NarError::UnexpectedEof)?;
        if pad[..8 - rem].iter().any(|&b| b != 0) {
            return Err(NarError::Malformed("non-zero padding".into()));
        }
    }
    Ok(data)
}

fn expect_token(input: &mut impl Read, expected: &str) -> Result<(), NarError> {
    let token = read_bytes(input)?;
    if token != expected.as_bytes() {
        return Err(NarError::Malformed(format!(
            "expected {:?}, got {:?}",
            expected,
            String::from_utf8_lossy(&token)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::dump_path_to_vec;
    use std::os::unix::fs::symlink;

    #[test]
    fn test_restore_tree() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().join("root");
        fs::create_dir(&root).unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/file"), "data").unwrap();
        fs::write(root.join("tool"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(root.join("tool"), fs::Permissions::from_mode(0o755)).unwrap();
        symlink("sub/file", root.join("link")).unwrap();

        let nar = dump_path_to_vec(&root).unwrap();

        let restored = dir.path().join("restored");
        restore(&mut nar.as_slice(), &restored).unwrap();

        assert_eq!(fs::read_to_string(restored.join("sub/file")).unwrap(), "data");
        assert_eq!(fs::read_link(restored.join("link")).unwrap().to_str(), Some("sub/file"));
        let mode = fs::metadata(restored.join("tool")).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0, "executable bit must survive");

        // The restored tree re-dumps to the identical archive.
        assert_eq!(dump_path_to_vec(&restored).unwrap(), nar);
    }

    #[test]
    fn test_restore_rejects_bad_magic() {
        let mut data: &[u8] = b"\x03\0\0\0\0\0\0\0bad\0\0\0\0\0";
        let dir = tempfile::TempDir::new().unwrap();
        assert!(restore(&mut data, &dir.path().join("x")).is_err());
    }

    #[test]
    fn test_restore_rejects_traversal() {
        // Hand-build an archive with an entry named "..".
        let mut nar = Vec::new();
        for token in ["nix-archive-1", "(", "type", "directory", "entry", "(", "name", ".."] {
            nar.extend_from_slice(&(token.len() as u64).to_le_bytes());
            nar.extend_from_slice(token.as_bytes());
            let rem = token.len() % 8;
            if rem != 0 {
                nar.extend_from_slice(&vec![0u8; 8 - rem]);
            }
        }
        let dir = tempfile::TempDir::new().unwrap();
        let err = restore(&mut nar.as_slice(), &dir.path().join("x")).unwrap_err();
        assert!(matches!(err, NarError::InvalidEntryName(_)));
    }
}
