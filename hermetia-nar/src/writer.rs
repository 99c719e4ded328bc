// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! NAR encoding of a filesystem tree.
//!
//! Wire format: every token is a length-prefixed string, 64-bit
//! little-endian length followed by the bytes, zero-padded to an 8-byte
//! boundary. A tree serialises as
//!
//! ```text
//! "nix-archive-1" node
//! node     = "(" "type" kind ... ")"
//! regular  = "regular" [ "executable" "" ] "contents" <bytes>
//! symlink  = "symlink" "target" <target>
//! directory = "directory" { "entry" "(" "name" <name> "node" node ")" }
//! ```
//!
//! Directory entries are emitted in byte-wise sorted order.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::Path;

use crate::NarError;

const NAR_MAGIC: &str = "nix-archive-1";

/// Serialise the tree at `path` into `out`.
pub fn dump_path(path: &Path, out: &mut impl Write) -> Result<(), NarError> {
    write_str(out, NAR_MAGIC).map_err(|e| NarError::io(path, e))?;
    dump_node(path, out)
}

/// Serialise the tree at `path` into a buffer.
pub fn dump_path_to_vec(path: &Path) -> Result<Vec<u8>, NarError> {
    let mut out = Vec::new();
    dump_path(path, &mut out)?;
    Ok(out)
}

fn dump_node(path: &Path, out: &mut impl Write) -> Result<(), NarError> {
    let io = |e| NarError::io(path, e);
    let meta = fs::symlink_metadata(path).map_err(io)?;
    let file_type = meta.file_type();

    write_str(out, "(").map_err(io)?;
    write_str(out, "type").map_err(io)?;

    if file_type.is_file() {
        write_str(out, "regular").map_err(io)?;
        if meta.permissions().mode() & 0o111 != 0 {
            write_str(out, "executable").map_err(io)?;
            write_str(out, "").map_err(io)?;
        }
        write_str(out, "contents").map_err(io)?;
        write_file_contents(path, meta.len(), out)?;
    } else if file_type.is_symlink() {
        write_str(out, "symlink").map_err(io)?;
        write_str(out, "target").map_err(io)?;
        let target = fs::read_link(path).map_err(io)?;
        write_bytes(out, target.as_os_str().as_encoded_bytes()).map_err(io)?;
    } else if file_type.is_dir() {
        write_str(out, "directory").map_err(io)?;

        let mut entries: Vec<(Vec<u8>, std::path::PathBuf)> = fs::read_dir(path)
            .map_err(io)?
            .map(|entry| {
                let entry = entry.map_err(|e| NarError::io(path, e))?;
                Ok((
                    entry.file_name().as_encoded_bytes().to_vec(),
                    entry.path(),
                ))
            })
            .collect::<Result<_, NarError>>()?;
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, child) in entries {
            if name.contains(&b'/') || name == b"." || name == b".." {
                return Err(NarError::InvalidEntryName(
                    String::from_utf8_lossy(&name).into_owned(),
                ));
            }
            write_str(out, "entry").map_err(io)?;
            write_str(out, "(").map_err(io)?;
            write_str(out, "name").map_err(io)?;
            write_bytes(out, &name).map_err(io)?;
            write_str(out, "node").map_err(io)?;
            dump_node(&child, out)?;
            write_str(out, ")").map_err(io)?;
        }
    } else if file_type.is_fifo() || file_type.is_socket() || file_type.is_block_device() {
        return Err(NarError::UnsupportedFileType(path.to_path_buf()));
    } else {
        return Err(NarError::UnsupportedFileType(path.to_path_buf()));
    }

    write_str(out, ")").map_err(io)?;
    Ok(())
}

fn write_file_contents(path: &Path, len: u64, out: &mut impl Write) -> Result<(), NarError> {
    let io = |e| NarError::io(path, e);
    out.write_all(&len.to_le_bytes()).map_err(io)?;

    let mut file = fs::File::open(path).map_err(io)?;
    let mut buf = [0u8; 64 * 1024];
    let mut written: u64 = 0;
    loop {
        let n = file.read(&mut buf).map_err(io)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).map_err(io)?;
        written += n as u64;
    }
    // The declared length came from metadata; a file changing size mid-dump
    // would corrupt the framing.
    if written != len {
        return Err(NarError::io(
            path,
            std::io::Error::other(format!("file changed size during dump: {written} != {len}")),
        ));
    }
    write_padding(out, len).map_err(io)?;
    Ok(())
}

fn write_str(out: &mut impl Write, s: &str) -> std::io::Result<()> {
    write_bytes(out, s.as_bytes())
}

fn write_bytes(out: &mut impl Write, bytes: &[u8]) -> std::io::Result<()> {
    out.write_all(&(bytes.len() as u64).to_le_bytes())?;
    out.write_all(bytes)?;
    write_padding(out, bytes.len() as u64)
}

fn write_padding(out: &mut impl Write, len: u64) -> std::io::Result<()> {
    let rem = (len % 8) as usize;
    if rem != 0 {
        out.write_all(&[0u8; 8][..8 - rem])?;
    }
    Ok(())
}
