// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Hash rewriting: bidirectional substitution between placeholder strings
//! and concrete paths inside text, byte streams, and file trees.
//!
//! Two flavours:
//!
//! - [`rewrite_text`] replaces arbitrary-length keys (placeholders to
//!   scratch paths) in environment values and structured attrs.
//! - [`DigestRewriter`] replaces store-path digests (fixed 32-character
//!   keys and values) in binary data. Substitutions are length-preserving,
//!   so they are safe to apply to arbitrary byte streams, and applying the
//!   forward map then the inverse map restores the original stream as long
//!   as the only key occurrences were inserted by the forward pass.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;

use thiserror::Error;

use hermetia_store_core::base32::BASE32_VALID;
use hermetia_store_core::store_path::STORE_PATH_DIGEST_CHARS;

const DIGEST_LEN: usize = STORE_PATH_DIGEST_CHARS;

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("rewrite key '{0}' does not have digest width")]
    KeyLength(String),

    #[error("rewrite value '{0}' does not have digest width")]
    ValueLength(String),
}

/// Replace every occurrence of every key in one left-to-right pass.
/// Longer keys win at the same position so a placeholder is never
/// clobbered by a prefix of itself.
pub fn rewrite_text(input: &str, rewrites: &BTreeMap<String, String>) -> String {
    if rewrites.is_empty() {
        return input.to_string();
    }

    let mut keys: Vec<&String> = rewrites.keys().collect();
    keys.sort_by_key(|k| std::cmp::Reverse(k.len()));

    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    'outer: while i < bytes.len() {
        for key in &keys {
            if !key.is_empty() && bytes[i..].starts_with(key.as_bytes()) {
                out.push_str(&rewrites[*key]);
                i += key.len();
                continue 'outer;
            }
        }
        // Advance one code point; keys are ASCII so a partial char can
        // never start a match.
        let ch_len = utf8_len(bytes[i]);
        out.push_str(&input[i..i + ch_len]);
        i += ch_len;
    }
    out
}

fn utf8_len(first: u8) -> usize {
    match first {
        b if b & 0x80 == 0 => 1,
        b if b & 0xe0 == 0xc0 => 2,
        b if b & 0xf0 == 0xe0 => 3,
        _ => 4,
    }
}

/// A streaming same-length multi-key rewriter over store-path digests.
///
/// Feed chunks with [`push`](Self::push) and flush the held-back tail with
/// [`finish`](Self::finish); the concatenated output has exactly the input
/// length.
#[derive(Clone)]
pub struct DigestRewriter {
    map: HashMap<[u8; DIGEST_LEN], [u8; DIGEST_LEN]>,
    carry: Vec<u8>,
}

impl DigestRewriter {
    pub fn new() -> Self {
        DigestRewriter {
            map: HashMap::new(),
            carry: Vec::new(),
        }
    }

    /// Build from `(from-digest, to-digest)` string pairs, checking width.
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, RewriteError> {
        let mut rewriter = DigestRewriter::new();
        for (from, to) in pairs {
            rewriter.insert(from, to)?;
        }
        Ok(rewriter)
    }

    pub fn insert(&mut self, from: &str, to: &str) -> Result<(), RewriteError> {
        let from: [u8; DIGEST_LEN] = from
            .as_bytes()
            .try_into()
            .map_err(|_| RewriteError::KeyLength(from.to_string()))?;
        let to: [u8; DIGEST_LEN] = to
            .as_bytes()
            .try_into()
            .map_err(|_| RewriteError::ValueLength(to.to_string()))?;
        self.map.insert(from, to);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The inverse rewriter (values mapped back to keys).
    pub fn inverted(&self) -> Self {
        DigestRewriter {
            map: self.map.iter().map(|(k, v)| (*v, *k)).collect(),
            carry: Vec::new(),
        }
    }

    /// Process one chunk, returning the bytes that are safe to emit. Up to
    /// one digest width minus one byte is held back for boundary matches.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.carry.extend_from_slice(chunk);
        self.scan_carry();

        if self.carry.len() < DIGEST_LEN {
            return Vec::new();
        }
        let emit_len = self.carry.len() - (DIGEST_LEN - 1);
        let rest = self.carry.split_off(emit_len);
        std::mem::replace(&mut self.carry, rest)
    }

    /// Flush the held-back tail.
    pub fn finish(mut self) -> Vec<u8> {
        std::mem::take(&mut self.carry)
    }

    /// Rewrite a complete buffer.
    pub fn rewrite_all(&self, data: &mut [u8]) -> bool {
        rewrite_in_place(data, &self.map)
    }

    fn scan_carry(&mut self) {
        let map = std::mem::take(&mut self.map);
        rewrite_in_place(&mut self.carry, &map);
        self.map = map;
    }
}

impl Default for DigestRewriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Single left-to-right pass with the same skip logic as reference
/// scanning; a match is replaced and the scan continues after it.
fn rewrite_in_place(data: &mut [u8], map: &HashMap<[u8; DIGEST_LEN], [u8; DIGEST_LEN]>) -> bool {
    if data.len() < DIGEST_LEN || map.is_empty() {
        return false;
    }

    let mut changed = false;
    let mut i = 0;
    'outer: while i + DIGEST_LEN <= data.len() {
        let mut j = DIGEST_LEN;
        while j > 0 {
            j -= 1;
            if !BASE32_VALID[data[i + j] as usize] {
                i += j + 1;
                continue 'outer;
            }
        }

        let window: [u8; DIGEST_LEN] = data[i..i + DIGEST_LEN].try_into().unwrap();
        if let Some(replacement) = map.get(&window) {
            data[i..i + DIGEST_LEN].copy_from_slice(replacement);
            changed = true;
            i += DIGEST_LEN;
        } else {
            i += 1;
        }
    }
    changed
}

/// Rewrite digests inside every regular file and symlink target under
/// `path`. Only artifacts the builder produced in its scratch locations
/// are ever passed here. Returns whether anything changed.
pub fn rewrite_tree(path: &Path, rewriter: &DigestRewriter) -> io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    if rewriter.is_empty() {
        return Ok(false);
    }

    let meta = std::fs::symlink_metadata(path)?;
    let mut changed = false;

    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(path)?;
        let target_str = target.to_string_lossy();
        let mut bytes = target_str.as_bytes().to_vec();
        if rewriter.rewrite_all(&mut bytes) {
            let new_target = String::from_utf8_lossy(&bytes).into_owned();
            std::fs::remove_file(path)?;
            std::os::unix::fs::symlink(new_target, path)?;
            changed = true;
        }
    } else if meta.is_file() {
        let mut contents = std::fs::read(path)?;
        if rewriter.rewrite_all(&mut contents) {
            // Scratch outputs can already be read-only; lift that for the
            // in-place write and restore the mode afterwards.
            let mode = meta.permissions().mode();
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode | 0o200))?;
            std::fs::write(path, &contents)?;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
            changed = true;
        }
    } else if meta.is_dir() {
        for entry in std::fs::read_dir(path)? {
            changed |= rewrite_tree(&entry?.path(), rewriter)?;
        }
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const KEY_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const VAL_A: &str = "cccccccccccccccccccccccccccccccc";
    const VAL_B: &str = "dddddddddddddddddddddddddddddddd";

    fn rewriter() -> DigestRewriter {
        DigestRewriter::from_pairs([(KEY_A, VAL_A), (KEY_B, VAL_B)]).unwrap()
    }

    #[test]
    fn test_rewrite_text_placeholders() {
        let mut map = BTreeMap::new();
        map.insert("/placeholder-one".to_string(), "/nix/store/xyz-out".to_string());
        let result = rewrite_text("out=/placeholder-one; echo /placeholder-one", &map);
        assert_eq!(result, "out=/nix/store/xyz-out; echo /nix/store/xyz-out");
    }

    #[test]
    fn test_rewrite_all_buffer() {
        let mut data = format!("x{KEY_A}y{KEY_B}z").into_bytes();
        let original_len = data.len();
        assert!(rewriter().rewrite_all(&mut data));
        assert_eq!(data.len(), original_len);
        assert_eq!(data, format!("x{VAL_A}y{VAL_B}z").into_bytes());
    }

    #[test]
    fn test_rejects_wrong_width() {
        assert!(DigestRewriter::from_pairs([("short", VAL_A)]).is_err());
        assert!(DigestRewriter::from_pairs([(KEY_A, "short")]).is_err());
    }

    #[test]
    fn test_streaming_matches_buffered() {
        let data = format!("header {KEY_A} middle {KEY_B} trailer").into_bytes();

        let mut expected = data.clone();
        rewriter().rewrite_all(&mut expected);

        for chunk_size in 1..=data.len() {
            let mut rw = rewriter();
            let mut out = Vec::new();
            for chunk in data.chunks(chunk_size) {
                out.extend_from_slice(&rw.push(chunk));
            }
            out.extend_from_slice(&rw.finish());
            assert_eq!(out, expected, "divergence at chunk_size={chunk_size}");
        }
    }

    #[test]
    fn test_forward_then_inverse_is_identity() {
        // Placeholder bijection: on streams whose only key occurrences
        // were inserted by the forward pass, the inverse restores the
        // original bytes.
        let rw = rewriter();
        let inverse = rw.inverted();

        let mut data = format!("binary\x00data {KEY_A} with {KEY_B} and junk \x7f").into_bytes();
        data.push(0x80);
        let original = data.clone();

        rw.rewrite_all(&mut data);
        assert_ne!(data, original);
        inverse.rewrite_all(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_rewrite_tree() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().join("out");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("file"), format!("ref: /nix/store/{KEY_A}-dep")).unwrap();
        std::os::unix::fs::symlink(
            format!("/nix/store/{KEY_B}-dep/bin/tool"),
            root.join("link"),
        )
        .unwrap();

        assert!(rewrite_tree(&root, &rewriter()).unwrap());

        let contents = std::fs::read_to_string(root.join("file")).unwrap();
        assert_eq!(contents, format!("ref: /nix/store/{VAL_A}-dep"));
        let target = std::fs::read_link(root.join("link")).unwrap();
        assert_eq!(
            target.to_string_lossy(),
            format!("/nix/store/{VAL_B}-dep/bin/tool")
        );
    }
}
