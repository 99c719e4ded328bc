// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Reference scanning for store path outputs.
//!
//! After a build completes we need to discover which store paths are
//! referenced by the output. [`RefScanSink`] is a streaming scanner fed
//! arbitrary byte chunks (typically from a NAR stream) that finds store
//! path digests.
//!
//! # Algorithm
//!
//! 1. Slide a window of digest width across the input.
//! 2. Validate window characters right-to-left against the base32
//!    alphabet; on an invalid character at offset j, skip j+1 positions.
//! 3. A fully valid window is looked up in a hash set.
//!
//! Most bytes in binary data are not in the base32 alphabet, so the scan
//! runs in O(n/32) amortised, independent of the candidate count.

use std::collections::{BTreeSet, HashSet};

use hermetia_store_core::base32::BASE32_VALID;
use hermetia_store_core::store_path::{STORE_PATH_DIGEST_CHARS, StorePath};

const DIGEST_LEN: usize = STORE_PATH_DIGEST_CHARS;

/// A streaming reference scanner that finds store path digests in byte
/// data. Feed chunks via [`feed`](Self::feed), then collect results with
/// [`found_paths`](Self::found_paths).
pub struct RefScanSink {
    /// Digests still being looked for; moved to `seen` on match.
    pending: HashSet<[u8; DIGEST_LEN]>,
    seen: HashSet<[u8; DIGEST_LEN]>,
    /// Map from digest bytes back to the store path for result building.
    back_map: Vec<([u8; DIGEST_LEN], StorePath)>,
    /// Tail bytes from the previous chunk for boundary matching.
    tail: Vec<u8>,
}

impl RefScanSink {
    /// `candidates` is the set of store paths to search for (typically the
    /// build inputs); `self_path` detects self-references.
    pub fn new(candidates: &BTreeSet<StorePath>, self_path: Option<&StorePath>) -> Self {
        let mut pending = HashSet::with_capacity(candidates.len() + 1);
        let mut back_map = Vec::with_capacity(candidates.len() + 1);

        for sp in candidates.iter().chain(self_path) {
            let digest = digest_bytes(sp);
            if pending.insert(digest) {
                back_map.push((digest, sp.clone()));
            }
        }

        Self {
            pending,
            seen: HashSet::new(),
            back_map,
            tail: Vec::with_capacity(DIGEST_LEN),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        if self.pending.is_empty() {
            return;
        }

        let tail_len = data.len().min(DIGEST_LEN);

        // Search the overlap region: old tail plus the start of new data.
        if !self.tail.is_empty() {
            let mut overlap = self.tail.clone();
            overlap.extend_from_slice(&data[..tail_len]);
            search(&overlap, &mut self.pending, &mut self.seen);
        }

        search(data, &mut self.pending, &mut self.seen);

        // Rebuild the tail: keep at most DIGEST_LEN trailing bytes.
        let rest = DIGEST_LEN - tail_len;
        if rest < self.tail.len() {
            self.tail.drain(..self.tail.len() - rest);
        }
        self.tail.extend_from_slice(&data[data.len() - tail_len..]);
    }

    pub fn found_paths(&self) -> BTreeSet<StorePath> {
        self.back_map
            .iter()
            .filter(|(digest, _)| self.seen.contains(digest))
            .map(|(_, path)| path.clone())
            .collect()
    }
}

fn digest_bytes(sp: &StorePath) -> [u8; DIGEST_LEN] {
    let s = sp.digest_string();
    let mut buf = [0u8; DIGEST_LEN];
    buf.copy_from_slice(s.as_bytes());
    buf
}

/// Scan `data` for valid base32 windows of digest width, with
/// Boyer-Moore-style skipping on invalid characters.
#[inline]
fn search(
    data: &[u8],
    pending: &mut HashSet<[u8; DIGEST_LEN]>,
    seen: &mut HashSet<[u8; DIGEST_LEN]>,
) {
    if data.len() < DIGEST_LEN {
        return;
    }

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

        let window: [u8; DIGEST_LEN] = data[i..i + DIGEST_LEN]
            .try_into()
            .expect("window width matches digest width");
        if pending.remove(&window) {
            seen.insert(window);
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_digest_in_text() {
        let input: StorePath = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-input".parse().unwrap();
        let data = format!(
            "some content /nix/store/{}-input more stuff",
            input.digest_string()
        );

        let mut sink = RefScanSink::new(&BTreeSet::from([input.clone()]), None);
        sink.feed(data.as_bytes());
        assert!(sink.found_paths().contains(&input));
    }

    #[test]
    fn test_finds_self_reference() {
        let self_path: StorePath = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-self".parse().unwrap();
        let data = format!(
            "#!/bin/sh\nexec /nix/store/{}-self/bin/real \"$@\"",
            self_path.digest_string()
        );

        let mut sink = RefScanSink::new(&BTreeSet::new(), Some(&self_path));
        sink.feed(data.as_bytes());
        assert!(sink.found_paths().contains(&self_path));
    }

    #[test]
    fn test_no_false_positive() {
        let input: StorePath = "cccccccccccccccccccccccccccccccc-x".parse().unwrap();
        let mut sink = RefScanSink::new(&BTreeSet::from([input.clone()]), None);
        sink.feed(b"completely unrelated binary \x00\x01\x02 data");
        assert!(sink.found_paths().is_empty());
    }

    /// Feed data in every possible chunk size to verify the tail logic
    /// handles digests spanning chunk boundaries.
    #[test]
    fn test_scan_across_chunk_boundary() {
        let input: StorePath = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-test".parse().unwrap();
        let content = format!("prefix{}suffix", input.digest_string());
        let bytes = content.as_bytes();

        for chunk_size in 1..=bytes.len() {
            let mut sink = RefScanSink::new(&BTreeSet::from([input.clone()]), None);
            for chunk in bytes.chunks(chunk_size) {
                sink.feed(chunk);
            }
            assert!(
                sink.found_paths().contains(&input),
                "missed reference at chunk_size={chunk_size}"
            );
        }
    }
}
