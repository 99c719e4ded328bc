// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Placeholders for store paths that are not yet known.
//!
//! A placeholder is a fixed-length opaque string that stands in for an
//! output path in a derivation's env and args. The builder environment is
//! produced by rewriting placeholders to concrete scratch paths; outputs
//! are rewritten back during ingestion.

use std::fmt;

use crate::base32;
use crate::derivation::OutputName;
use crate::hash::{self, Algorithm, Hash};
use crate::store_path::{STORE_PATH_DIGEST_BYTES, StorePath, StorePathDigest};

/// A placeholder for a store path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Placeholder {
    hash: Vec<u8>,
}

impl Placeholder {
    fn new(hash: Hash) -> Self {
        Self {
            hash: hash.as_bytes().to_vec(),
        }
    }

    /// Render the placeholder the way it appears in derivation text: a
    /// slash followed by the base32 digest.
    pub fn render(&self) -> String {
        format!("/{}", base32::encode(&self.hash))
    }

    /// Placeholder for one of the building derivation's own outputs
    /// (`$out` and friends before their path is known).
    pub fn standard_output(output_name: &OutputName) -> Self {
        Self::new(hash::digest(
            Algorithm::Sha256,
            format!("nix-output:{output_name}"),
        ))
    }

    /// Placeholder for a content-addressed output of an upstream
    /// derivation, usable before that derivation has been built.
    pub fn ca_output(drv_path: &StorePath, output_name: &OutputName) -> Self {
        let drv_name = drv_path.name().as_str();
        let drv_name = drv_name.strip_suffix(".drv").unwrap_or(drv_name);
        let output_path_name = if output_name.is_default() {
            drv_name.to_string()
        } else {
            format!("{drv_name}-{output_name}")
        };
        Self::new(hash::digest(
            Algorithm::Sha256,
            format!(
                "nix-upstream-output:{}:{}",
                drv_path.digest(),
                output_path_name
            ),
        ))
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// The deferred-output digest: derived from the derivation identity and the
/// output name, truncated to store-path digest width. Used as the digest of
/// scratch paths for outputs whose final path is not yet known.
pub fn deferred_output_digest(drv_hash: &Hash, output_name: &OutputName) -> StorePathDigest {
    let mut ctx = hash::HashContext::new(Algorithm::Sha256);
    ctx.update(drv_hash.as_bytes());
    ctx.update(b":");
    ctx.update(output_name.as_str().as_bytes());
    let mut out = [0u8; STORE_PATH_DIGEST_BYTES];
    for (i, &b) in ctx.finish().as_bytes().iter().enumerate() {
        out[i % STORE_PATH_DIGEST_BYTES] ^= b;
    }
    StorePathDigest::new(out)
}
