// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Signing fingerprints for valid store paths.
//!
//! The fingerprint is what substituter signatures cover:
//!
//! ```text
//! 1;<full-store-path>;<nar-hash>;<nar-size>;<comma-separated-references>
//! ```

use std::collections::BTreeSet;

use thiserror::Error;

use crate::hash::{Algorithm, Hash};
use crate::store_path::{StoreDir, StorePath};

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("NAR hash must be sha256, got {0}")]
    InvalidNarHashAlgorithm(String),
}

/// Build the fingerprint string signed by store keys.
///
/// References must be full store paths in this store; they are rendered in
/// sorted order, which [`BTreeSet`] guarantees.
pub fn fingerprint_path(
    store_dir: &StoreDir,
    store_path: &StorePath,
    nar_hash: &Hash,
    nar_size: u64,
    references: &BTreeSet<StorePath>,
) -> Result<String, FingerprintError> {
    if nar_hash.algorithm() != Algorithm::Sha256 {
        return Err(FingerprintError::InvalidNarHashAlgorithm(
            nar_hash.algorithm().name().to_string(),
        ));
    }

    let refs = references
        .iter()
        .map(|r| store_dir.display_path(r))
        .collect::<Vec<_>>()
        .join(",");

    Ok(format!(
        "1;{};{};{};{}",
        store_dir.display_path(store_path),
        nar_hash.format_base32(),
        nar_size,
        refs
    ))
}
