// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

use std::collections::BTreeMap;

use crate::content_address::{ContentAddress, ContentAddressMethodAlgorithm};
use crate::store_path::{StoreDir, StorePath, StorePathError, StorePathName, StoreReferences};

use super::OutputName;

/// One declared output of a derivation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DerivationOutput {
    /// The output path was computed from the derivation text up front.
    InputAddressed(StorePath),
    /// Content-addressed with the hash declared in advance; checked after
    /// the build.
    CaFixed(ContentAddress),
    /// Content-addressed with the hash discovered after the build.
    CaFloating(ContentAddressMethodAlgorithm),
    /// An input-addressed output whose path depends on unresolved
    /// content-addressed inputs; resolved to `InputAddressed` later.
    Deferred,
    /// Like floating, but the build may read impure inputs; never cached.
    Impure(ContentAddressMethodAlgorithm),
}

impl DerivationOutput {
    /// The output path, if it is known before building.
    pub fn path(
        &self,
        store_dir: &StoreDir,
        drv_name: &StorePathName,
        output_name: &OutputName,
    ) -> Result<Option<StorePath>, StorePathError> {
        match self {
            DerivationOutput::InputAddressed(store_path) => Ok(Some(store_path.clone())),
            DerivationOutput::CaFixed(ca) => {
                let name = output_path_name(drv_name, output_name)?;
                Ok(Some(store_dir.make_path_from_ca(
                    &name,
                    ca,
                    &StoreReferences::default(),
                )?))
            }
            _ => Ok(None),
        }
    }

    /// The content-address method for outputs that are hashed after the
    /// build.
    pub fn floating_method(&self) -> Option<ContentAddressMethodAlgorithm> {
        match self {
            DerivationOutput::CaFloating(m) | DerivationOutput::Impure(m) => Some(*m),
            _ => None,
        }
    }
}

pub type DerivationOutputs = BTreeMap<OutputName, DerivationOutput>;

pub(crate) fn output_path_name(
    drv_name: &StorePathName,
    output_name: &OutputName,
) -> Result<StorePathName, StorePathError> {
    if output_name.is_default() {
        Ok(drv_name.clone())
    } else {
        format!("{drv_name}-{output_name}").parse()
    }
}
