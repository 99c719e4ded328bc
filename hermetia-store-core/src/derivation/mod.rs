// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! The derivation model: a declarative, hermetic build recipe.
//!
//! A derivation is constructed once and treated as immutable for the
//! duration of a build; its canonical ATerm serialisation (see [`aterm`])
//! defines its identity.

mod options;
mod output;

pub mod aterm;

pub use options::{DerivationOptions, OutputChecks, SandboxMode};
pub use output::{DerivationOutput, DerivationOutputs};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::hash::{self, Algorithm, Hash};
use crate::store_path::{StoreDir, StorePath, StorePathError, StorePathName};

/// The name of one derivation output, e.g. `out` or `dev`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputName(String);

impl OutputName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default(&self) -> bool {
        self.0 == "out"
    }
}

impl Default for OutputName {
    fn default() -> Self {
        OutputName("out".to_string())
    }
}

impl fmt::Display for OutputName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OutputName {
    type Err = StorePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Output names share the store path name charset; they end up as
        // part of a path name.
        let name: StorePathName = s.parse()?;
        Ok(OutputName(name.as_str().to_string()))
    }
}

/// Structured derivation attributes, passed to the builder as a JSON file
/// instead of individual environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredAttrs {
    pub attrs: serde_json::Map<String, serde_json::Value>,
}

/// A parsed derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivation {
    pub name: StorePathName,
    pub outputs: DerivationOutputs,
    /// Input store paths that are sources, not derivation outputs.
    pub input_srcs: BTreeSet<StorePath>,
    /// Input derivations and the outputs requested from each.
    pub input_drvs: BTreeMap<StorePath, BTreeSet<OutputName>>,
    pub platform: String,
    pub builder: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub options: DerivationOptions,
    pub structured_attrs: Option<StructuredAttrs>,
}

impl Derivation {
    /// A fixed-output derivation has exactly one output and that output is
    /// `CaFixed`. Such builds are granted network access.
    pub fn is_fixed_output(&self) -> bool {
        self.outputs.len() == 1
            && self
                .outputs
                .values()
                .next()
                .is_some_and(|o| matches!(o, DerivationOutput::CaFixed(_)))
    }

    /// Whether any output is content-addressed but not fixed up front.
    pub fn has_floating_outputs(&self) -> bool {
        self.outputs.iter().any(|(_, o)| {
            matches!(
                o,
                DerivationOutput::CaFloating(_)
                    | DerivationOutput::Deferred
                    | DerivationOutput::Impure(_)
            )
        })
    }

    /// The path name of an output: `<drv-name>` for `out`,
    /// `<drv-name>-<output>` otherwise.
    pub fn output_path_name(&self, output: &OutputName) -> StorePathName {
        if output.is_default() {
            self.name.clone()
        } else {
            // The combined name stays within the store path charset; only
            // the length limit can bite, which parsing reports.
            format!("{}-{}", self.name, output)
                .parse()
                .unwrap_or_else(|_| self.name.clone())
        }
    }

    /// The canonical textual form; see [`aterm`].
    pub fn canonical_text(&self, store_dir: &StoreDir) -> Result<String, StorePathError> {
        aterm::unparse(store_dir, self)
    }

    /// The derivation identity: SHA-256 of the canonical text.
    pub fn identity_hash(&self, store_dir: &StoreDir) -> Result<Hash, StorePathError> {
        Ok(hash::digest(
            Algorithm::Sha256,
            self.canonical_text(store_dir)?,
        ))
    }

    /// All store paths that must be present before building: sources plus
    /// the input derivation files themselves.
    pub fn reference_inputs(&self) -> BTreeSet<StorePath> {
        let mut set = self.input_srcs.clone();
        set.extend(self.input_drvs.keys().cloned());
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_derivation() -> Derivation {
        let out_path: StorePath = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-demo".parse().unwrap();
        let mut outputs = BTreeMap::new();
        outputs.insert(
            OutputName::default(),
            DerivationOutput::InputAddressed(out_path),
        );
        Derivation {
            name: "demo".parse().unwrap(),
            outputs,
            input_srcs: BTreeSet::new(),
            input_drvs: BTreeMap::new(),
            platform: "x86_64-linux".into(),
            builder: "/bin/sh".into(),
            args: vec!["-c".into(), "echo hi > $out".into()],
            env: BTreeMap::new(),
            options: DerivationOptions::default(),
            structured_attrs: None,
        }
    }

    #[test]
    fn test_output_path_name() {
        let drv = demo_derivation();
        assert_eq!(
            drv.output_path_name(&OutputName::default()).as_str(),
            "demo"
        );
        assert_eq!(
            drv.output_path_name(&"dev".parse().unwrap()).as_str(),
            "demo-dev"
        );
    }

    #[test]
    fn test_identity_is_stable() {
        let store_dir = StoreDir::default();
        let drv = demo_derivation();
        let h1 = drv.identity_hash(&store_dir).unwrap();
        let h2 = drv.clone().identity_hash(&store_dir).unwrap();
        assert_eq!(h1, h2);

        let mut changed = demo_derivation();
        changed.args[1] = "echo bye > $out".into();
        assert_ne!(h1, changed.identity_hash(&store_dir).unwrap());
    }

    #[test]
    fn test_fixed_output_detection() {
        let mut drv = demo_derivation();
        assert!(!drv.is_fixed_output());
        drv.outputs.insert(
            OutputName::default(),
            DerivationOutput::CaFixed(
                "fixed:sha256:248d6a61d20638b8e5c026930c3e6039a33ce45964ff2167f6ecedd419db06c1"
                    .parse()
                    .unwrap(),
            ),
        );
        assert!(drv.is_fixed_output());
    }
}
