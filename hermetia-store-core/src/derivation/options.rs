// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Derivation build-time options.
//!
//! These options control sandboxing, reference checking, substitution, and
//! build locality. They are derived from the derivation's environment
//! attributes (the `__`-prefixed and well-known names), so the canonical
//! ATerm text stays the single source of identity.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Requested isolation level for a build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    Disabled,
    #[default]
    Enabled,
    /// Sandboxed, but `impureHostDeps` are honoured.
    Relaxed,
}

/// Constraints on what outputs can and cannot reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputChecks {
    /// If set, outputs can only reference paths in this list.
    #[serde(default)]
    pub allowed_references: Option<BTreeSet<String>>,

    /// If set, output closures can only contain paths in this list.
    #[serde(default)]
    pub allowed_requisites: Option<BTreeSet<String>>,

    /// Outputs must not reference any path in this list.
    #[serde(default)]
    pub disallowed_references: BTreeSet<String>,

    /// Output closures must not contain any path in this list.
    #[serde(default)]
    pub disallowed_requisites: BTreeSet<String>,
}

impl OutputChecks {
    pub fn is_trivial(&self) -> bool {
        self.allowed_references.is_none()
            && self.allowed_requisites.is_none()
            && self.disallowed_references.is_empty()
            && self.disallowed_requisites.is_empty()
    }
}

/// Build-time options, derived from derivation attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DerivationOptions {
    pub sandbox: SandboxMode,

    /// Whether substituting from other stores is allowed.
    pub allow_substitutes: bool,

    /// Whether this derivation should preferably be built locally even when
    /// remote builders are configured.
    pub prefer_local_build: bool,

    /// System features the building machine must provide.
    pub required_system_features: BTreeSet<String>,

    pub output_checks: OutputChecks,

    /// Maximum time without log output before the build is killed.
    #[serde(with = "opt_secs")]
    pub max_silent_time: Option<Duration>,

    /// Wall-clock cap on the build.
    #[serde(with = "opt_secs")]
    pub build_timeout: Option<Duration>,

    /// Host paths the build may access; only honoured under
    /// [`SandboxMode::Relaxed`].
    pub impure_host_deps: BTreeSet<String>,

    /// Environment variables passed through from the engine's environment.
    /// Only honoured for fixed-output derivations.
    pub impure_env_vars: BTreeSet<String>,

    /// Environment variables whose values are written to files instead.
    pub pass_as_file: BTreeSet<String>,
}

impl Default for DerivationOptions {
    fn default() -> Self {
        DerivationOptions {
            sandbox: SandboxMode::default(),
            allow_substitutes: true,
            prefer_local_build: false,
            required_system_features: BTreeSet::new(),
            output_checks: OutputChecks::default(),
            max_silent_time: None,
            build_timeout: None,
            impure_host_deps: BTreeSet::new(),
            impure_env_vars: BTreeSet::new(),
            pass_as_file: BTreeSet::new(),
        }
    }
}

impl DerivationOptions {
    /// Derive options from the derivation environment. Unknown attributes
    /// are ignored; malformed numeric values fall back to "unset".
    pub fn from_env(env: &BTreeMap<String, String>) -> Self {
        let words = |key: &str| -> BTreeSet<String> {
            env.get(key)
                .map(|v| v.split_whitespace().map(String::from).collect())
                .unwrap_or_default()
        };
        let flag = |key: &str, default: bool| -> bool {
            env.get(key).map(|v| v == "1" || v == "true").unwrap_or(default)
        };
        let secs = |key: &str| -> Option<Duration> {
            env.get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|&n| n > 0)
                .map(Duration::from_secs)
        };

        let sandbox = if flag("__noChroot", false) {
            SandboxMode::Disabled
        } else {
            match env.get("__sandbox").map(String::as_str) {
                Some("relaxed") => SandboxMode::Relaxed,
                Some("false") | Some("disabled") => SandboxMode::Disabled,
                _ => SandboxMode::Enabled,
            }
        };

        let opt_words = |key: &str| -> Option<BTreeSet<String>> {
            env.get(key)
                .map(|v| v.split_whitespace().map(String::from).collect())
        };

        DerivationOptions {
            sandbox,
            allow_substitutes: flag("allowSubstitutes", true),
            prefer_local_build: flag("preferLocalBuild", false),
            required_system_features: words("requiredSystemFeatures"),
            output_checks: OutputChecks {
                allowed_references: opt_words("allowedReferences"),
                allowed_requisites: opt_words("allowedRequisites"),
                disallowed_references: words("disallowedReferences"),
                disallowed_requisites: words("disallowedRequisites"),
            },
            max_silent_time: secs("maxSilentTime"),
            build_timeout: secs("buildTimeout"),
            impure_host_deps: words("__impureHostDeps"),
            impure_env_vars: words("impureEnvVars"),
            pass_as_file: words("passAsFile"),
        }
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
