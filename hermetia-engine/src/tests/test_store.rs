// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Test fixture: a self-contained store backed by an in-memory database
//! and a temporary directory on disk, plus helpers for constructing
//! derivations that run `/bin/sh`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use hermetia_store_core::derivation::{
    Derivation, DerivationOutput, DerivationOptions, OutputName,
};
use hermetia_store_core::hash::Algorithm;
use hermetia_store_core::store_path::{StoreDir, StorePath};

use crate::config::{EngineConfig, SandboxPolicy};
use crate::scheduler::Worker;
use crate::store::{LocalStore, Store};
use crate::substituter::Substituter;

/// A self-contained test store: a temp directory holding the store root
/// and build scratch space, and a fresh in-memory metadata database.
pub struct TestStore {
    pub store: Arc<LocalStore>,
    pub config: Arc<EngineConfig>,
    temp_dir: tempfile::TempDir,
}

impl TestStore {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut EngineConfig)) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("failed to create temp dir");
        let store_dir =
            StoreDir::new(temp_dir.path().join("store")).expect("temp path is absolute");
        let store =
            Arc::new(LocalStore::open_ephemeral(store_dir).expect("failed to open test store"));

        let mut config = EngineConfig {
            store_dir: temp_dir.path().join("store"),
            build_dir: temp_dir.path().join("builds"),
            log_dir: None,
            // Tests run the builder as the current user, unsandboxed.
            sandbox: SandboxPolicy::Disabled,
            build_users_group: None,
            pool_dir: temp_dir.path().join("userpool"),
            max_build_jobs: 4,
            ..Default::default()
        };
        adjust(&mut config);
        std::fs::create_dir_all(&config.build_dir).expect("failed to create build dir");

        TestStore {
            store,
            config: Arc::new(config),
            temp_dir,
        }
    }

    pub fn store_dir(&self) -> &StoreDir {
        self.store.store_dir()
    }

    pub fn worker(&self) -> Worker {
        self.worker_with_substituters(Vec::new())
    }

    pub fn worker_with_substituters(&self, substituters: Vec<Arc<dyn Substituter>>) -> Worker {
        Worker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.config),
            substituters,
        )
    }

    /// A scratch path outside the store, for builder counters and such.
    pub fn scratch_file(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Copy a file into the store as a content-addressed source.
    pub async fn add_source(&self, name: &str, contents: &str) -> StorePath {
        let src = self.temp_dir.path().join(format!("src-{name}"));
        std::fs::write(&src, contents).expect("failed to write source");
        self.store
            .add_to_store(
                &name.parse().expect("valid name"),
                &src,
                hermetia_store_core::content_address::FileIngestionMethod::Recursive,
                Algorithm::Sha256,
                BTreeSet::new(),
            )
            .await
            .expect("failed to add source")
            .path
    }
}

/// An input-addressed derivation running `/bin/sh -c <script>`, with the
/// output path derived from the derivation identity the way the real
/// instantiation front-end would.
pub fn sh_derivation(ts: &TestStore, name: &str, script: &str) -> (StorePath, Derivation) {
    sh_derivation_with(ts, name, script, |_| {})
}

pub fn sh_derivation_with(
    ts: &TestStore,
    name: &str,
    script: &str,
    adjust: impl FnOnce(&mut Derivation),
) -> (StorePath, Derivation) {
    let mut drv = Derivation {
        name: name.parse().expect("valid derivation name"),
        outputs: BTreeMap::new(),
        input_srcs: BTreeSet::new(),
        input_drvs: BTreeMap::new(),
        platform: EngineConfig::local_platform().to_string(),
        builder: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        env: BTreeMap::new(),
        options: DerivationOptions::default(),
        structured_attrs: None,
    };
    adjust(&mut drv);

    // Default output: input-addressed, with the path derived from the
    // derivation identity the way the instantiation front-end does it
    // (hash with a deferred output, then fix the path). Tests that set
    // their own outputs (fixed-CA and friends) keep them.
    if drv.outputs.is_empty() {
        drv.outputs
            .insert(OutputName::default(), DerivationOutput::Deferred);
        let drv_hash = drv
            .identity_hash(ts.store_dir())
            .expect("derivation serialises");
        let out_path = ts.store_dir().make_output_path(
            "out",
            &drv_hash,
            &drv.output_path_name(&OutputName::default()),
        );
        drv.outputs.insert(
            OutputName::default(),
            DerivationOutput::InputAddressed(out_path),
        );
    }

    let drv_path = derivation_path(ts, &drv);
    (drv_path, drv)
}

/// The store path of the derivation file itself (not written to disk;
/// goals receive the derivation inline).
pub fn derivation_path(ts: &TestStore, drv: &Derivation) -> StorePath {
    let text = drv
        .canonical_text(ts.store_dir())
        .expect("derivation serialises");
    let hash = hermetia_store_core::hash::digest(Algorithm::Sha256, &text);
    let name: hermetia_store_core::store_path::StorePathName =
        format!("{}.drv", drv.name).parse().expect("valid drv name");
    ts.store_dir().make_store_path("text", &hash, &name)
}

/// Write the derivation file into the store so goals can load it lazily.
pub async fn write_derivation(ts: &TestStore, drv: &Derivation) -> StorePath {
    let text = drv
        .canonical_text(ts.store_dir())
        .expect("derivation serialises");
    let name: hermetia_store_core::store_path::StorePathName =
        format!("{}.drv", drv.name).parse().expect("valid drv name");
    ts.store
        .add_text_to_store(&name, &text, BTreeSet::new())
        .await
        .expect("failed to store derivation")
}
