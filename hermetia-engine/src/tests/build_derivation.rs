// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! End-to-end build tests: drive derivations through the scheduler and
//! check what lands in the store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use hermetia_store_core::content_address::{ContentAddress, FileIngestionMethod};
use hermetia_store_core::derivation::{DerivationOutput, OutputName};
use hermetia_store_core::hash::{Algorithm, digest};

use crate::build_result::BuildStatus;
use crate::error::BuildError;
use crate::substituter::LocalBinaryCache;

use super::test_store::{TestStore, sh_derivation, sh_derivation_with, write_derivation};

#[tokio::test(flavor = "multi_thread")]
async fn test_build_single_output() {
    let ts = TestStore::new();
    let mut worker = ts.worker();

    let (drv_path, drv) = sh_derivation(&ts, "hello", "echo hello > $out");
    let result = worker.realise(drv_path, Some(drv)).await.unwrap();

    assert_eq!(result.status, BuildStatus::Built, "{:?}", result.error);
    assert_eq!(result.times_built, 1);

    let out_path = &result.built_outputs[&OutputName::default()].out_path;
    let disk_path = ts.store.to_real_path(out_path);
    assert!(disk_path.exists(), "output should exist on disk");
    assert_eq!(std::fs::read_to_string(&disk_path).unwrap().trim(), "hello");

    assert!(ts.store.is_valid_path(out_path).await.unwrap());
    let info = ts.store.query_path_info(out_path).await.unwrap().unwrap();
    assert!(info.nar_size > 0);
    assert!(info.deriver.is_some());

    // Hash consistency: re-hashing the stored NAR reproduces the
    // registered hash.
    ts.store.verify_path(out_path).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_build_is_already_valid() {
    let ts = TestStore::new();
    let mut worker = ts.worker();

    let (drv_path, drv) = sh_derivation(&ts, "stable", "echo stable > $out");
    let first = worker
        .realise(drv_path.clone(), Some(drv.clone()))
        .await
        .unwrap();
    assert_eq!(first.status, BuildStatus::Built);

    // A fresh worker sees the outputs as valid without building.
    let mut worker = ts.worker();
    let second = worker.realise(drv_path, Some(drv)).await.unwrap();
    assert_eq!(second.status, BuildStatus::AlreadyValid);
    assert_eq!(second.times_built, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_trivial_fixed_output() {
    let ts = TestStore::new();
    let mut worker = ts.worker();

    let declared = digest(Algorithm::Sha256, "hi");
    let (drv_path, drv) = sh_derivation_with(&ts, "hello", "printf hi > $out", |drv| {
        drv.outputs.insert(
            OutputName::default(),
            DerivationOutput::CaFixed(ContentAddress::Fixed {
                method: FileIngestionMethod::Flat,
                hash: declared.clone(),
            }),
        );
    });

    let result = worker.realise(drv_path, Some(drv)).await.unwrap();
    assert_eq!(result.status, BuildStatus::Built, "{:?}", result.error);

    let out_path = &result.built_outputs[&OutputName::default()].out_path;
    assert!(
        out_path.to_string().ends_with("-hello"),
        "path name keeps the derivation name: {out_path}"
    );

    // The NAR hash is the hash of the canonical serialisation of a
    // regular file with contents "hi".
    let info = ts.store.query_path_info(out_path).await.unwrap().unwrap();
    let nar = hermetia_nar::dump_path_to_vec(&ts.store.to_real_path(out_path)).unwrap();
    assert_eq!(digest(Algorithm::Sha256, &nar), info.nar_hash);
    assert_eq!(
        info.ca,
        Some(ContentAddress::Fixed {
            method: FileIngestionMethod::Flat,
            hash: declared,
        })
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fixed_output_hash_mismatch() {
    let ts = TestStore::new();
    let mut worker = ts.worker();

    let zeros = hermetia_store_core::hash::Hash::parse(
        "sha256:0000000000000000000000000000000000000000000000000000000000000000",
    )
    .unwrap();
    let (drv_path, drv) = sh_derivation_with(&ts, "liar", "printf hi > $out", |drv| {
        drv.outputs.insert(
            OutputName::default(),
            DerivationOutput::CaFixed(ContentAddress::Fixed {
                method: FileIngestionMethod::Flat,
                hash: zeros,
            }),
        );
    });
    let expected_path = drv.outputs[&OutputName::default()]
        .path(ts.store_dir(), &drv.name, &OutputName::default())
        .unwrap()
        .unwrap();

    let result = worker.realise(drv_path, Some(drv)).await.unwrap();
    assert!(matches!(result.error, Some(BuildError::HashMismatch { .. })));

    // Nothing was registered and the scratch output is gone.
    assert!(!ts.store.is_valid_path(&expected_path).await.unwrap());
    assert!(!ts.store.to_real_path(&expected_path).exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_input_addressed_chain() {
    let ts = TestStore::new();
    let mut worker = ts.worker();

    let (a_drv_path, a_drv) = sh_derivation(&ts, "dep-a", "echo payload-from-a > $out");
    let a_out = match &a_drv.outputs[&OutputName::default()] {
        DerivationOutput::InputAddressed(path) => path.clone(),
        other => panic!("unexpected output {other:?}"),
    };
    write_derivation(&ts, &a_drv).await;

    let a_out_full = ts.store_dir().display_path(&a_out);
    let (b_drv_path, b_drv) = sh_derivation_with(
        &ts,
        "user-b",
        "IFS= read -r line < \"$dep\"; printf 'from %s\\n%s\\nvia-b\\n' \"$dep\" \"$line\" > $out",
        |drv| {
            drv.env.insert("dep".into(), a_out_full.clone());
            drv.input_drvs
                .insert(a_drv_path.clone(), BTreeSet::from([OutputName::default()]));
        },
    );

    // Build B cold: A must be built first.
    let result = worker.realise(b_drv_path, Some(b_drv)).await.unwrap();
    assert_eq!(result.status, BuildStatus::Built, "{:?}", result.error);

    assert!(ts.store.is_valid_path(&a_out).await.unwrap(), "A built first");
    let b_out = &result.built_outputs[&OutputName::default()].out_path;
    let contents = std::fs::read_to_string(ts.store.to_real_path(b_out)).unwrap();
    assert!(contents.contains("payload-from-a"));

    // B's output references A's path (the scanner found the digest), and
    // the closure is closed: every reference is itself valid.
    let info = ts.store.query_path_info(b_out).await.unwrap().unwrap();
    assert!(
        info.references.contains(&a_out),
        "B references A: {:?}",
        info.references
    );
    let closure = ts.store.compute_closure(b_out).await.unwrap();
    assert!(closure.contains(&a_out));
    for path in &closure {
        assert!(ts.store.is_valid_path(path).await.unwrap());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dependency_failure_propagation() {
    let ts = TestStore::new();
    let mut worker = ts.worker();

    let (a_drv_path, a_drv) = sh_derivation(&ts, "failing-dep", "exit 1");
    write_derivation(&ts, &a_drv).await;

    let counter = ts.scratch_file("b-was-invoked");
    let (b_drv_path, b_drv) = sh_derivation_with(
        &ts,
        "dependent",
        "echo ran >> $counter; echo out > $out",
        |drv| {
            drv.env
                .insert("counter".into(), counter.to_string_lossy().into_owned());
            drv.input_drvs
                .insert(a_drv_path.clone(), BTreeSet::from([OutputName::default()]));
        },
    );

    let result = worker.realise(b_drv_path, Some(b_drv)).await.unwrap();
    assert_eq!(result.status, BuildStatus::DependencyFailed);
    assert!(matches!(result.error, Some(BuildError::DependencyFailed(_))));
    assert!(
        !counter.exists(),
        "the dependent builder must never have been invoked"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_build_timeout_preempts() {
    let ts = TestStore::new();
    let mut worker = ts.worker();

    let (drv_path, drv) =
        sh_derivation_with(&ts, "slow", "/bin/sleep 60; echo done > $out", |drv| {
            drv.options.build_timeout = Some(Duration::from_millis(200));
        });

    let started = std::time::Instant::now();
    let result = worker.realise(drv_path, Some(drv)).await.unwrap();
    assert_eq!(result.status, BuildStatus::TimedOut);
    assert_eq!(result.error, Some(BuildError::Timeout));
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "the builder must be killed within a bounded grace period"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_max_silent_time() {
    let ts = TestStore::new();
    let mut worker = ts.worker();

    let (drv_path, drv) = sh_derivation_with(&ts, "silent", "/bin/sleep 60", |drv| {
        drv.options.max_silent_time = Some(Duration::from_millis(200));
    });

    let result = worker.realise(drv_path, Some(drv)).await.unwrap();
    assert_eq!(result.status, BuildStatus::TimedOut);
    assert_eq!(result.error, Some(BuildError::SilentTimeout));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_determinism_detected() {
    let ts = TestStore::with_config(|config| config.nr_repeats = 1);
    let mut worker = ts.worker();

    // The PID differs between rounds, so the output differs.
    let (drv_path, drv) = sh_derivation(&ts, "flaky", "echo $$ > $out");
    let result = worker.realise(drv_path, Some(drv)).await.unwrap();

    assert_eq!(result.status, BuildStatus::NotDeterministic);
    assert!(result.is_non_deterministic);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deterministic_build_passes_repeat() {
    let ts = TestStore::with_config(|config| config.nr_repeats = 1);
    let mut worker = ts.worker();

    let (drv_path, drv) = sh_derivation(&ts, "steady", "echo fixed > $out");
    let result = worker.realise(drv_path, Some(drv)).await.unwrap();

    assert_eq!(result.status, BuildStatus::Built, "{:?}", result.error);
    assert_eq!(result.times_built, 2);
    assert!(!result.is_non_deterministic);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_keep_failed_preserves_output() {
    let ts = TestStore::with_config(|config| config.keep_failed = true);
    let mut worker = ts.worker();

    let (drv_path, drv) = sh_derivation(&ts, "wreck", "echo partial > $out; exit 1");
    let out_path = match &drv.outputs[&OutputName::default()] {
        DerivationOutput::InputAddressed(path) => path.clone(),
        other => panic!("unexpected output {other:?}"),
    };

    let result = worker.realise(drv_path, Some(drv)).await.unwrap();
    assert!(!result.is_success());
    assert!(matches!(result.error, Some(BuildError::BuilderFailed(_))));

    let disk_path = ts.store.to_real_path(&out_path);
    assert!(!disk_path.exists(), "the canonical path stays clean");
    let failed = disk_path.with_file_name(format!("{out_path}.failed"));
    assert!(failed.exists(), "failed output preserved at {failed:?}");
    assert_eq!(std::fs::read_to_string(&failed).unwrap().trim(), "partial");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_builder_environment() {
    let ts = TestStore::new();
    let mut worker = ts.worker();

    let script = r#"
printf 'HOME=%s\n' "$HOME" > "$out"
printf 'PATH=%s\n' "$PATH" >> "$out"
printf 'TMPDIR=%s\n' "$TMPDIR" >> "$out"
printf 'NIX_BUILD_TOP=%s\n' "$NIX_BUILD_TOP" >> "$out"
printf 'NIX_STORE=%s\n' "$NIX_STORE" >> "$out"
printf 'MY_VAR=%s\n' "$MY_VAR" >> "$out"
printf 'outputs=%s\n' "$outputs" >> "$out"
"#;
    let (drv_path, drv) = sh_derivation_with(&ts, "envtest", script, |drv| {
        drv.env.insert("MY_VAR".into(), "custom_value".into());
        // TMPDIR cannot be overridden; it is set after the derivation env.
        drv.env.insert("TMPDIR".into(), "/should/be/ignored".into());
    });

    let result = worker.realise(drv_path, Some(drv)).await.unwrap();
    assert_eq!(result.status, BuildStatus::Built, "{:?}", result.error);

    let out_path = &result.built_outputs[&OutputName::default()].out_path;
    let content = std::fs::read_to_string(ts.store.to_real_path(out_path)).unwrap();
    let env: std::collections::BTreeMap<&str, &str> = content
        .lines()
        .filter_map(|line| line.split_once('='))
        .collect();

    assert_eq!(env.get("HOME"), Some(&"/homeless-shelter"));
    assert_eq!(env.get("PATH"), Some(&"/path-not-set"));
    assert_eq!(env.get("MY_VAR"), Some(&"custom_value"));
    assert_eq!(env.get("outputs"), Some(&"out"));
    assert_eq!(env.get("NIX_STORE").copied(), Some(ts.store_dir().as_str()));
    assert_ne!(env.get("TMPDIR"), Some(&"/should/be/ignored"));
    assert_eq!(env.get("TMPDIR"), env.get("NIX_BUILD_TOP"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pass_as_file() {
    let ts = TestStore::new();
    let mut worker = ts.worker();

    let script = r#"
        if [ -n "${text+set}" ]; then
            echo "text env var should not be set" >&2
            exit 1
        fi
        if [ ! -f "$textPath" ]; then
            echo "textPath should point at a file" >&2
            exit 1
        fi
        IFS= read -r content < "$textPath"
        printf '%s' "$content" > "$out"
    "#;
    let (drv_path, drv) = sh_derivation_with(&ts, "passfile", script, |drv| {
        drv.env.insert("passAsFile".into(), "text".into());
        drv.env.insert("text".into(), "hello from a file".into());
        drv.options.pass_as_file.insert("text".into());
    });

    let result = worker.realise(drv_path, Some(drv)).await.unwrap();
    assert_eq!(result.status, BuildStatus::Built, "{:?}", result.error);

    let out_path = &result.built_outputs[&OutputName::default()].out_path;
    assert_eq!(
        std::fs::read_to_string(ts.store.to_real_path(out_path)).unwrap(),
        "hello from a file"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_structured_attrs() {
    let ts = TestStore::new();
    let mut worker = ts.worker();

    let script = r#"
        if [ -z "$NIX_ATTRS_JSON_FILE" ] || [ ! -f "$NIX_ATTRS_JSON_FILE" ]; then
            echo "NIX_ATTRS_JSON_FILE missing" >&2
            exit 1
        fi
        if [ -n "${myAttr+set}" ]; then
            echo "individual env vars must not be set in structured mode" >&2
            exit 1
        fi
        IFS= read -r content < "$NIX_ATTRS_JSON_FILE"
        printf '%s' "$content" > "$out"
    "#;
    let (drv_path, drv) = sh_derivation_with(&ts, "sattrs", script, |drv| {
        let mut attrs = serde_json::Map::new();
        attrs.insert("myAttr".into(), serde_json::Value::String("myValue".into()));
        drv.structured_attrs =
            Some(hermetia_store_core::derivation::StructuredAttrs { attrs });
        drv.env.insert("myAttr".into(), "myValue".into());
    });

    let result = worker.realise(drv_path, Some(drv)).await.unwrap();
    assert_eq!(result.status, BuildStatus::Built, "{:?}", result.error);

    let out_path = &result.built_outputs[&OutputName::default()].out_path;
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(ts.store.to_real_path(out_path)).unwrap())
            .unwrap();
    assert_eq!(
        json.get("myAttr").and_then(serde_json::Value::as_str),
        Some("myValue")
    );
    assert!(
        json.get("outputs").and_then(|o| o.get("out")).is_some(),
        "outputs map is injected into the JSON"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disallowed_reference_rejected() {
    let ts = TestStore::new();
    let mut worker = ts.worker();

    let forbidden = ts.add_source("forbidden", "do not link against me").await;
    let forbidden_full = ts.store_dir().display_path(&forbidden);

    let (drv_path, drv) = sh_derivation_with(
        &ts,
        "sneaky",
        "printf 'link: %s' \"$bad\" > $out",
        |drv| {
            drv.env.insert("bad".into(), forbidden_full.clone());
            drv.input_srcs.insert(forbidden.clone());
            drv.options
                .output_checks
                .disallowed_references
                .insert(forbidden_full.clone());
        },
    );

    let result = worker.realise(drv_path, Some(drv)).await.unwrap();
    assert_eq!(result.status, BuildStatus::OutputRejected);
    assert!(matches!(result.error, Some(BuildError::OutputRejected(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cache_hit_substitutes_without_building() {
    let ts = TestStore::new();

    // Build once to populate the cache.
    let counter = ts.scratch_file("builder-invocations");
    let (drv_path, drv) = sh_derivation_with(
        &ts,
        "cachable",
        "echo ran >> $counter; echo artifact > $out",
        |drv| {
            drv.env
                .insert("counter".into(), counter.to_string_lossy().into_owned());
        },
    );
    let mut worker = ts.worker();
    let first = worker
        .realise(drv_path.clone(), Some(drv.clone()))
        .await
        .unwrap();
    assert_eq!(first.status, BuildStatus::Built);
    let out_path = first.built_outputs[&OutputName::default()].out_path.clone();

    let key = hermetia_store_core::signature::generate_key("test-cache-1");
    let cache = LocalBinaryCache::open(
        ts.scratch_file("cache"),
        40,
        ts.store_dir().clone(),
    )
    .unwrap();
    cache.push(&ts.store, &out_path, Some(&key)).await.unwrap();

    // Wipe the artifact locally so substitution has work to do.
    let full = ts.store_dir().display_path(&out_path);
    ts.store.db().lock().await.invalidate_path(&full).unwrap();
    crate::store::remove_path_all(&ts.store.to_real_path(&out_path));

    let ts_trusting = TestStoreWithKeys::trusting(&ts, key.to_public_key().to_string());
    let mut worker = ts_trusting.worker_with_cache(Arc::new(cache));

    let result = worker.realise(drv_path, Some(drv)).await.unwrap();
    assert_eq!(result.status, BuildStatus::Substituted, "{:?}", result.error);

    // Exactly one builder invocation overall: the original build.
    let invocations = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(invocations.lines().count(), 1);
    assert!(ts.store.is_valid_path(&out_path).await.unwrap());
    ts.store.verify_path(&out_path).await.unwrap();
}

/// Helper wrapping a [`TestStore`] with adjusted trust settings while
/// sharing its store and scratch space.
struct TestStoreWithKeys {
    store: Arc<crate::store::LocalStore>,
    config: Arc<crate::config::EngineConfig>,
}

impl TestStoreWithKeys {
    fn trusting(ts: &TestStore, key: String) -> Self {
        let mut config = (*ts.config).clone();
        config.trusted_keys = vec![key];
        config.sigs_needed = 1;
        TestStoreWithKeys {
            store: Arc::clone(&ts.store),
            config: Arc::new(config),
        }
    }

    fn worker_with_cache(
        &self,
        cache: Arc<dyn crate::substituter::Substituter>,
    ) -> crate::scheduler::Worker {
        crate::scheduler::Worker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.config),
            vec![cache],
        )
    }
}
