// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Scheduler behaviour: coalescing, concurrency limits, failure
//! propagation, and cycle detection.

use std::collections::BTreeSet;

use hermetia_store_core::derivation::OutputName;

use crate::build_result::BuildStatus;
use crate::error::EngineError;

use super::test_store::{TestStore, sh_derivation, sh_derivation_with, write_derivation};

/// At-most-once: ten requests for the same derivation share one goal and
/// the builder runs exactly once; every requester sees the same outputs.
#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_requests_coalesce() {
    let ts = TestStore::new();
    let mut worker = ts.worker();

    let counter = ts.scratch_file("invocations");
    let (drv_path, drv) = sh_derivation_with(
        &ts,
        "shared",
        "echo x >> $counter; echo shared > $out",
        |drv| {
            drv.env
                .insert("counter".into(), counter.to_string_lossy().into_owned());
        },
    );

    let mut goal_ids = Vec::new();
    for i in 0..10 {
        let drv_arg = if i == 0 { Some(drv.clone()) } else { None };
        goal_ids.push(worker.want_derivation(drv_path.clone(), drv_arg).unwrap());
    }
    // One goal per target: every request resolves to the same id.
    assert!(goal_ids.iter().all(|&id| id == goal_ids[0]));

    worker.run(&goal_ids).await.unwrap();

    let reference = worker.result(goal_ids[0]).unwrap().clone();
    assert_eq!(reference.status, BuildStatus::Built, "{:?}", reference.error);
    for &id in &goal_ids {
        let result = worker.result(id).unwrap();
        assert_eq!(result.built_outputs, reference.built_outputs);
    }

    let invocations = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(invocations.lines().count(), 1, "builder ran exactly once");
}

/// `max_build_jobs` bounds concurrency: with 2 slots and 4 builds that
/// record overlap through the filesystem, at most 2 run at a time.
#[tokio::test(flavor = "multi_thread")]
async fn test_local_slot_limit() {
    let ts = TestStore::with_config(|config| config.max_build_jobs = 2);
    let mut worker = ts.worker();

    let trace = ts.scratch_file("trace");
    std::fs::write(&trace, "").unwrap();

    // Each build appends a start marker, sleeps, and appends a stop
    // marker. A slot is only released when the builder exits, so marker
    // order in the trace reflects actual overlap.
    let script = r#"
        echo start >> "$trace"
        /bin/sleep 0.3
        echo stop >> "$trace"
        echo done > $out
    "#;

    let mut wanted = Vec::new();
    for i in 0..4 {
        let (drv_path, drv) = sh_derivation_with(
            &ts,
            &format!("parallel-{i}"),
            script,
            |drv| {
                drv.env
                    .insert("trace".into(), trace.to_string_lossy().into_owned());
            },
        );
        wanted.push(worker.want_derivation(drv_path, Some(drv)).unwrap());
    }

    worker.run(&wanted).await.unwrap();
    for &id in &wanted {
        assert_eq!(worker.result(id).unwrap().status, BuildStatus::Built);
    }

    let mut current = 0i32;
    let mut max_seen = 0i32;
    for line in std::fs::read_to_string(&trace).unwrap().lines() {
        match line.trim() {
            "start" => {
                current += 1;
                max_seen = max_seen.max(current);
            }
            "stop" => current -= 1,
            _ => {}
        }
    }
    assert!(
        max_seen <= 2,
        "at most two builds may overlap, saw {max_seen}"
    );
}

/// Diamond: A ← B, A ← C, (B,C) ← D. A builds first, D last.
#[tokio::test(flavor = "multi_thread")]
async fn test_diamond_ordering() {
    let ts = TestStore::new();
    let mut worker = ts.worker();

    let order = ts.scratch_file("order");
    let record = |name: &str| format!("echo {name} >> $order; echo {name} > $out");
    let with_order = |drv: &mut hermetia_store_core::derivation::Derivation| {
        drv.env
            .insert("order".into(), order.to_string_lossy().into_owned());
    };

    let (a_path, a_drv) = sh_derivation_with(&ts, "diamond-a", &record("a"), with_order);
    write_derivation(&ts, &a_drv).await;

    let (b_path, b_drv) = sh_derivation_with(&ts, "diamond-b", &record("b"), |drv| {
        with_order(drv);
        drv.input_drvs
            .insert(a_path.clone(), BTreeSet::from([OutputName::default()]));
    });
    write_derivation(&ts, &b_drv).await;

    let (c_path, c_drv) = sh_derivation_with(&ts, "diamond-c", &record("c"), |drv| {
        with_order(drv);
        drv.input_drvs
            .insert(a_path.clone(), BTreeSet::from([OutputName::default()]));
    });
    write_derivation(&ts, &c_drv).await;

    let (d_path, d_drv) = sh_derivation_with(&ts, "diamond-d", &record("d"), |drv| {
        with_order(drv);
        drv.input_drvs
            .insert(b_path.clone(), BTreeSet::from([OutputName::default()]));
        drv.input_drvs
            .insert(c_path.clone(), BTreeSet::from([OutputName::default()]));
    });

    let result = worker.realise(d_path, Some(d_drv)).await.unwrap();
    assert_eq!(result.status, BuildStatus::Built, "{:?}", result.error);

    let order_seen: Vec<String> = std::fs::read_to_string(&order)
        .unwrap()
        .lines()
        .map(String::from)
        .collect();
    let position = |name: &str| {
        order_seen
            .iter()
            .position(|l| l == name)
            .unwrap_or_else(|| panic!("{name} never built; order: {order_seen:?}"))
    };
    assert!(position("a") < position("b"));
    assert!(position("a") < position("c"));
    assert!(position("b") < position("d"));
    assert!(position("c") < position("d"));
}

/// A mutual `inputDrvs` cycle is a fatal configuration error detected at
/// scheduling time; no builder ever runs.
#[tokio::test(flavor = "multi_thread")]
async fn test_dependency_cycle_is_fatal() {
    let ts = TestStore::new();
    std::fs::create_dir_all(ts.store_dir().to_path()).unwrap();

    // The two derivation files must name each other, so content
    // addressing is out; plant them at fixed paths.
    let x_path: hermetia_store_core::store_path::StorePath =
        "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-x.drv".parse().unwrap();
    let y_path: hermetia_store_core::store_path::StorePath =
        "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-y.drv".parse().unwrap();

    let counter = ts.scratch_file("cycle-invocations");
    let drv_text = |other: &hermetia_store_core::store_path::StorePath| {
        format!(
            "Derive([(\"out\",\"\",\"\",\"\")],[(\"{}\",[\"out\"])],[],\"{}\",\"/bin/sh\",[\"-c\",\"echo x >> {} ; echo out > $out\"],[])",
            ts.store_dir().display_path(other),
            crate::config::EngineConfig::local_platform(),
            counter.display(),
        )
    };
    std::fs::write(
        ts.store_dir().full_path(&x_path),
        drv_text(&y_path),
    )
    .unwrap();
    std::fs::write(
        ts.store_dir().full_path(&y_path),
        drv_text(&x_path),
    )
    .unwrap();

    let mut worker = ts.worker();
    let goal = worker.want_derivation(x_path.clone(), None).unwrap();
    let err = worker.run(&[goal]).await.unwrap_err();
    assert!(
        matches!(err, EngineError::DependencyCycle(_)),
        "expected a cycle error, got {err}"
    );
    assert!(!counter.exists(), "no build may be attempted");
}

/// With `keep_going` (the default), an unrelated failure does not stop
/// other goals.
#[tokio::test(flavor = "multi_thread")]
async fn test_keep_going_builds_unrelated_goals() {
    let ts = TestStore::new();
    let mut worker = ts.worker();

    let (bad_path, bad_drv) = sh_derivation(&ts, "bad", "exit 1");
    let (good_path, good_drv) = sh_derivation(&ts, "good", "echo fine > $out");

    let bad = worker.want_derivation(bad_path, Some(bad_drv)).unwrap();
    let good = worker.want_derivation(good_path, Some(good_drv)).unwrap();
    worker.run(&[bad, good]).await.unwrap();

    assert!(!worker.result(bad).unwrap().is_success());
    assert_eq!(worker.result(good).unwrap().status, BuildStatus::Built);
}

/// Substitution failure is non-fatal: with a substituter that has
/// nothing, the scheduler falls through to building.
#[tokio::test(flavor = "multi_thread")]
async fn test_substitution_failure_falls_through_to_build() {
    let ts = TestStore::new();

    let empty_cache = crate::substituter::LocalBinaryCache::open(
        ts.scratch_file("empty-cache"),
        40,
        ts.store_dir().clone(),
    )
    .unwrap();
    let mut worker = ts.worker_with_substituters(vec![std::sync::Arc::new(empty_cache)]);

    let (drv_path, drv) = sh_derivation(&ts, "fallthrough", "echo built-anyway > $out");
    let result = worker.realise(drv_path, Some(drv)).await.unwrap();

    assert_eq!(result.status, BuildStatus::Built, "{:?}", result.error);
    let out_path = &result.built_outputs[&OutputName::default()].out_path;
    assert_eq!(
        std::fs::read_to_string(ts.store.to_real_path(out_path))
            .unwrap()
            .trim(),
        "built-anyway"
    );
}
