// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Garbage collection primitives.
//!
//! The engine exposes two operations: delete everything unreachable from
//! the configured roots (`gc`), and delete specific paths (`delete`),
//! optionally ignoring liveness. Policy (root discovery, scheduling of
//! collections) lives outside the engine.

use std::collections::BTreeSet;

use hermetia_store_core::store_path::StorePath;

use crate::store::{LocalStore, Store, StoreError, remove_path_all};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcAction {
    /// Delete everything not reachable from the roots.
    DeleteDead,
    /// Report what would be deleted, without touching anything.
    ReturnDead,
    /// Delete exactly the given paths.
    DeleteSpecific,
}

#[derive(Debug, Clone)]
pub struct GcOptions {
    pub action: GcAction,
    /// Live roots for `DeleteDead` / `ReturnDead`.
    pub roots: BTreeSet<StorePath>,
    /// Targets for `DeleteSpecific`.
    pub paths_to_delete: BTreeSet<StorePath>,
    /// Skip the referrer check when force-deleting.
    pub ignore_liveness: bool,
    /// Stop after freeing this many bytes.
    pub max_freed: Option<u64>,
}

impl Default for GcOptions {
    fn default() -> Self {
        GcOptions {
            action: GcAction::DeleteDead,
            roots: BTreeSet::new(),
            paths_to_delete: BTreeSet::new(),
            ignore_liveness: false,
            max_freed: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct GcResults {
    pub paths: Vec<String>,
    pub bytes_freed: u64,
}

/// Blocking collection pass; run on the blocking pool from async code.
pub fn collect_garbage(store: &LocalStore, options: &GcOptions) -> Result<GcResults, StoreError> {
    let db = store.db();
    let store_dir = store.store_dir().clone();
    let mut results = GcResults::default();

    let dead: Vec<StorePath> = {
        let db_guard = db.blocking_lock();
        match options.action {
            GcAction::DeleteSpecific => {
                if !options.ignore_liveness {
                    for path in &options.paths_to_delete {
                        let full = store_dir.display_path(path);
                        let referrers = db_guard.query_referrers(&full)?;
                        let outside: Vec<_> = referrers
                            .iter()
                            .filter(|r| {
                                store_dir
                                    .parse_path(r)
                                    .map(|p| !options.paths_to_delete.contains(&p) && p != *path)
                                    .unwrap_or(true)
                            })
                            .collect();
                        if !outside.is_empty() {
                            return Err(StoreError::Database(format!(
                                "cannot delete path '{path}': still alive (referred to by {})",
                                outside
                                    .iter()
                                    .map(|s| s.as_str())
                                    .collect::<Vec<_>>()
                                    .join(", ")
                            )));
                        }
                    }
                }
                options.paths_to_delete.iter().cloned().collect()
            }
            GcAction::DeleteDead | GcAction::ReturnDead => {
                // Live set: the closure of the roots.
                let mut live: BTreeSet<String> = BTreeSet::new();
                let mut queue: Vec<String> = options
                    .roots
                    .iter()
                    .map(|r| store_dir.display_path(r))
                    .collect();
                while let Some(current) = queue.pop() {
                    if !live.insert(current.clone()) {
                        continue;
                    }
                    if let Some(info) = db_guard.query_path_info(&current)? {
                        queue.extend(info.references);
                    }
                }

                db_guard
                    .all_valid_paths()?
                    .into_iter()
                    .filter(|p| !live.contains(p))
                    .filter_map(|p| store_dir.parse_path(&p).ok())
                    .collect()
            }
        }
    };

    if options.action == GcAction::ReturnDead {
        results.paths = dead
            .iter()
            .map(|p| store_dir.display_path(p))
            .collect();
        return Ok(results);
    }

    // Delete in passes: a path can only be invalidated once nothing valid
    // references it, so deleting referrers first unblocks their references.
    let mut remaining: Vec<StorePath> = dead;
    loop {
        let mut progressed = false;
        let mut next = Vec::new();

        for path in remaining {
            if let Some(max) = options.max_freed {
                if results.bytes_freed >= max {
                    return Ok(results);
                }
            }
            let full = store_dir.display_path(&path);
            let mut db_guard = db.blocking_lock();
            let size = db_guard
                .query_path_info(&full)?
                .map(|info| info.nar_size)
                .unwrap_or(0);
            match db_guard.invalidate_path(&full) {
                Ok(()) => {
                    drop(db_guard);
                    remove_path_all(&store.to_real_path(&path));
                    results.bytes_freed += size;
                    results.paths.push(full);
                    progressed = true;
                }
                Err(crate::db::DbError::StillReferenced(_)) => {
                    next.push(path);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if next.is_empty() {
            return Ok(results);
        }
        if !progressed {
            return Err(StoreError::Database(format!(
                "cannot delete {} paths: still referenced from outside the dead set",
                next.len()
            )));
        }
        remaining = next;
    }
}
