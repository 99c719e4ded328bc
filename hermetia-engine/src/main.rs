// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! The `hermetia` command: drive the build engine from the command line.
//!
//! Three verbs touch the engine: `realise` (build or substitute store
//! paths to validity), `gc` (collect unreachable paths), and `delete`
//! (remove specific paths). Exit codes: 0 success, 1 generic failure,
//! 100 build failure, 101 dependency failure.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hermetia_store_core::store_path::{StoreDir, StorePath};

use hermetia_engine::config::EngineConfig;
use hermetia_engine::gc::{GcAction, GcOptions};
use hermetia_engine::scheduler::{Worker, exit_code_for};
use hermetia_engine::store::{GcStore as _, LocalStore, Store as _};
use hermetia_engine::substituter::{LocalBinaryCache, Substituter};

#[derive(Parser)]
#[command(name = "hermetia", about = "purely functional derivation build engine")]
struct Cli {
    /// Path to the engine configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the store directory.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Build or substitute the given derivations until their outputs are
    /// valid.
    Realise {
        /// Store paths of `.drv` files.
        paths: Vec<String>,

        /// Continue scheduling unrelated goals after a failure.
        #[arg(long)]
        keep_going: bool,

        /// Re-run each build N extra times and compare outputs.
        #[arg(long, default_value_t = 0)]
        repeat: u32,
    },
    /// Delete everything unreachable from the given roots.
    Gc {
        /// Store paths to treat as live roots.
        #[arg(long)]
        root: Vec<String>,

        /// Stop after freeing this many bytes.
        #[arg(long)]
        max: Option<u64>,

        /// Only report what would be deleted.
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete specific store paths.
    Delete {
        paths: Vec<String>,

        /// Do not check whether the paths are still referenced.
        #[arg(long)]
        ignore_liveness: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<u8, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(store) = &cli.store {
        config.store_dir = store.clone();
    }

    let store_dir = StoreDir::new(&config.store_dir)?;
    let store = Arc::new(LocalStore::open(
        store_dir.clone(),
        &config.db_path,
        config.log_dir.clone(),
    )?);

    match cli.command {
        CliCommand::Realise {
            paths,
            keep_going,
            repeat,
        } => {
            config.keep_going = keep_going;
            config.nr_repeats = repeat;
            let config = Arc::new(config);

            let mut substituters: Vec<Arc<dyn Substituter>> = Vec::new();
            for sub in &config.substituters {
                match LocalBinaryCache::from_url(&sub.url, sub.priority, store_dir.clone()) {
                    Ok(cache) => substituters.push(Arc::new(cache)),
                    Err(e) => tracing::warn!("skipping substituter '{}': {e}", sub.url),
                }
            }

            let mut worker = Worker::new(Arc::clone(&store), config, substituters);

            let mut wanted = Vec::new();
            let mut targets = Vec::new();
            for arg in &paths {
                let path = parse_path_arg(&store_dir, arg)?;
                if !path.is_derivation() {
                    return Err(format!("'{arg}' is not a derivation path").into());
                }
                let id = worker.want_derivation(path.clone(), None)?;
                wanted.push(id);
                targets.push((path, id));
            }

            worker.run(&wanted).await?;

            let mut results = BTreeMap::new();
            for (path, id) in targets {
                let result = worker
                    .result(id)
                    .cloned()
                    .expect("finished goal has a result");
                match &result.error {
                    None => {
                        for (name, realisation) in &result.built_outputs {
                            println!("{}\t{name}\t{}", path, store_dir.display_path(&realisation.out_path));
                        }
                    }
                    Some(error) => eprintln!("error: build of '{path}' failed: {error}"),
                }
                results.insert(path, result);
            }
            Ok(exit_code_for(&results) as u8)
        }

        CliCommand::Gc { root, max, dry_run } => {
            let mut roots = BTreeSet::new();
            for arg in &root {
                roots.insert(parse_path_arg(&store_dir, arg)?);
            }
            let options = GcOptions {
                action: if dry_run {
                    GcAction::ReturnDead
                } else {
                    GcAction::DeleteDead
                },
                roots,
                max_freed: max,
                ..Default::default()
            };

            let gc_store = Arc::clone(&store);
            let results = tokio::task::spawn_blocking(move || {
                gc_store
                    .as_gc_store()
                    .expect("local store collects garbage")
                    .collect_garbage(&options)
            })
            .await??;

            for path in &results.paths {
                println!("{path}");
            }
            eprintln!(
                "{} paths, {} bytes {}",
                results.paths.len(),
                results.bytes_freed,
                if dry_run { "would be freed" } else { "freed" }
            );
            Ok(0)
        }

        CliCommand::Delete {
            paths,
            ignore_liveness,
        } => {
            let mut to_delete = BTreeSet::new();
            for arg in &paths {
                to_delete.insert(parse_path_arg(&store_dir, arg)?);
            }
            let options = GcOptions {
                action: GcAction::DeleteSpecific,
                paths_to_delete: to_delete,
                ignore_liveness,
                ..Default::default()
            };

            let gc_store = Arc::clone(&store);
            let results = tokio::task::spawn_blocking(move || {
                gc_store
                    .as_gc_store()
                    .expect("local store collects garbage")
                    .collect_garbage(&options)
            })
            .await??;

            eprintln!("{} paths deleted", results.paths.len());
            Ok(0)
        }
    }
}

fn parse_path_arg(
    store_dir: &StoreDir,
    arg: &str,
) -> Result<StorePath, Box<dyn std::error::Error>> {
    let path = if arg.starts_with('/') {
        store_dir.parse_path(arg)?
    } else {
        arg.parse()?
    };
    Ok(path)
}
