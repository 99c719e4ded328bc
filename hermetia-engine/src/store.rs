// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! The store abstraction and the local filesystem store.
//!
//! A store names, queries, and registers immutable artifacts. Capabilities
//! beyond querying (local filesystem access, garbage collection, build
//! logs) are separate traits; call sites obtain them through the typed
//! accessors on [`Store`] and fail gracefully when a capability is absent.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use hermetia_store_core::content_address::{ContentAddress, FileIngestionMethod};
use hermetia_store_core::hash::{Algorithm, Hash, HashContext};
use hermetia_store_core::signature::Signature;
use hermetia_store_core::store_path::{
    StoreDir, StorePath, StorePathError, StorePathName, StoreReferences,
};

use crate::db::{DbError, RegisterPathParams, StoreDb};
use crate::references::RefScanSink;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store path: {0}")]
    InvalidStorePath(#[from] StorePathError),

    #[error("path '{0}' is not valid")]
    NotFound(StorePath),

    #[error("hash mismatch for '{path}': expected {expected}, got {got}")]
    HashMismatch {
        path: String,
        expected: String,
        got: String,
    },

    #[error("signature rejected: {0}")]
    SignatureRejected(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("archive error: {0}")]
    Nar(String),
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<hermetia_nar::NarError> for StoreError {
    fn from(e: hermetia_nar::NarError) -> Self {
        StoreError::Nar(e.to_string())
    }
}

/// Metadata of one valid path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    pub path: StorePath,
    pub deriver: Option<StorePath>,
    pub nar_hash: Hash,
    pub nar_size: u64,
    pub references: BTreeSet<StorePath>,
    pub registration_time: i64,
    pub ultimate: bool,
    pub signatures: BTreeSet<Signature>,
    pub ca: Option<ContentAddress>,
}

/// Base store interface plus typed capability accessors.
pub trait Store: Send + Sync {
    fn store_dir(&self) -> &StoreDir;

    fn as_local_fs_store(&self) -> Option<&dyn LocalFsStore> {
        None
    }

    fn as_gc_store(&self) -> Option<&dyn GcStore> {
        None
    }

    fn as_log_store(&self) -> Option<&dyn LogStore> {
        None
    }
}

/// Stores whose artifacts live on the local filesystem.
pub trait LocalFsStore: Store {
    fn to_real_path(&self, path: &StorePath) -> PathBuf;
}

/// Stores that can collect garbage.
pub trait GcStore: Store {
    /// Blocking; run on the blocking pool from async contexts.
    fn collect_garbage(&self, options: &crate::gc::GcOptions)
    -> Result<crate::gc::GcResults, StoreError>;
}

/// Stores that keep build logs.
pub trait LogStore: Store {
    fn build_log_path(&self, drv_path: &StorePath) -> Option<PathBuf>;
}

/// The local store: artifacts under the store directory, metadata in the
/// SQLite database.
pub struct LocalStore {
    store_dir: StoreDir,
    db: Arc<Mutex<StoreDb>>,
    log_dir: Option<PathBuf>,
}

impl LocalStore {
    pub fn open(
        store_dir: StoreDir,
        db_path: &Path,
        log_dir: Option<PathBuf>,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(store_dir.to_path())
            .map_err(|e| StoreError::Io(format!("creating store dir: {e}")))?;
        let db = StoreDb::open(db_path)?;
        Ok(LocalStore {
            store_dir,
            db: Arc::new(Mutex::new(db)),
            log_dir,
        })
    }

    /// A store over a fresh in-memory database. Used by tests.
    pub fn open_ephemeral(store_dir: StoreDir) -> Result<Self, StoreError> {
        std::fs::create_dir_all(store_dir.to_path())
            .map_err(|e| StoreError::Io(format!("creating store dir: {e}")))?;
        Ok(LocalStore {
            store_dir,
            db: Arc::new(Mutex::new(StoreDb::open_memory()?)),
            log_dir: None,
        })
    }

    pub fn db(&self) -> Arc<Mutex<StoreDb>> {
        Arc::clone(&self.db)
    }

    pub async fn is_valid_path(&self, path: &StorePath) -> Result<bool, StoreError> {
        let full = self.store_dir.display_path(path);
        Ok(self.db.lock().await.is_valid_path(&full)?)
    }

    pub async fn query_path_info(&self, path: &StorePath) -> Result<Option<PathInfo>, StoreError> {
        let full = self.store_dir.display_path(path);
        let raw = self.db.lock().await.query_path_info(&full)?;
        raw.map(|raw| self.parse_raw_info(path.clone(), raw)).transpose()
    }

    fn parse_raw_info(
        &self,
        path: StorePath,
        raw: crate::db::RawPathInfo,
    ) -> Result<PathInfo, StoreError> {
        let nar_hash = Hash::parse(&raw.hash)
            .map_err(|e| StoreError::Database(format!("bad hash in database: {e}")))?;
        let references = raw
            .references
            .iter()
            .map(|r| self.store_dir.parse_path(r))
            .collect::<Result<BTreeSet<_>, _>>()?;
        let deriver = raw
            .deriver
            .as_deref()
            .map(|d| self.store_dir.parse_path(d))
            .transpose()?;
        let signatures = raw
            .sigs
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        let ca = raw
            .ca
            .as_deref()
            .map(ContentAddress::parse)
            .transpose()
            .map_err(|e| StoreError::Database(format!("bad ca in database: {e}")))?;
        Ok(PathInfo {
            path,
            deriver,
            nar_hash,
            nar_size: raw.nar_size,
            references,
            registration_time: raw.registration_time,
            ultimate: raw.ultimate,
            signatures,
            ca,
        })
    }

    /// Register a batch of paths in one transaction. Either all become
    /// valid or none do.
    pub async fn register_valid_paths(&self, batch: Vec<PathInfo>) -> Result<(), StoreError> {
        let params: Vec<RegisterPathParams> =
            batch.iter().map(|info| self.to_register_params(info)).collect();
        self.db.lock().await.register_valid_paths(&params)?;
        Ok(())
    }

    fn to_register_params(&self, info: &PathInfo) -> RegisterPathParams {
        RegisterPathParams {
            path: self.store_dir.display_path(&info.path),
            hash: info.nar_hash.format_base16(),
            deriver: info.deriver.as_ref().map(|d| self.store_dir.display_path(d)),
            nar_size: info.nar_size,
            ultimate: info.ultimate,
            sigs: info.signatures.iter().map(|s| s.to_string()).collect(),
            ca: info.ca.as_ref().map(|ca| ca.to_string()),
            references: info
                .references
                .iter()
                .map(|r| self.store_dir.display_path(r))
                .collect(),
        }
    }

    /// Copy a tree from outside the store into it, content-addressed.
    /// Canonicalises, hashes, and registers atomically; an already-valid
    /// identical path short-circuits.
    pub async fn add_to_store(
        &self,
        name: &StorePathName,
        source: &Path,
        method: FileIngestionMethod,
        algo: Algorithm,
        references: BTreeSet<StorePath>,
    ) -> Result<PathInfo, StoreError> {
        let nar = {
            let source = source.to_path_buf();
            tokio::task::spawn_blocking(move || hermetia_nar::dump_path_to_vec(&source))
                .await
                .map_err(|e| StoreError::Io(e.to_string()))??
        };

        let content_hash = match method {
            FileIngestionMethod::Recursive => digest_bytes(algo, &nar),
            FileIngestionMethod::Flat => {
                let data = tokio::fs::read(source)
                    .await
                    .map_err(|e| StoreError::Io(format!("reading {}: {e}", source.display())))?;
                digest_bytes(algo, &data)
            }
        };

        let refs = StoreReferences {
            others: references.clone(),
            self_ref: false,
        };
        let path = self
            .store_dir
            .make_fixed_output_path(name, method, &content_hash, &refs)?;

        if self.is_valid_path(&path).await? {
            return self
                .query_path_info(&path)
                .await?
                .ok_or(StoreError::NotFound(path));
        }

        let dest = self.to_real_path(&path);
        {
            let nar = nar.clone();
            let dest = dest.clone();
            tokio::task::spawn_blocking(move || {
                if dest.exists() {
                    // Leftover from an aborted ingest; replace it.
                    remove_path_all(&dest);
                }
                hermetia_nar::restore(&mut nar.as_slice(), &dest)
            })
            .await
            .map_err(|e| StoreError::Io(e.to_string()))??;
        }
        crate::canonicalize::canonicalize_path_metadata(&dest)
            .await
            .map_err(|e| StoreError::Io(format!("canonicalizing {}: {e}", dest.display())))?;

        // NAR hash over the canonical on-disk form.
        let final_nar = {
            let dest = dest.clone();
            tokio::task::spawn_blocking(move || hermetia_nar::dump_path_to_vec(&dest))
                .await
                .map_err(|e| StoreError::Io(e.to_string()))??
        };
        let nar_hash = digest_bytes(Algorithm::Sha256, &final_nar);

        let info = PathInfo {
            path: path.clone(),
            deriver: None,
            nar_hash,
            nar_size: final_nar.len() as u64,
            references,
            registration_time: 0,
            ultimate: true,
            signatures: BTreeSet::new(),
            ca: Some(ContentAddress::Fixed {
                method,
                hash: content_hash,
            }),
        };
        self.register_valid_paths(vec![info.clone()]).await?;
        Ok(info)
    }

    /// Store a text artifact (derivation files and the like).
    pub async fn add_text_to_store(
        &self,
        name: &StorePathName,
        contents: &str,
        references: BTreeSet<StorePath>,
    ) -> Result<StorePath, StoreError> {
        let content_hash = digest_bytes(Algorithm::Sha256, contents.as_bytes());
        let refs = StoreReferences {
            others: references.clone(),
            self_ref: false,
        };
        let path = self.store_dir.make_text_path(name, &content_hash, &refs)?;

        if self.is_valid_path(&path).await? {
            return Ok(path);
        }

        let dest = self.to_real_path(&path);
        tokio::fs::write(&dest, contents)
            .await
            .map_err(|e| StoreError::Io(format!("writing {}: {e}", dest.display())))?;
        crate::canonicalize::canonicalize_path_metadata(&dest)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        let nar = hermetia_nar::dump_path_to_vec(&dest)?;
        let info = PathInfo {
            path: path.clone(),
            deriver: None,
            nar_hash: digest_bytes(Algorithm::Sha256, &nar),
            nar_size: nar.len() as u64,
            references,
            registration_time: 0,
            ultimate: true,
            signatures: BTreeSet::new(),
            ca: Some(ContentAddress::Text { hash: content_hash }),
        };
        self.register_valid_paths(vec![info]).await?;
        Ok(path)
    }

    /// The reflexive-transitive reference closure of a path.
    pub async fn compute_closure(
        &self,
        path: &StorePath,
    ) -> Result<BTreeSet<StorePath>, StoreError> {
        let mut closure = BTreeSet::new();
        let mut queue = vec![path.clone()];
        while let Some(current) = queue.pop() {
            if !closure.insert(current.clone()) {
                continue;
            }
            let info = self
                .query_path_info(&current)
                .await?
                .ok_or(StoreError::NotFound(current))?;
            for reference in info.references {
                if !closure.contains(&reference) {
                    queue.push(reference);
                }
            }
        }
        Ok(closure)
    }

    /// Re-hash a path's canonical serialisation and compare against the
    /// recorded NAR hash.
    pub async fn verify_path(&self, path: &StorePath) -> Result<(), StoreError> {
        let info = self
            .query_path_info(path)
            .await?
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        let real = self.to_real_path(path);
        let nar = tokio::task::spawn_blocking(move || hermetia_nar::dump_path_to_vec(&real))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))??;
        let observed = digest_bytes(Algorithm::Sha256, &nar);
        if observed != info.nar_hash {
            return Err(StoreError::HashMismatch {
                path: self.store_dir.display_path(path),
                expected: info.nar_hash.format_base32(),
                got: observed.format_base32(),
            });
        }
        Ok(())
    }

    /// Stream a path as NAR while scanning for references, in one pass.
    pub async fn hash_and_scan(
        &self,
        real_path: &Path,
        candidates: &BTreeSet<StorePath>,
        self_path: Option<&StorePath>,
    ) -> Result<(Hash, u64, BTreeSet<StorePath>), StoreError> {
        let mut hasher = HashContext::new(Algorithm::Sha256);
        let mut size: u64 = 0;
        let mut sink = RefScanSink::new(candidates, self_path);

        let mut stream = hermetia_nar::NarByteStream::new(real_path.to_path_buf());
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            sink.feed(&chunk);
            size += chunk.len() as u64;
        }
        Ok((hasher.finish(), size, sink.found_paths()))
    }
}

impl Store for LocalStore {
    fn store_dir(&self) -> &StoreDir {
        &self.store_dir
    }

    fn as_local_fs_store(&self) -> Option<&dyn LocalFsStore> {
        Some(self)
    }

    fn as_gc_store(&self) -> Option<&dyn GcStore> {
        Some(self)
    }

    fn as_log_store(&self) -> Option<&dyn LogStore> {
        Some(self)
    }
}

impl LocalFsStore for LocalStore {
    fn to_real_path(&self, path: &StorePath) -> PathBuf {
        self.store_dir.full_path(path)
    }
}

impl GcStore for LocalStore {
    fn collect_garbage(
        &self,
        options: &crate::gc::GcOptions,
    ) -> Result<crate::gc::GcResults, StoreError> {
        crate::gc::collect_garbage(self, options)
    }
}

impl LogStore for LocalStore {
    fn build_log_path(&self, drv_path: &StorePath) -> Option<PathBuf> {
        let log_dir = self.log_dir.as_ref()?;
        let base = drv_path.to_string();
        let (prefix, rest) = base.split_at(2);
        Some(log_dir.join("drvs").join(prefix).join(format!("{rest}.bz2")))
    }
}

impl LocalStore {
    /// Convenience alias for trait-free callers.
    pub fn to_real_path(&self, path: &StorePath) -> PathBuf {
        self.store_dir.full_path(path)
    }
}

pub(crate) fn digest_bytes(algo: Algorithm, data: &[u8]) -> Hash {
    let mut ctx = HashContext::new(algo);
    ctx.update(data);
    ctx.finish()
}

/// Remove a file or tree, making it writable first when needed.
pub(crate) fn remove_path_all(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.is_dir() {
            // Read-only directories block removal of their entries.
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755));
            if let Ok(entries) = std::fs::read_dir(path) {
                for entry in entries.flatten() {
                    remove_path_all(&entry.path());
                }
            }
            let _ = std::fs::remove_dir(path);
        } else {
            let _ = std::fs::remove_file(path);
        }
    }
}
