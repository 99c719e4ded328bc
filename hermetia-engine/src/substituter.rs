// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Substituter clients: fetch a store path from an external store
//! instead of building it.
//!
//! For each configured substituter in priority order: fetch the path
//! metadata, verify signatures against the trusted keys (skipped for
//! content-addressed paths that verify themselves), download and
//! decompress the NAR, restore, canonicalise, re-hash, and register
//! under the same transaction semantics as a build. Substitution failure
//! is non-fatal; the scheduler falls back to building. Transient errors
//! are retried with exponential backoff up to a fixed cap.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use hermetia_store_core::content_address::ContentAddress;
use hermetia_store_core::fingerprint::fingerprint_path;
use hermetia_store_core::hash::{Algorithm, Hash};
use hermetia_store_core::signature::{PublicKey, Signature, SigningKey};
use hermetia_store_core::store_path::{StorePath, StoreReferences};

use crate::build_result::{BuildResult, BuildStatus};
use crate::canonicalize;
use crate::config::EngineConfig;
use crate::error::BuildError;
use crate::pathlocks::PathLock;
use crate::store::{LocalStore, PathInfo, Store, digest_bytes, remove_path_all};

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SubstituteError {
    #[error("substituter unavailable: {0}")]
    Unavailable(String),

    #[error("transient IO error: {0}")]
    Transient(String),

    #[error("corrupt data from substituter: {0}")]
    Corrupt(String),

    #[error("signature rejected: {0}")]
    SignatureRejected(String),
}

/// Path metadata advertised by a substituter.
#[derive(Debug, Clone)]
pub struct NarInfo {
    pub path: StorePath,
    pub url: String,
    pub compression: String,
    pub nar_hash: Hash,
    pub nar_size: u64,
    pub references: BTreeSet<StorePath>,
    pub deriver: Option<StorePath>,
    pub sigs: Vec<Signature>,
    pub ca: Option<ContentAddress>,
}

/// An external store that may serve pre-built paths.
pub trait Substituter: Send + Sync {
    fn url(&self) -> &str;

    /// Lower values are consulted first.
    fn priority(&self) -> u32;

    fn query<'a>(
        &'a self,
        path: &'a StorePath,
    ) -> BoxFuture<'a, Result<Option<NarInfo>, SubstituteError>>;

    fn fetch_nar<'a>(
        &'a self,
        info: &'a NarInfo,
    ) -> BoxFuture<'a, Result<Vec<u8>, SubstituteError>>;
}

/// Try to realise `path` through the given substituters. Returns
/// `Substituted` on success and a non-fatal failure otherwise.
pub async fn substitute_path(
    store: Arc<LocalStore>,
    config: Arc<EngineConfig>,
    substituters: Vec<Arc<dyn Substituter>>,
    path: StorePath,
    cancel: CancellationToken,
) -> BuildResult {
    let trusted_keys: Vec<PublicKey> = config
        .trusted_keys
        .iter()
        .filter_map(|k| k.parse().ok())
        .collect();

    let mut ordered = substituters;
    ordered.sort_by_key(|s| s.priority());

    let mut last_error: Option<BuildError> = None;
    for sub in &ordered {
        if cancel.is_cancelled() {
            return BuildResult::failure(BuildError::Cancelled);
        }
        match try_one_substituter(&store, &config, sub.as_ref(), &path, &trusted_keys).await {
            Ok(result) => return result,
            Err(e) => {
                tracing::info!(
                    "substituter '{}' failed for {path}: {e}",
                    sub.url()
                );
                last_error = Some(match e {
                    SubstituteError::SignatureRejected(msg) => BuildError::SignatureRejected(msg),
                    SubstituteError::Transient(msg) => BuildError::TransientIo(msg),
                    other => BuildError::SubstituterUnavailable(other.to_string()),
                });
            }
        }
    }

    BuildResult::failure(last_error.unwrap_or_else(|| {
        BuildError::SubstituterUnavailable(format!("no substituter has '{path}'"))
    }))
}

async fn try_one_substituter(
    store: &LocalStore,
    config: &EngineConfig,
    sub: &dyn Substituter,
    path: &StorePath,
    trusted_keys: &[PublicKey],
) -> Result<BuildResult, SubstituteError> {
    let info = with_retries(|| sub.query(path))
        .await?
        .ok_or_else(|| SubstituteError::Unavailable(format!("path '{path}' not found")))?;

    verify_narinfo(store, config, path, &info, trusted_keys)?;

    let compressed = with_retries(|| sub.fetch_nar(&info)).await?;
    let nar = decompress(&info.compression, compressed)?;

    // Restore into a staging location, canonicalise, and re-hash before
    // anything touches the store.
    let staging = store
        .store_dir()
        .to_path()
        .join(format!(".tmp-substitute-{}", path.digest()));
    remove_path_all(&staging);
    {
        let nar = nar.clone();
        let staging = staging.clone();
        tokio::task::spawn_blocking(move || hermetia_nar::restore(&mut nar.as_slice(), &staging))
            .await
            .map_err(|e| SubstituteError::Corrupt(e.to_string()))?
            .map_err(|e| SubstituteError::Corrupt(format!("unpacking NAR: {e}")))?;
    }
    canonicalize::canonicalize_path_metadata(&staging)
        .await
        .map_err(|e| SubstituteError::Corrupt(format!("canonicalizing: {e}")))?;

    let canonical_nar = {
        let staging = staging.clone();
        tokio::task::spawn_blocking(move || hermetia_nar::dump_path_to_vec(&staging))
            .await
            .map_err(|e| SubstituteError::Corrupt(e.to_string()))?
            .map_err(|e| SubstituteError::Corrupt(e.to_string()))?
    };
    let observed = digest_bytes(Algorithm::Sha256, &canonical_nar);
    if observed != info.nar_hash {
        remove_path_all(&staging);
        return Err(SubstituteError::Corrupt(format!(
            "NAR hash mismatch for '{path}': expected {}, got {}",
            info.nar_hash.format_base32(),
            observed.format_base32()
        )));
    }

    // Commit: path lock, then re-check (a concurrent build may have won),
    // then move into place and register.
    let real = store.to_real_path(path);
    let lock_target = real.clone();
    let _lock = tokio::task::spawn_blocking(move || PathLock::lock(&lock_target))
        .await
        .map_err(|e| SubstituteError::Corrupt(e.to_string()))?
        .map_err(|e| SubstituteError::Transient(format!("path lock: {e}")))?;

    if store
        .is_valid_path(path)
        .await
        .map_err(|e| SubstituteError::Transient(e.to_string()))?
    {
        remove_path_all(&staging);
        return Ok(BuildResult::success(
            BuildStatus::AlreadyValid,
            Default::default(),
        ));
    }

    remove_path_all(&real);
    std::fs::rename(&staging, &real)
        .map_err(|e| SubstituteError::Transient(format!("moving into store: {e}")))?;

    let info_to_register = PathInfo {
        path: path.clone(),
        deriver: info.deriver.clone(),
        nar_hash: info.nar_hash.clone(),
        nar_size: canonical_nar.len() as u64,
        references: info.references.clone(),
        registration_time: 0,
        ultimate: false,
        signatures: info.sigs.iter().cloned().collect(),
        ca: info.ca.clone(),
    };
    store
        .register_valid_paths(vec![info_to_register])
        .await
        .map_err(|e| SubstituteError::Transient(e.to_string()))?;

    tracing::info!("substituted '{path}' from '{}'", sub.url());
    Ok(BuildResult::success(
        BuildStatus::Substituted,
        Default::default(),
    ))
}

/// Signature policy: content-addressed paths that reproduce their own
/// store path self-verify; everything else needs `sigs_needed` valid
/// signatures from trusted keys.
fn verify_narinfo(
    store: &LocalStore,
    config: &EngineConfig,
    path: &StorePath,
    info: &NarInfo,
    trusted_keys: &[PublicKey],
) -> Result<(), SubstituteError> {
    if info.path != *path {
        return Err(SubstituteError::Corrupt(format!(
            "substituter returned info for '{}' instead of '{path}'",
            info.path
        )));
    }

    if let Some(ca) = &info.ca {
        let refs = StoreReferences {
            others: info
                .references
                .iter()
                .filter(|r| *r != path)
                .cloned()
                .collect(),
            self_ref: info.references.contains(path),
        };
        if let Ok(computed) = store.store_dir().make_path_from_ca(path.name(), ca, &refs) {
            if computed == *path {
                return Ok(());
            }
        }
    }

    if config.sigs_needed == 0 {
        return Ok(());
    }

    let fingerprint = fingerprint_path(
        store.store_dir(),
        path,
        &info.nar_hash,
        info.nar_size,
        &info.references,
    )
    .map_err(|e| SubstituteError::Corrupt(e.to_string()))?;

    let valid = info
        .sigs
        .iter()
        .filter(|sig| trusted_keys.iter().any(|key| key.verify(&fingerprint, sig)))
        .count();
    if valid < config.sigs_needed {
        return Err(SubstituteError::SignatureRejected(format!(
            "path '{path}' has {valid} valid signatures, {} required",
            config.sigs_needed
        )));
    }
    Ok(())
}

async fn with_retries<'a, T>(
    mut f: impl FnMut() -> BoxFuture<'a, Result<T, SubstituteError>>,
) -> Result<T, SubstituteError> {
    let mut attempt = 0;
    loop {
        match f().await {
            Err(SubstituteError::Transient(msg)) if attempt < MAX_RETRIES => {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                tracing::debug!("transient substituter error, retrying in {delay:?}: {msg}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn decompress(compression: &str, data: Vec<u8>) -> Result<Vec<u8>, SubstituteError> {
    match compression {
        "" | "none" => Ok(data),
        "bzip2" => {
            use std::io::Read as _;
            let mut out = Vec::new();
            bzip2::read::BzDecoder::new(data.as_slice())
                .read_to_end(&mut out)
                .map_err(|e| SubstituteError::Corrupt(format!("bzip2: {e}")))?;
            Ok(out)
        }
        other => Err(SubstituteError::Unavailable(format!(
            "unsupported compression '{other}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Local (file://) binary cache
// ---------------------------------------------------------------------------

/// A binary cache in a local directory: `<digest>.narinfo` metadata files
/// next to a `nar/` payload directory.
pub struct LocalBinaryCache {
    root: PathBuf,
    url: String,
    priority: u32,
    store_dir: hermetia_store_core::store_path::StoreDir,
}

impl LocalBinaryCache {
    pub fn open(
        root: PathBuf,
        priority: u32,
        store_dir: hermetia_store_core::store_path::StoreDir,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(root.join("nar"))?;
        let url = format!("file://{}", root.display());
        Ok(LocalBinaryCache {
            root,
            url,
            priority,
            store_dir,
        })
    }

    /// Parse a `file://` substituter URL.
    pub fn from_url(
        url: &str,
        priority: u32,
        store_dir: hermetia_store_core::store_path::StoreDir,
    ) -> std::io::Result<Self> {
        let path = url.strip_prefix("file://").unwrap_or(url);
        Self::open(PathBuf::from(path), priority, store_dir)
    }

    fn narinfo_path(&self, path: &StorePath) -> PathBuf {
        self.root.join(format!("{}.narinfo", path.digest()))
    }

    /// Upload a valid path into this cache, signing it when a key is
    /// given. Used by cache maintenance tooling and tests.
    pub async fn push(
        &self,
        store: &LocalStore,
        path: &StorePath,
        signer: Option<&SigningKey>,
    ) -> std::io::Result<()> {
        let info = store
            .query_path_info(path)
            .await
            .map_err(std::io::Error::other)?
            .ok_or_else(|| std::io::Error::other(format!("'{path}' is not valid")))?;

        let nar = hermetia_nar::dump_path_to_vec(&store.to_real_path(path))
            .map_err(std::io::Error::other)?;
        let nar_name = format!("nar/{}.nar", path.digest());
        std::fs::write(self.root.join(&nar_name), &nar)?;

        let mut sigs: Vec<Signature> = info.signatures.iter().cloned().collect();
        if let Some(key) = signer {
            let fingerprint = fingerprint_path(
                &self.store_dir,
                path,
                &info.nar_hash,
                info.nar_size,
                &info.references,
            )
            .map_err(std::io::Error::other)?;
            sigs.push(key.sign(&fingerprint));
        }

        let mut text = String::new();
        text.push_str(&format!(
            "StorePath: {}\n",
            self.store_dir.display_path(path)
        ));
        text.push_str(&format!("URL: {nar_name}\n"));
        text.push_str("Compression: none\n");
        text.push_str(&format!("NarHash: {}\n", info.nar_hash.format_base32()));
        text.push_str(&format!("NarSize: {}\n", info.nar_size));
        let refs = info
            .references
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        text.push_str(&format!("References: {refs}\n"));
        if let Some(deriver) = &info.deriver {
            text.push_str(&format!("Deriver: {deriver}\n"));
        }
        if let Some(ca) = &info.ca {
            text.push_str(&format!("CA: {ca}\n"));
        }
        for sig in &sigs {
            text.push_str(&format!("Sig: {sig}\n"));
        }

        std::fs::write(self.narinfo_path(path), text)?;
        Ok(())
    }

    fn parse_narinfo(&self, text: &str) -> Result<NarInfo, SubstituteError> {
        let corrupt = |msg: String| SubstituteError::Corrupt(msg);
        let mut path = None;
        let mut url = None;
        let mut compression = "none".to_string();
        let mut nar_hash = None;
        let mut nar_size = None;
        let mut references = BTreeSet::new();
        let mut deriver = None;
        let mut sigs = Vec::new();
        let mut ca = None;

        for line in text.lines() {
            let Some((key, value)) = line.split_once(": ") else {
                continue;
            };
            match key {
                "StorePath" => {
                    path = Some(
                        self.store_dir
                            .parse_path(value)
                            .map_err(|e| corrupt(format!("bad StorePath: {e}")))?,
                    );
                }
                "URL" => url = Some(value.to_string()),
                "Compression" => compression = value.to_string(),
                "NarHash" => {
                    nar_hash = Some(
                        Hash::parse(value).map_err(|e| corrupt(format!("bad NarHash: {e}")))?,
                    );
                }
                "NarSize" => {
                    nar_size = Some(
                        value
                            .parse::<u64>()
                            .map_err(|e| corrupt(format!("bad NarSize: {e}")))?,
                    );
                }
                "References" => {
                    for r in value.split_whitespace() {
                        references.insert(
                            r.parse()
                                .map_err(|e| corrupt(format!("bad reference: {e}")))?,
                        );
                    }
                }
                "Deriver" => {
                    deriver = Some(
                        value
                            .parse()
                            .map_err(|e| corrupt(format!("bad Deriver: {e}")))?,
                    );
                }
                "Sig" => {
                    sigs.push(
                        value
                            .parse()
                            .map_err(|e| corrupt(format!("bad Sig: {e}")))?,
                    );
                }
                "CA" => {
                    ca = Some(
                        ContentAddress::parse(value)
                            .map_err(|e| corrupt(format!("bad CA: {e}")))?,
                    );
                }
                _ => {}
            }
        }

        Ok(NarInfo {
            path: path.ok_or_else(|| corrupt("missing StorePath".into()))?,
            url: url.ok_or_else(|| corrupt("missing URL".into()))?,
            compression,
            nar_hash: nar_hash.ok_or_else(|| corrupt("missing NarHash".into()))?,
            nar_size: nar_size.ok_or_else(|| corrupt("missing NarSize".into()))?,
            references,
            deriver,
            sigs,
            ca,
        })
    }
}

impl Substituter for LocalBinaryCache {
    fn url(&self) -> &str {
        &self.url
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn query<'a>(
        &'a self,
        path: &'a StorePath,
    ) -> BoxFuture<'a, Result<Option<NarInfo>, SubstituteError>> {
        Box::pin(async move {
            let narinfo_path = self.narinfo_path(path);
            match tokio::fs::read_to_string(&narinfo_path).await {
                Ok(text) => Ok(Some(self.parse_narinfo(&text)?)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(SubstituteError::Transient(format!(
                    "reading {}: {e}",
                    narinfo_path.display()
                ))),
            }
        })
    }

    fn fetch_nar<'a>(
        &'a self,
        info: &'a NarInfo,
    ) -> BoxFuture<'a, Result<Vec<u8>, SubstituteError>> {
        Box::pin(async move {
            let nar_path = self.root.join(&info.url);
            tokio::fs::read(&nar_path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SubstituteError::Unavailable(format!("missing NAR {}", info.url))
                } else {
                    SubstituteError::Transient(format!("reading {}: {e}", nar_path.display()))
                }
            })
        })
    }
}
