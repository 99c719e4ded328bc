// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Store path types, parsing, and path-name construction.
//!
//! A store path is `<store-dir>/<digest>-<name>` where the digest is a
//! 160-bit XOR-compression of a SHA-256 over a canonical fingerprint:
//!
//! ```text
//! fingerprint = type, ':sha256:', inner_digest_hex, ':', store_dir, ':', name
//! text_path   = 'text', { ':', reference }, ...
//! source_path = 'source', { ':', reference }, [ ':self' ], ...
//! fixed_path  = 'output:out', ... (inner digest over 'fixed:out:[r:]algo:hex:')
//! output_path = 'output:', output_name, ...
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::base32;
use crate::content_address::{ContentAddress, FileIngestionMethod};
use crate::hash::{self, Algorithm, Hash};

/// Raw length of a store path digest in bytes.
pub const STORE_PATH_DIGEST_BYTES: usize = 20;
/// Length of a store path digest rendered in base32.
pub const STORE_PATH_DIGEST_CHARS: usize = 32;
/// Maximum length of a store path name.
pub const STORE_PATH_NAME_MAX: usize = 211;

/// The 160-bit digest part of a store path.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePathDigest([u8; STORE_PATH_DIGEST_BYTES]);

impl StorePathDigest {
    pub const fn len() -> usize {
        STORE_PATH_DIGEST_BYTES
    }

    pub const fn encoded_len() -> usize {
        STORE_PATH_DIGEST_CHARS
    }

    pub fn new(bytes: [u8; STORE_PATH_DIGEST_BYTES]) -> Self {
        Self(bytes)
    }

    /// Compress an arbitrary-width hash to digest width by XOR folding.
    pub fn compress(hash: &Hash) -> Self {
        let mut out = [0u8; STORE_PATH_DIGEST_BYTES];
        for (i, &b) in hash.as_bytes().iter().enumerate() {
            out[i % STORE_PATH_DIGEST_BYTES] ^= b;
        }
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; STORE_PATH_DIGEST_BYTES] {
        &self.0
    }

    /// Parse the 32-character base32 rendering.
    pub fn decode(s: &str) -> Result<Self, StorePathError> {
        if s.len() != STORE_PATH_DIGEST_CHARS {
            return Err(StorePathError::DigestLength(s.len()));
        }
        let bytes = base32::decode(s.as_bytes()).map_err(|_| StorePathError::DigestEncoding)?;
        let mut out = [0u8; STORE_PATH_DIGEST_BYTES];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl fmt::Display for StorePathDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base32::encode(&self.0))
    }
}

impl fmt::Debug for StorePathDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorePathDigest({self})")
    }
}

/// The name part of a store path.
///
/// At most 211 bytes from `[A-Za-z0-9+\-._?=]`, not starting with a period.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePathName(String);

impl StorePathName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid_char(c: u8) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, b'+' | b'-' | b'.' | b'_' | b'?' | b'=')
    }
}

impl AsRef<str> for StorePathName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorePathName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StorePathName {
    type Err = StorePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(StorePathError::EmptyName);
        }
        if s.len() > STORE_PATH_NAME_MAX {
            return Err(StorePathError::NameLength(s.len()));
        }
        if s.starts_with('.') {
            return Err(StorePathError::NameStartsWithPeriod);
        }
        if let Some(&c) = s.as_bytes().iter().find(|&&c| !Self::is_valid_char(c)) {
            return Err(StorePathError::NameSymbol(c as char));
        }
        Ok(StorePathName(s.to_string()))
    }
}

/// A store path: digest plus name, without the store directory.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath {
    digest: StorePathDigest,
    name: StorePathName,
}

impl StorePath {
    pub fn new(digest: StorePathDigest, name: StorePathName) -> Self {
        Self { digest, name }
    }

    /// Parse a base path like `<digest>-<name>` (no store directory).
    pub fn from_base_path(s: &str) -> Result<Self, StorePathError> {
        if s.len() < STORE_PATH_DIGEST_CHARS + 1 {
            return Err(StorePathError::DigestLength(s.len()));
        }
        let (digest_str, rest) = s.split_at(STORE_PATH_DIGEST_CHARS);
        let name = rest
            .strip_prefix('-')
            .ok_or(StorePathError::MissingSeparator)?;
        Ok(StorePath {
            digest: StorePathDigest::decode(digest_str)?,
            name: name.parse()?,
        })
    }

    pub fn digest(&self) -> &StorePathDigest {
        &self.digest
    }

    pub fn name(&self) -> &StorePathName {
        &self.name
    }

    /// The base32 digest as a string, the unit of reference scanning and
    /// hash rewriting.
    pub fn digest_string(&self) -> String {
        self.digest.to_string()
    }

    pub fn is_derivation(&self) -> bool {
        self.name.as_str().ends_with(".drv")
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.digest, self.name)
    }
}

impl fmt::Debug for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StorePath")
            .field(&format_args!("{self}"))
            .finish()
    }
}

impl FromStr for StorePath {
    type Err = StorePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorePath::from_base_path(s)
    }
}

/// References carried by a content-addressed path: other paths plus an
/// optional self-reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreReferences {
    pub others: std::collections::BTreeSet<StorePath>,
    pub self_ref: bool,
}

impl StoreReferences {
    pub fn is_empty(&self) -> bool {
        self.others.is_empty() && !self.self_ref
    }
}

/// The store directory, needed to render a [`StorePath`] as a full
/// filesystem path and to construct new store paths.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreDir {
    path: PathBuf,
    text: String,
}

impl StoreDir {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StorePathError> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(StorePathError::StoreDirNotAbsolute(path));
        }
        let text = path
            .to_str()
            .ok_or_else(|| StorePathError::StoreDirNotUtf8(path.clone()))?
            .trim_end_matches('/')
            .to_string();
        let path = PathBuf::from(&text);
        Ok(StoreDir { path, text })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn to_path(&self) -> &Path {
        &self.path
    }

    /// Full filesystem path for a store path.
    pub fn full_path(&self, path: &StorePath) -> PathBuf {
        self.path.join(path.to_string())
    }

    /// Full path as a string, for env vars and rewrite maps.
    pub fn display_path(&self, path: &StorePath) -> String {
        format!("{}/{}", self.text, path)
    }

    /// Parse a full path like `/store/dir/<digest>-<name>` into a
    /// [`StorePath`], rejecting paths outside this store.
    pub fn parse_path(&self, s: &str) -> Result<StorePath, StorePathError> {
        let rest = s
            .strip_prefix(&self.text)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| StorePathError::NotInStore(s.to_string()))?;
        if rest.contains('/') {
            return Err(StorePathError::NotInStore(s.to_string()));
        }
        StorePath::from_base_path(rest)
    }

    pub fn is_in_store(&self, s: &str) -> bool {
        s.strip_prefix(&self.text)
            .and_then(|r| r.strip_prefix('/'))
            .is_some_and(|r| !r.is_empty())
    }

    fn make_type(&self, mut path_type: String, references: &StoreReferences) -> String {
        for reference in &references.others {
            path_type.push(':');
            path_type.push_str(&self.display_path(reference));
        }
        if references.self_ref {
            path_type.push_str(":self");
        }
        path_type
    }

    /// The common fingerprint construction: SHA-256 over
    /// `<type>:sha256:<inner-hex>:<store-dir>:<name>`, XOR-compressed to
    /// digest width.
    pub fn make_store_path(
        &self,
        path_type: &str,
        inner: &Hash,
        name: &StorePathName,
    ) -> StorePath {
        let fingerprint = format!(
            "{}:sha256:{}:{}:{}",
            path_type,
            inner.to_base16(),
            self.text,
            name
        );
        let digest = StorePathDigest::compress(&hash::digest(Algorithm::Sha256, fingerprint));
        StorePath {
            digest,
            name: name.clone(),
        }
    }

    /// Store path for a text artifact (e.g. a derivation file).
    pub fn make_text_path(
        &self,
        name: &StorePathName,
        content_hash: &Hash,
        references: &StoreReferences,
    ) -> Result<StorePath, StorePathError> {
        if content_hash.algorithm() != Algorithm::Sha256 {
            return Err(StorePathError::TextHashAlgorithm(
                content_hash.algorithm().name(),
            ));
        }
        if references.self_ref {
            return Err(StorePathError::TextSelfReference);
        }
        let path_type = self.make_type("text".into(), references);
        Ok(self.make_store_path(&path_type, content_hash, name))
    }

    /// Store path for a fixed or floating content-addressed output.
    pub fn make_fixed_output_path(
        &self,
        name: &StorePathName,
        method: FileIngestionMethod,
        content_hash: &Hash,
        references: &StoreReferences,
    ) -> Result<StorePath, StorePathError> {
        if method == FileIngestionMethod::Recursive
            && content_hash.algorithm() == Algorithm::Sha256
        {
            let path_type = self.make_type("source".into(), references);
            Ok(self.make_store_path(&path_type, content_hash, name))
        } else {
            if !references.is_empty() {
                return Err(StorePathError::FlatOutputReferences);
            }
            let method_tag = match method {
                FileIngestionMethod::Recursive => "r:",
                FileIngestionMethod::Flat => "",
            };
            let inner = hash::digest(
                Algorithm::Sha256,
                format!(
                    "fixed:out:{}{}:{}:",
                    method_tag,
                    content_hash.algorithm(),
                    content_hash.to_base16()
                ),
            );
            Ok(self.make_store_path("output:out", &inner, name))
        }
    }

    /// Dispatch on a full content address.
    pub fn make_path_from_ca(
        &self,
        name: &StorePathName,
        ca: &ContentAddress,
        references: &StoreReferences,
    ) -> Result<StorePath, StorePathError> {
        match ca {
            ContentAddress::Text { hash } => self.make_text_path(name, hash, references),
            ContentAddress::Fixed { method, hash } => {
                self.make_fixed_output_path(name, *method, hash, references)
            }
        }
    }

    /// Store path for an input-addressed derivation output: the inner hash
    /// is the derivation identity, the type carries the output name.
    pub fn make_output_path(
        &self,
        output_name: &str,
        drv_hash: &Hash,
        name: &StorePathName,
    ) -> StorePath {
        self.make_store_path(&format!("output:{output_name}"), drv_hash, name)
    }
}

impl Default for StoreDir {
    fn default() -> Self {
        StoreDir::new("/nix/store").unwrap()
    }
}

impl fmt::Display for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorePathError {
    #[error("store path digest has wrong length {0}")]
    DigestLength(usize),

    #[error("store path digest is not valid base32")]
    DigestEncoding,

    #[error("store path is missing the '-' separator")]
    MissingSeparator,

    #[error("store path name is empty")]
    EmptyName,

    #[error("store path name is longer than {STORE_PATH_NAME_MAX} bytes: {0}")]
    NameLength(usize),

    #[error("store path name starts with a period")]
    NameStartsWithPeriod,

    #[error("store path name contains invalid character '{0}'")]
    NameSymbol(char),

    #[error("store directory {0} is not absolute")]
    StoreDirNotAbsolute(PathBuf),

    #[error("store directory {0} is not valid UTF-8")]
    StoreDirNotUtf8(PathBuf),

    #[error("path '{0}' is not in the store")]
    NotInStore(String),

    #[error("text paths must use sha256, got {0}")]
    TextHashAlgorithm(&'static str),

    #[error("text paths cannot have self references")]
    TextSelfReference,

    #[error("flat-output paths cannot carry references")]
    FlatOutputReferences,
}
