// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Content-address descriptors for store paths.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::hash::{Algorithm, Hash, ParseHashError};

/// How file contents are turned into a content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileIngestionMethod {
    /// Hash of the file contents as-is (single regular file only).
    Flat,
    /// Hash of the NAR serialisation of the tree.
    Recursive,
}

impl FileIngestionMethod {
    pub fn prefix(&self) -> &'static str {
        match self {
            FileIngestionMethod::Flat => "",
            FileIngestionMethod::Recursive => "r:",
        }
    }
}

/// A content-address method paired with a hash algorithm, used by floating
/// and impure outputs whose hash is only known after the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContentAddressMethodAlgorithm {
    Text,
    Flat(Algorithm),
    Recursive(Algorithm),
}

impl ContentAddressMethodAlgorithm {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            ContentAddressMethodAlgorithm::Text => Algorithm::Sha256,
            ContentAddressMethodAlgorithm::Flat(a) => *a,
            ContentAddressMethodAlgorithm::Recursive(a) => *a,
        }
    }
}

impl fmt::Display for ContentAddressMethodAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentAddressMethodAlgorithm::Text => write!(f, "text:sha256"),
            ContentAddressMethodAlgorithm::Flat(a) => write!(f, "{a}"),
            ContentAddressMethodAlgorithm::Recursive(a) => write!(f, "r:{a}"),
        }
    }
}

impl FromStr for ContentAddressMethodAlgorithm {
    type Err = ContentAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "text:sha256" {
            Ok(ContentAddressMethodAlgorithm::Text)
        } else if let Some(algo) = s.strip_prefix("r:") {
            Ok(ContentAddressMethodAlgorithm::Recursive(algo.parse()?))
        } else {
            Ok(ContentAddressMethodAlgorithm::Flat(s.parse()?))
        }
    }
}

/// A full content address: method plus the observed hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContentAddress {
    /// Text file with the given hash of its contents.
    Text { hash: Hash },
    /// Fixed-output artifact with the given ingestion method and hash.
    Fixed {
        method: FileIngestionMethod,
        hash: Hash,
    },
}

impl ContentAddress {
    pub fn hash(&self) -> &Hash {
        match self {
            Self::Text { hash } | Self::Fixed { hash, .. } => hash,
        }
    }

    pub fn method(&self) -> ContentAddressMethodAlgorithm {
        match self {
            Self::Text { .. } => ContentAddressMethodAlgorithm::Text,
            Self::Fixed {
                method: FileIngestionMethod::Flat,
                hash,
            } => ContentAddressMethodAlgorithm::Flat(hash.algorithm()),
            Self::Fixed {
                method: FileIngestionMethod::Recursive,
                hash,
            } => ContentAddressMethodAlgorithm::Recursive(hash.algorithm()),
        }
    }

    /// Parse from the rendered form `text:sha256:...` or
    /// `fixed:[r:]<algo>:<digest>`.
    pub fn parse(s: &str) -> Result<Self, ContentAddressError> {
        if let Some(rest) = s.strip_prefix("text:") {
            let hash = Hash::parse(rest)?;
            if hash.algorithm() != Algorithm::Sha256 {
                return Err(ContentAddressError::TextHashAlgorithm);
            }
            Ok(ContentAddress::Text { hash })
        } else if let Some(rest) = s.strip_prefix("fixed:") {
            if let Some(rest) = rest.strip_prefix("r:") {
                Ok(ContentAddress::Fixed {
                    method: FileIngestionMethod::Recursive,
                    hash: Hash::parse(rest)?,
                })
            } else {
                Ok(ContentAddress::Fixed {
                    method: FileIngestionMethod::Flat,
                    hash: Hash::parse(rest)?,
                })
            }
        } else {
            Err(ContentAddressError::InvalidFormat(s.to_string()))
        }
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text { hash } => write!(f, "text:{}", hash.format_base32()),
            Self::Fixed { method, hash } => {
                write!(f, "fixed:{}{}", method.prefix(), hash.format_base32())
            }
        }
    }
}

impl FromStr for ContentAddress {
    type Err = ContentAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentAddress::parse(s)
    }
}

#[derive(Debug, Error)]
pub enum ContentAddressError {
    #[error("invalid content address format: {0}")]
    InvalidFormat(String),

    #[error("text content addresses must use sha256")]
    TextHashAlgorithm,

    #[error("invalid hash in content address: {0}")]
    InvalidHash(#[from] ParseHashError),
}
