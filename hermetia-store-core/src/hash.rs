// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Hash types and digest computation.
//!
//! A [`Hash`] pairs an [`Algorithm`] with its digest bytes and can be
//! rendered or parsed in base16, store base32, or base64. Parsing in
//! `algo:digest` form selects the encoding by the digest length, the same
//! trick the original store database relies on.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

use crate::base32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Algorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Sha1 => "sha1",
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    pub fn digest_size(&self) -> usize {
        match self {
            Algorithm::Sha1 => 20,
            Algorithm::Sha256 => 32,
            Algorithm::Sha512 => 64,
        }
    }

    pub fn base16_len(&self) -> usize {
        self.digest_size() * 2
    }

    pub fn base32_len(&self) -> usize {
        base32::encode_len(self.digest_size())
    }

    pub fn base64_len(&self) -> usize {
        self.digest_size().div_ceil(3) * 4
    }

    pub fn from_name(name: &str) -> Result<Self, ParseHashError> {
        match name {
            "sha1" => Ok(Algorithm::Sha1),
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            _ => Err(ParseHashError::UnknownAlgorithm(name.to_string())),
        }
    }

    fn ring_algorithm(&self) -> &'static ring::digest::Algorithm {
        match self {
            Algorithm::Sha1 => &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
            Algorithm::Sha256 => &ring::digest::SHA256,
            Algorithm::Sha512 => &ring::digest::SHA512,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Algorithm {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Algorithm::from_name(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash {
    algo: Algorithm,
    digest: Vec<u8>,
}

impl Hash {
    pub fn new(algo: Algorithm, digest: Vec<u8>) -> Result<Self, ParseHashError> {
        if digest.len() != algo.digest_size() {
            return Err(ParseHashError::InvalidDigestSize {
                expected: algo.digest_size(),
                actual: digest.len(),
            });
        }
        Ok(Hash { algo, digest })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algo
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.digest
    }

    /// Parse a hash in the format `algo:digest`. The digest encoding
    /// (base16, store base32, base64) is selected by its length.
    pub fn parse(s: &str) -> Result<Self, ParseHashError> {
        let (algo_str, digest_str) = s
            .split_once(':')
            .ok_or_else(|| ParseHashError::InvalidFormat(s.to_string()))?;
        let algo = Algorithm::from_name(algo_str)?;
        Self::parse_digest(algo, digest_str)
    }

    /// Parse a bare digest with a known algorithm.
    pub fn parse_digest(algo: Algorithm, digest_str: &str) -> Result<Self, ParseHashError> {
        let digest = if digest_str.len() == algo.base16_len() {
            hex::decode(digest_str).map_err(|e| ParseHashError::Base16Decode(e.to_string()))?
        } else if digest_str.len() == algo.base32_len() {
            base32::decode(digest_str.as_bytes()).map_err(ParseHashError::Base32Decode)?
        } else if digest_str.len() == algo.base64_len() {
            BASE64
                .decode(digest_str)
                .map_err(|e| ParseHashError::Base64Decode(e.to_string()))?
        } else {
            return Err(ParseHashError::InvalidDigestLength {
                algo: algo.name().to_string(),
                actual: digest_str.len(),
            });
        };
        Hash::new(algo, digest)
    }

    /// Hex encoding of the digest without the algorithm prefix.
    pub fn to_base16(&self) -> String {
        hex::encode(&self.digest)
    }

    /// Store base32 encoding of the digest without the algorithm prefix.
    pub fn to_base32(&self) -> String {
        base32::encode(&self.digest)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.digest)
    }

    /// `algo:hex` rendering, the form stored in the metadata database.
    pub fn format_base16(&self) -> String {
        format!("{}:{}", self.algo, self.to_base16())
    }

    /// `algo:base32` rendering, the form used in narinfo and fingerprints.
    pub fn format_base32(&self) -> String {
        format!("{}:{}", self.algo, self.to_base32())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo, self.to_base16())
    }
}

impl std::str::FromStr for Hash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash::parse(s)
    }
}

/// Incremental digest computation.
pub struct HashContext {
    algo: Algorithm,
    inner: ring::digest::Context,
}

impl HashContext {
    pub fn new(algo: Algorithm) -> Self {
        Self {
            algo,
            inner: ring::digest::Context::new(algo.ring_algorithm()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finish(self) -> Hash {
        let digest = self.inner.finish();
        Hash {
            algo: self.algo,
            digest: digest.as_ref().to_vec(),
        }
    }
}

/// One-shot digest of a byte slice.
pub fn digest(algo: Algorithm, data: impl AsRef<[u8]>) -> Hash {
    let mut ctx = HashContext::new(algo);
    ctx.update(data.as_ref());
    ctx.finish()
}

#[derive(Error, Debug)]
pub enum ParseHashError {
    #[error("unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("invalid hash format: {0}")]
    InvalidFormat(String),

    #[error("invalid digest size: expected {expected}, got {actual}")]
    InvalidDigestSize { expected: usize, actual: usize },

    #[error("invalid digest length for {algo}: {actual}")]
    InvalidDigestLength { algo: String, actual: usize },

    #[error("base16 decode error: {0}")]
    Base16Decode(String),

    #[error("base32 decode error: {0}")]
    Base32Decode(String),

    #[error("base64 decode error: {0}")]
    Base64Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_known_value() {
        let hash = digest(Algorithm::Sha256, "hello world");
        assert_eq!(
            hash.to_base16(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            hash.to_base32(),
            "1sfdxziarxw8j3p80lvswgpq9i7smdyxmmsj5sjhhgjdjfwjfkdr"
        );
        assert_eq!(hash.to_base64(), "uU0nuZNNPgilLlLX2n2r+sSE7+N6U4DukIj3rOLvzek=");
    }

    #[test]
    fn test_parse_all_encodings() {
        let hash = digest(Algorithm::Sha256, "hello world");
        for rendered in [
            hash.format_base16(),
            hash.format_base32(),
            format!("sha256:{}", hash.to_base64()),
        ] {
            let parsed = Hash::parse(&rendered).unwrap();
            assert_eq!(parsed, hash, "failed to round-trip {rendered}");
        }
    }

    #[test]
    fn test_parse_invalid_format() {
        assert!(matches!(
            Hash::parse("sha256-invalid"),
            Err(ParseHashError::InvalidFormat(_))
        ));
        assert!(matches!(
            Hash::parse("whirlpool:00"),
            Err(ParseHashError::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut ctx = HashContext::new(Algorithm::Sha256);
        ctx.update(b"hello ");
        ctx.update(b"world");
        assert_eq!(ctx.finish(), digest(Algorithm::Sha256, "hello world"));
    }
}
