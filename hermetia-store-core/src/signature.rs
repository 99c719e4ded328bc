// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Ed25519 signatures over path fingerprints.
//!
//! Keys and signatures use the `name:base64` format so that a signature
//! names the key that produced it and verifiers can look up the matching
//! trusted public key.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signer as _, Verifier as _};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("failed to read key file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode base64: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("key does not contain a ':' separator")]
    MissingSeparator,

    #[error("empty key name")]
    EmptyName,

    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid ed25519 key: {0}")]
    InvalidKey(String),
}

/// A named ed25519 secret key, `name:base64(32 or 64 bytes)`.
#[derive(Clone)]
pub struct SigningKey {
    name: String,
    key: ed25519_dalek::SigningKey,
}

impl SigningKey {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn from_file(path: &Path) -> Result<Self, SignatureError> {
        let contents = std::fs::read_to_string(path)?;
        contents.trim().parse()
    }

    /// Sign a fingerprint, producing a `name:base64` signature.
    pub fn sign(&self, fingerprint: &str) -> Signature {
        let sig = self.key.sign(fingerprint.as_bytes());
        Signature {
            key_name: self.name.clone(),
            bytes: sig.to_bytes(),
        }
    }

    /// The public half, in `name:base64` form.
    pub fn to_public_key(&self) -> PublicKey {
        PublicKey {
            name: self.name.clone(),
            key: self.key.verifying_key(),
        }
    }
}

impl FromStr for SigningKey {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, key_b64) = split_named(s)?;
        let bytes = BASE64.decode(key_b64)?;
        let key = match bytes.len() {
            32 => {
                let seed: [u8; 32] = bytes.as_slice().try_into().unwrap();
                ed25519_dalek::SigningKey::from_bytes(&seed)
            }
            64 => {
                let pair: [u8; 64] = bytes.as_slice().try_into().unwrap();
                ed25519_dalek::SigningKey::from_keypair_bytes(&pair)
                    .map_err(|e| SignatureError::InvalidKey(e.to_string()))?
            }
            n => {
                return Err(SignatureError::InvalidKeyLength {
                    expected: 64,
                    actual: n,
                });
            }
        };
        Ok(SigningKey {
            name: name.to_string(),
            key,
        })
    }
}

/// A named ed25519 public key, `name:base64(32 bytes)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    name: String,
    key: ed25519_dalek::VerifyingKey,
}

impl PublicKey {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check a signature made by this key over the given fingerprint.
    pub fn verify(&self, fingerprint: &str, signature: &Signature) -> bool {
        if signature.key_name != self.name {
            return false;
        }
        let sig = ed25519_dalek::Signature::from_bytes(&signature.bytes);
        self.key.verify(fingerprint.as_bytes(), &sig).is_ok()
    }
}

impl FromStr for PublicKey {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, key_b64) = split_named(s)?;
        let bytes = BASE64.decode(key_b64)?;
        let raw: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignatureError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            })?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&raw)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        Ok(PublicKey {
            name: name.to_string(),
            key,
        })
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, BASE64.encode(self.key.as_bytes()))
    }
}

/// A detached signature in `key-name:base64(64 bytes)` form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature {
    key_name: String,
    bytes: [u8; 64],
}

impl Signature {
    pub fn key_name(&self) -> &str {
        &self.key_name
    }
}

impl FromStr for Signature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, sig_b64) = split_named(s)?;
        let bytes = BASE64.decode(sig_b64)?;
        let bytes: [u8; 64] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignatureError::InvalidKeyLength {
                expected: 64,
                actual: bytes.len(),
            })?;
        Ok(Signature {
            key_name: name.to_string(),
            bytes,
        })
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key_name, BASE64.encode(self.bytes))
    }
}

fn split_named(s: &str) -> Result<(&str, &str), SignatureError> {
    let (name, rest) = s.split_once(':').ok_or(SignatureError::MissingSeparator)?;
    if name.is_empty() {
        return Err(SignatureError::EmptyName);
    }
    Ok((name, rest.trim()))
}

/// Generate a fresh signing key with the given name. Used by tests and by
/// cache setup tooling.
pub fn generate_key(name: &str) -> SigningKey {
    let mut seed = [0u8; 32];
    // getrandom via ring keeps the dependency set small.
    ring::rand::SecureRandom::fill(&ring::rand::SystemRandom::new(), &mut seed)
        .expect("system RNG unavailable");
    SigningKey {
        name: name.to_string(),
        key: ed25519_dalek::SigningKey::from_bytes(&seed),
    }
}
