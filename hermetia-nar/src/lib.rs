// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! NAR (Nix ARchive) serialisation.
//!
//! The NAR format is the canonical byte representation of a filesystem
//! tree: only file contents, the executable bit, symlink targets, and
//! sorted directory structure are captured, so hashing a NAR gives a
//! deterministic identity for a store path.
//!
//! - [`writer`] encodes a tree on disk into the NAR byte format.
//! - [`stream`] exposes the encoding as a chunked [`bytes::Bytes`] stream.
//! - [`restorer`] unpacks a NAR byte stream back to disk.

pub mod restorer;
pub mod stream;
pub mod writer;

pub use restorer::restore;
pub use stream::NarByteStream;
pub use writer::{dump_path, dump_path_to_vec};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NarError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported file type at {0}")]
    UnsupportedFileType(std::path::PathBuf),

    #[error("directory entry name {0:?} is not valid in an archive")]
    InvalidEntryName(String),

    #[error("malformed archive: {0}")]
    Malformed(String),

    #[error("archive ended unexpectedly")]
    UnexpectedEof,
}

impl NarError {
    pub(crate) fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        NarError::Io {
            path: path.into(),
            source,
        }
    }
}
