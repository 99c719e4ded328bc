// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Engine error taxonomy.
//!
//! [`BuildError`] values are per-goal outcomes: they are recorded on the
//! failing goal and surface to waiters as `DependencyFailed`. Only
//! [`EngineError`] values (bad configuration, invariant violations such as
//! dependency cycles) abort the scheduler itself.

use thiserror::Error;

use hermetia_store_core::store_path::{StorePath, StorePathError};

/// Fatal engine errors. These abort scheduling.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("dependency cycle involving '{0}'")]
    DependencyCycle(StorePath),

    #[error("database error: {0}")]
    Database(String),

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid store path: {0}")]
    StorePath(#[from] StorePathError),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl EngineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }
}

/// Per-goal failure causes, the §7 taxonomy of things a single build or
/// substitution can die of without taking the engine down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("dependency '{0}' failed")]
    DependencyFailed(String),

    #[error("build is not deterministic")]
    NotDeterministic,

    #[error("hash mismatch for output '{output}': declared {expected}, got {got}")]
    HashMismatch {
        output: String,
        expected: String,
        got: String,
    },

    #[error("floating output collides with existing non-identical path '{0}'")]
    OutputClash(StorePath),

    #[error("build timed out")]
    Timeout,

    #[error("build produced no output for too long")]
    SilentTimeout,

    #[error("build log exceeded the size limit")]
    LogSizeExceeded,

    #[error("build was cancelled")]
    Cancelled,

    #[error("builder failed: {0}")]
    BuilderFailed(ExitReason),

    #[error("sandbox setup failed: {0}")]
    SandboxSetupFailed(String),

    #[error("store is full")]
    StoreFull,

    #[error("transient IO error: {0}")]
    TransientIo(String),

    #[error("substituter unavailable: {0}")]
    SubstituterUnavailable(String),

    #[error("signature rejected: {0}")]
    SignatureRejected(String),

    #[error("output check failed: {0}")]
    OutputRejected(String),

    #[error("{0}")]
    Misc(String),
}

/// Why a builder process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Code(i32),
    Signal(i32),
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Code(c) => write!(f, "exit code {c}"),
            ExitReason::Signal(s) => write!(f, "killed by signal {s}"),
        }
    }
}

impl BuildError {
    /// Transient failures may be retried (with backoff) by substitution;
    /// builds are never automatically retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, BuildError::TransientIo(_) | BuildError::StoreFull)
    }
}

/// Helper trait for adding context to IO errors.
pub trait IoContext<T> {
    fn io_context<F>(self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> String;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F>(self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| EngineError::io(f(), e))
    }
}
