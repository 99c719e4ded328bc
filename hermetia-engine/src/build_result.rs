// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Build result types shared by the scheduler, the builder, and the serve
//! protocol.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use hermetia_store_core::derivation::OutputName;
use hermetia_store_core::signature::Signature;
use hermetia_store_core::store_path::StorePath;

use crate::error::BuildError;

/// Flat status codes, wire-compatible with the serve protocol. The
/// success/failure split is a range check on the raw value so that new
/// codes can be added without breaking old receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum BuildStatus {
    Built = 0,
    Substituted = 1,
    AlreadyValid = 2,
    PermanentFailure = 3,
    InputRejected = 4,
    OutputRejected = 5,
    TransientFailure = 6,
    CachedFailure = 7,
    TimedOut = 8,
    MiscFailure = 9,
    DependencyFailed = 10,
    LogLimitExceeded = 11,
    NotDeterministic = 12,
    ResolvesToAlreadyValid = 13,
    NoSubstituters = 14,
}

impl BuildStatus {
    /// Whether a raw status code is in the success range.
    pub fn code_is_success(code: u16) -> bool {
        matches!(code, 0 | 1 | 2 | 13)
    }

    pub fn is_success(&self) -> bool {
        Self::code_is_success(*self as u16)
    }

    pub fn from_code(code: u16) -> Option<Self> {
        use BuildStatus::*;
        Some(match code {
            0 => Built,
            1 => Substituted,
            2 => AlreadyValid,
            3 => PermanentFailure,
            4 => InputRejected,
            5 => OutputRejected,
            6 => TransientFailure,
            7 => CachedFailure,
            8 => TimedOut,
            9 => MiscFailure,
            10 => DependencyFailed,
            11 => LogLimitExceeded,
            12 => NotDeterministic,
            13 => ResolvesToAlreadyValid,
            14 => NoSubstituters,
            _ => return None,
        })
    }
}

impl From<&BuildError> for BuildStatus {
    fn from(err: &BuildError) -> Self {
        match err {
            BuildError::InvalidInput(_) => BuildStatus::InputRejected,
            BuildError::DependencyFailed(_) => BuildStatus::DependencyFailed,
            BuildError::NotDeterministic => BuildStatus::NotDeterministic,
            BuildError::HashMismatch { .. } => BuildStatus::PermanentFailure,
            BuildError::OutputClash(_) => BuildStatus::OutputRejected,
            BuildError::Timeout | BuildError::SilentTimeout => BuildStatus::TimedOut,
            BuildError::LogSizeExceeded => BuildStatus::LogLimitExceeded,
            BuildError::Cancelled => BuildStatus::MiscFailure,
            BuildError::BuilderFailed(_) => BuildStatus::PermanentFailure,
            BuildError::SandboxSetupFailed(_) => BuildStatus::MiscFailure,
            BuildError::StoreFull | BuildError::TransientIo(_) => BuildStatus::TransientFailure,
            BuildError::SubstituterUnavailable(_) => BuildStatus::NoSubstituters,
            BuildError::SignatureRejected(_) => BuildStatus::MiscFailure,
            BuildError::OutputRejected(_) => BuildStatus::OutputRejected,
            BuildError::Misc(_) => BuildStatus::MiscFailure,
        }
    }
}

/// The realisation of one derivation output: where it ended up, and the
/// signatures vouching for that mapping (content-addressed outputs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Realisation {
    pub out_path: StorePath,
    pub signatures: BTreeSet<Signature>,
}

impl Realisation {
    pub fn unsigned(out_path: StorePath) -> Self {
        Realisation {
            out_path,
            signatures: BTreeSet::new(),
        }
    }
}

/// The exit value of a goal, reported to every waiter.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub status: BuildStatus,
    pub error: Option<BuildError>,
    pub times_built: u32,
    pub is_non_deterministic: bool,
    /// Unix timestamps; observable from outside the sandbox only.
    pub start_time: u64,
    pub stop_time: u64,
    pub built_outputs: BTreeMap<OutputName, Realisation>,
}

impl BuildResult {
    pub fn success(status: BuildStatus, built_outputs: BTreeMap<OutputName, Realisation>) -> Self {
        debug_assert!(status.is_success());
        BuildResult {
            status,
            error: None,
            times_built: 0,
            is_non_deterministic: false,
            start_time: 0,
            stop_time: 0,
            built_outputs,
        }
    }

    pub fn failure(error: BuildError) -> Self {
        BuildResult {
            status: BuildStatus::from(&error),
            is_non_deterministic: error == BuildError::NotDeterministic,
            error: Some(error),
            times_built: 0,
            start_time: 0,
            stop_time: 0,
            built_outputs: BTreeMap::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_range_partition() {
        for code in 0..=14u16 {
            let status = BuildStatus::from_code(code).unwrap();
            assert_eq!(status as u16, code);
            assert_eq!(status.is_success(), matches!(code, 0 | 1 | 2 | 13));
        }
        assert!(BuildStatus::from_code(15).is_none());
    }

    #[test]
    fn test_failure_status_mapping() {
        let result = BuildResult::failure(BuildError::Timeout);
        assert_eq!(result.status, BuildStatus::TimedOut);
        assert!(!result.is_success());

        let result = BuildResult::failure(BuildError::NotDeterministic);
        assert!(result.is_non_deterministic);
        assert_eq!(result.status, BuildStatus::NotDeterministic);
    }
}
