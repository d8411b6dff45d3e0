//! Paired-key verification: the two-frame exchange that proves each side of
//! a connection holds the private certificate the other side expects.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::proto::{DeviceVisibility, PairedKeyStatus};

pub mod connection;
pub mod frames_reader;
pub mod runner;

pub use connection::{FrameConnection, InMemoryConnection};
pub use frames_reader::IncomingFramesReader;
pub use runner::{PairedKeyVerificationRunner, PairedKeyVerificationRunnerBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairedKeyVerificationResult {
    Success,
    Fail,
    Unable,
    Unknown,
}

/// Any failure fails the whole; anything short of unanimous success is
/// unable.
pub fn merge_results(results: &[PairedKeyVerificationResult]) -> PairedKeyVerificationResult {
    if results.contains(&PairedKeyVerificationResult::Fail) {
        PairedKeyVerificationResult::Fail
    } else if results
        .iter()
        .all(|r| *r == PairedKeyVerificationResult::Success)
    {
        PairedKeyVerificationResult::Success
    } else {
        PairedKeyVerificationResult::Unable
    }
}

impl From<PairedKeyStatus> for PairedKeyVerificationResult {
    fn from(status: PairedKeyStatus) -> Self {
        match status {
            PairedKeyStatus::Success => Self::Success,
            PairedKeyStatus::Fail => Self::Fail,
            PairedKeyStatus::Unable => Self::Unable,
            PairedKeyStatus::Unknown => Self::Unknown,
        }
    }
}

impl From<PairedKeyVerificationResult> for PairedKeyStatus {
    fn from(result: PairedKeyVerificationResult) -> Self {
        match result {
            PairedKeyVerificationResult::Success => Self::Success,
            PairedKeyVerificationResult::Fail => Self::Fail,
            PairedKeyVerificationResult::Unable => Self::Unable,
            PairedKeyVerificationResult::Unknown => Self::Unknown,
        }
    }
}

/// The remote device as seen by the sharing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareTarget {
    pub id: i64,
    pub device_name: String,
    /// True when we are the receiver of the share.
    pub is_incoming: bool,
    /// True when the peer's certificate resolved to a known contact.
    pub is_known: bool,
}

/// Snapshot of the local visibility preference and its last change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilitySettings {
    pub visibility: DeviceVisibility,
    pub last_visibility: DeviceVisibility,
    pub last_visibility_timestamp: SystemTime,
}

impl VisibilitySettings {
    /// A visibility that has never changed.
    pub fn new(visibility: DeviceVisibility) -> Self {
        Self {
            visibility,
            last_visibility: visibility,
            last_visibility_timestamp: UNIX_EPOCH,
        }
    }

    /// `visibility` was switched from `last_visibility` at `changed_at`.
    pub fn changed(
        visibility: DeviceVisibility,
        last_visibility: DeviceVisibility,
        changed_at: SystemTime,
    ) -> Self {
        Self {
            visibility,
            last_visibility,
            last_visibility_timestamp: changed_at,
        }
    }
}
