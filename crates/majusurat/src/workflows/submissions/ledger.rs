use serde::Serialize;

use super::domain::{LogEntry, NewLogEntry, SubmissionId, SubmissionStatus};
use super::store::StoreError;

/// Append-only audit store. Entries come back in append order and are never rewritten.
///
/// Version stamps strictly increase per submission: both appends fail with
/// `StoreError::VersionConflict` instead of recording an entry at or below the tail.
pub trait AuditLedger: Send + Sync {
    fn append(&self, entry: NewLogEntry) -> Result<LogEntry, StoreError>;
    /// Appends only while the submission's latest recorded version is `expected_tail`
    /// (zero for an empty history).
    fn append_after(&self, expected_tail: u64, entry: NewLogEntry)
        -> Result<LogEntry, StoreError>;
    fn list_by_submission(&self, id: &SubmissionId) -> Result<Vec<LogEntry>, StoreError>;
}

/// Latest version stamp recorded for a submission, zero for an empty history.
pub fn tail_version(entries: &[LogEntry]) -> u64 {
    entries
        .iter()
        .map(|entry| entry.submission_version)
        .max()
        .unwrap_or(0)
}

/// Why a ledger history could not be replayed from `Draft`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum ReplayError {
    #[error("entry {entry_id} starts from {found} but the history was at {expected}")]
    Discontinuity {
        entry_id: u64,
        expected: SubmissionStatus,
        found: SubmissionStatus,
    },
    #[error("entry {entry_id} carries version {version}, not above the previous {previous}")]
    VersionRegression {
        entry_id: u64,
        version: u64,
        previous: u64,
    },
}

/// Result of a successful replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayedState {
    pub status: SubmissionStatus,
    /// Version stamp carried by the last entry, zero for an empty history.
    pub version: u64,
}

/// Replays `entries` from the initial `Draft` status.
pub fn replay(entries: &[LogEntry]) -> Result<ReplayedState, ReplayError> {
    entries.iter().try_fold(
        ReplayedState {
            status: SubmissionStatus::Draft,
            version: 0,
        },
        |state, entry| {
            if entry.from_status != state.status {
                return Err(ReplayError::Discontinuity {
                    entry_id: entry.id,
                    expected: state.status,
                    found: entry.from_status,
                });
            }
            if entry.submission_version <= state.version {
                return Err(ReplayError::VersionRegression {
                    entry_id: entry.id,
                    version: entry.submission_version,
                    previous: state.version,
                });
            }
            Ok(ReplayedState {
                status: entry.to_status,
                version: entry.submission_version,
            })
        },
    )
}
