use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use super::domain::{NewSubmission, Submission, SubmissionId, SubmissionStatus, UserId};

/// Error enumeration shared by the store adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("version conflict (expected {expected}, found {found})")]
    VersionConflict { expected: u64, found: u64 },
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// New field values written together with a version bump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionChange {
    pub status: SubmissionStatus,
    pub fields: BTreeMap<String, String>,
    pub assigned_reviewer: Option<UserId>,
    pub review_note: Option<String>,
    pub rejection_reason: Option<String>,
    pub issuance_reference: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SubmissionChange {
    /// Starts from the current row so callers only override what moves.
    pub fn from_current(submission: &Submission, updated_at: DateTime<Utc>) -> Self {
        Self {
            status: submission.status,
            fields: submission.fields.clone(),
            assigned_reviewer: submission.assigned_reviewer.clone(),
            review_note: submission.review_note.clone(),
            rejection_reason: submission.rejection_reason.clone(),
            issuance_reference: submission.issuance_reference.clone(),
            updated_at,
        }
    }
}

/// Query filter for submission listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionFilter {
    pub status: Option<SubmissionStatus>,
    pub applicant: Option<UserId>,
}

impl SubmissionFilter {
    pub fn matches(&self, submission: &Submission) -> bool {
        self.status.map_or(true, |status| submission.status == status)
            && self
                .applicant
                .as_ref()
                .map_or(true, |applicant| &submission.applicant == applicant)
    }
}

/// Primary store holding submissions. Rows carry a version stamp; writes are compare-and-swap.
pub trait SubmissionStore: Send + Sync {
    fn create(&self, draft: NewSubmission) -> Result<Submission, StoreError>;
    fn get(&self, id: &SubmissionId) -> Result<Submission, StoreError>;
    /// Applies `change` only when the stored version equals `expected_version`, returning the
    /// row with its bumped version.
    fn conditional_update(
        &self,
        id: &SubmissionId,
        expected_version: u64,
        change: SubmissionChange,
    ) -> Result<Submission, StoreError>;
    fn list(&self, filter: &SubmissionFilter) -> Result<Vec<Submission>, StoreError>;
}
