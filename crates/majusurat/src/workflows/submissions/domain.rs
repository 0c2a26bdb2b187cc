use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier wrapper for directory users.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier wrapper for letter submissions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubmissionId(pub String);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Roles recognised by the transition authorization table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Applicant,
    Staff,
    Admin,
}

impl UserRole {
    pub const fn label(self) -> &'static str {
        match self {
            UserRole::Applicant => "applicant",
            UserRole::Staff => "staff",
            UserRole::Admin => "admin",
        }
    }

    /// Staff and admins may be assigned as reviewers.
    pub const fn can_review(self) -> bool {
        matches!(self, UserRole::Staff | UserRole::Admin)
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub role: UserRole,
}

/// Lifecycle status of a letter submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Draft,
    Submitted,
    UnderReview,
    Approved,
    Rejected,
    Completed,
}

impl SubmissionStatus {
    pub const ALL: [SubmissionStatus; 6] = [
        SubmissionStatus::Draft,
        SubmissionStatus::Submitted,
        SubmissionStatus::UnderReview,
        SubmissionStatus::Approved,
        SubmissionStatus::Rejected,
        SubmissionStatus::Completed,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            SubmissionStatus::Draft => "draft",
            SubmissionStatus::Submitted => "submitted",
            SubmissionStatus::UnderReview => "under_review",
            SubmissionStatus::Approved => "approved",
            SubmissionStatus::Rejected => "rejected",
            SubmissionStatus::Completed => "completed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, SubmissionStatus::Rejected | SubmissionStatus::Completed)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Kinds of letters the village office issues, each with its own intake fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LetterType {
    /// Surat keterangan domisili.
    Domicile,
    /// Surat keterangan usaha.
    Business,
    /// Surat keterangan tidak mampu.
    LowIncome,
    /// Surat pengantar SKCK.
    PoliceClearance,
    Other,
}

const COMMON_FIELDS: [&str; 2] = ["nik", "purpose"];

impl LetterType {
    pub const fn label(self) -> &'static str {
        match self {
            LetterType::Domicile => "domicile",
            LetterType::Business => "business",
            LetterType::LowIncome => "low_income",
            LetterType::PoliceClearance => "police_clearance",
            LetterType::Other => "other",
        }
    }

    fn specific_fields(self) -> &'static [&'static str] {
        match self {
            LetterType::Domicile => &["address"],
            LetterType::Business => &["business_name", "business_address"],
            LetterType::LowIncome => &["household_income"],
            LetterType::PoliceClearance => &["birth_place", "birth_date"],
            LetterType::Other => &["letter_title"],
        }
    }

    /// Payload keys that must be non-blank before the request can leave `Draft`.
    pub fn required_fields(self) -> impl Iterator<Item = &'static str> {
        COMMON_FIELDS
            .iter()
            .copied()
            .chain(self.specific_fields().iter().copied())
    }

    pub fn missing_fields(self, fields: &BTreeMap<String, String>) -> Vec<&'static str> {
        self.required_fields()
            .filter(|key| {
                fields
                    .get(*key)
                    .map(|value| value.trim().is_empty())
                    .unwrap_or(true)
            })
            .collect()
    }
}

/// A letter request as held by the primary store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub applicant: UserId,
    pub letter_type: LetterType,
    pub fields: BTreeMap<String, String>,
    pub status: SubmissionStatus,
    pub assigned_reviewer: Option<UserId>,
    pub review_note: Option<String>,
    pub rejection_reason: Option<String>,
    pub issuance_reference: Option<String>,
    /// Monotonic stamp bumped on every conditional write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values handed to the store when a submission is first persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubmission {
    pub applicant: UserId,
    pub letter_type: LetterType,
    pub fields: BTreeMap<String, String>,
    pub status: SubmissionStatus,
    pub created_at: DateTime<Utc>,
}

/// Free-form data accompanying a transition request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionPayload {
    #[serde(default)]
    pub reviewer: Option<UserId>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub issuance_reference: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEntryKind {
    Transition,
    /// Catch-up entry synthesized by a reconciliation pass.
    Reconciliation,
}

/// Immutable audit ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub submission_id: SubmissionId,
    pub from_status: SubmissionStatus,
    pub to_status: SubmissionStatus,
    pub actor: UserId,
    pub recorded_at: DateTime<Utc>,
    pub note: Option<String>,
    pub submission_version: u64,
    pub kind: LogEntryKind,
}

/// Ledger row before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLogEntry {
    pub submission_id: SubmissionId,
    pub from_status: SubmissionStatus,
    pub to_status: SubmissionStatus,
    pub actor: UserId,
    pub recorded_at: DateTime<Utc>,
    pub note: Option<String>,
    pub submission_version: u64,
    pub kind: LogEntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: u64,
    pub submission_id: SubmissionId,
    pub storage_path: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the uploaded bytes.
    pub checksum: String,
    pub uploaded_by: UserId,
    pub uploaded_at: DateTime<Utc>,
}
