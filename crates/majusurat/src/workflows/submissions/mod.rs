//! Letter request ("pengajuan surat") lifecycle.
//!
//! Submissions live in the primary store and every status move is mirrored into an append-only
//! audit ledger kept in a second store. The two stores share no transaction, so the
//! coordinator writes the submission first, logs second, and leans on a bounded retry queue
//! plus a reconciliation pass to close the gap.

pub mod attachments;
pub mod coordinator;
pub mod directory;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod machine;
pub mod memory;
pub mod reconciliation;
pub mod retry;
pub mod router;
pub mod store;

#[cfg(test)]
mod tests;

pub use attachments::{
    checksum_hex, AttachmentManager, AttachmentStore, FileUpload, LocalUploadStore,
    NewAttachment, UploadStore,
};
pub use coordinator::{
    CreateSubmission, LedgerWrite, SubmissionCoordinator, TransitionCommand, TransitionOutcome,
};
pub use directory::{IdentityDirectory, NewUser, UserDirectory};
pub use domain::{
    Attachment, LetterType, LogEntry, LogEntryKind, NewLogEntry, NewSubmission, Submission,
    SubmissionId, SubmissionStatus, TransitionPayload, User, UserId, UserRole,
};
pub use error::WorkflowError;
pub use ledger::{replay, tail_version, AuditLedger, ReplayError, ReplayedState};
pub use machine::TransitionError;
pub use memory::{
    InMemoryAttachmentStore, InMemoryAuditLedger, InMemorySubmissionStore, InMemoryUploadStore,
    InMemoryUserDirectory,
};
pub use reconciliation::{
    classify, spawn_reconciliation_worker, Drift, LedgerAnomaly, ReconciliationReport,
    UnresolvedDrift, RECONCILER_ACTOR,
};
pub use retry::{
    spawn_retry_worker, DrainReport, LedgerRetryQueue, PendingLedgerWrite, RetryPolicy,
    RetryQueueError, RetryQueueSnapshot,
};
pub use router::{submission_router, WorkflowServices, CALLER_HEADER};
pub use store::{StoreError, SubmissionChange, SubmissionFilter, SubmissionStore};
