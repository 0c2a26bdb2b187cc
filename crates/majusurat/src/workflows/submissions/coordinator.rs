//! Dual-store write coordinator.
//!
//! The submission store is authoritative for workflow state and is always written first. The
//! audit ledger follows; when it cannot be written the entry moves to the retry queue and the
//! caller still sees the committed transition.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info, warn};

use super::directory::IdentityDirectory;
use super::domain::{
    LetterType, LogEntry, LogEntryKind, NewLogEntry, NewSubmission, Submission, SubmissionId,
    SubmissionStatus, TransitionPayload, User, UserId, UserRole,
};
use super::error::WorkflowError;
use super::ledger::AuditLedger;
use super::machine::{self, TransitionRequest};
use super::retry::{LedgerRetryQueue, RetryQueueError};
use super::store::{StoreError, SubmissionChange, SubmissionFilter, SubmissionStore};

/// Body of a create request.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubmission {
    pub letter_type: LetterType,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Skip the draft stage and file the request immediately.
    #[serde(default)]
    pub submit: bool,
}

/// A requested status move.
#[derive(Debug, Clone, Deserialize)]
pub struct TransitionCommand {
    pub status: SubmissionStatus,
    /// Version the caller last saw; a mismatch fails fast with `ConcurrentModification`.
    #[serde(default)]
    pub expected_version: Option<u64>,
    #[serde(flatten)]
    pub payload: TransitionPayload,
}

/// What happened to the ledger half of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerWrite {
    Recorded { entry_id: u64 },
    /// Held in the retry queue.
    Queued,
    /// The retry queue was full; only reconciliation can restore the entry.
    Dropped,
    /// An earlier write for this submission was lost, so appending now would leave a gap.
    /// Reconciliation records the catch-up instead.
    Deferred,
    /// Reconciliation already recorded this version.
    CaughtUp,
    /// Nothing to record (no status change).
    NotRequired,
}

#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub submission: Submission,
    pub ledger: LedgerWrite,
}

pub struct SubmissionCoordinator {
    submissions: Arc<dyn SubmissionStore>,
    ledger: Arc<dyn AuditLedger>,
    directory: IdentityDirectory,
    retry_queue: Arc<LedgerRetryQueue>,
}

impl SubmissionCoordinator {
    pub fn new(
        submissions: Arc<dyn SubmissionStore>,
        ledger: Arc<dyn AuditLedger>,
        directory: IdentityDirectory,
        retry_queue: Arc<LedgerRetryQueue>,
    ) -> Self {
        Self {
            submissions,
            ledger,
            directory,
            retry_queue,
        }
    }

    pub fn directory(&self) -> &IdentityDirectory {
        &self.directory
    }

    pub fn retry_queue(&self) -> &Arc<LedgerRetryQueue> {
        &self.retry_queue
    }

    pub(crate) fn submissions(&self) -> &dyn SubmissionStore {
        self.submissions.as_ref()
    }

    pub(crate) fn ledger(&self) -> &dyn AuditLedger {
        self.ledger.as_ref()
    }

    /// Opens a new submission as a draft, or as `Submitted` through the direct-submit path.
    pub fn create(
        &self,
        actor_id: &UserId,
        request: CreateSubmission,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let actor = self.directory.resolve(actor_id)?;
        let status =
            machine::plan_creation(&actor, request.letter_type, &request.fields, request.submit)?;

        let submission = self.submissions.create(NewSubmission {
            applicant: actor.id.clone(),
            letter_type: request.letter_type,
            fields: request.fields,
            status,
            created_at: Utc::now(),
        })?;

        info!(
            submission_id = %submission.id,
            applicant = %submission.applicant,
            letter_type = submission.letter_type.label(),
            status = %submission.status,
            "submission created"
        );

        let ledger = if status == SubmissionStatus::Draft {
            LedgerWrite::NotRequired
        } else {
            self.record(NewLogEntry {
                submission_id: submission.id.clone(),
                from_status: SubmissionStatus::Draft,
                to_status: status,
                actor: actor.id,
                recorded_at: submission.created_at,
                note: Some("submitted directly".to_string()),
                submission_version: submission.version,
                kind: LogEntryKind::Transition,
            })
        };

        Ok(TransitionOutcome { submission, ledger })
    }

    /// Validates and commits a status move, then appends the matching ledger entry.
    pub fn apply_transition(
        &self,
        id: &SubmissionId,
        actor_id: &UserId,
        command: TransitionCommand,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let actor = self.directory.resolve(actor_id)?;
        let current = self.load(id)?;

        if let Some(expected) = command.expected_version {
            if expected != current.version {
                return Err(WorkflowError::ConcurrentModification(id.clone()));
            }
        }

        let reviewer = match &command.payload.reviewer {
            Some(reviewer_id) => self.find_user(reviewer_id)?,
            None => None,
        };

        let plan = machine::plan_transition(TransitionRequest {
            submission: &current,
            to: command.status,
            actor: &actor,
            reviewer: reviewer.as_ref(),
            payload: &command.payload,
        })?;

        let now = Utc::now();
        let mut change = SubmissionChange::from_current(&current, now);
        change.status = plan.to;
        change.assigned_reviewer = plan.assigned_reviewer;
        change.review_note = plan.review_note;
        change.rejection_reason = plan.rejection_reason;
        change.issuance_reference = plan.issuance_reference;

        let updated = self
            .submissions
            .conditional_update(id, current.version, change)
            .map_err(|err| WorkflowError::from_submission_store(id, err))?;

        info!(
            submission_id = %id,
            from = %plan.from,
            to = %plan.to,
            version = updated.version,
            actor = %actor.id,
            admin_override = plan.admin_override,
            "submission transition committed"
        );

        let ledger = self.record(NewLogEntry {
            submission_id: id.clone(),
            from_status: plan.from,
            to_status: plan.to,
            actor: actor.id,
            recorded_at: now,
            note: plan.ledger_note,
            submission_version: updated.version,
            kind: LogEntryKind::Transition,
        });

        Ok(TransitionOutcome {
            submission: updated,
            ledger,
        })
    }

    /// Replaces the payload fields of a draft. The status does not move, so nothing is logged.
    pub fn update_fields(
        &self,
        id: &SubmissionId,
        actor_id: &UserId,
        fields: BTreeMap<String, String>,
        expected_version: Option<u64>,
    ) -> Result<Submission, WorkflowError> {
        let actor = self.directory.resolve(actor_id)?;
        let current = self.load(id)?;

        if expected_version.is_some_and(|expected| expected != current.version) {
            return Err(WorkflowError::ConcurrentModification(id.clone()));
        }
        if current.status.is_terminal() {
            return Err(WorkflowError::SubmissionClosed {
                id: id.clone(),
                status: current.status,
            });
        }
        machine::authorize_draft_edit(&current, &actor)?;

        let mut change = SubmissionChange::from_current(&current, Utc::now());
        change.fields = fields;

        let updated = self
            .submissions
            .conditional_update(id, current.version, change)
            .map_err(|err| WorkflowError::from_submission_store(id, err))?;
        info!(submission_id = %id, version = updated.version, "draft fields updated");
        Ok(updated)
    }

    /// Applicants may only read their own submissions.
    pub fn get(&self, id: &SubmissionId, actor_id: &UserId) -> Result<Submission, WorkflowError> {
        let actor = self.directory.resolve(actor_id)?;
        let submission = self.load(id)?;
        ensure_can_view(&actor, &submission)?;
        Ok(submission)
    }

    pub fn list(
        &self,
        actor_id: &UserId,
        mut filter: SubmissionFilter,
    ) -> Result<Vec<Submission>, WorkflowError> {
        let actor = self.directory.resolve(actor_id)?;
        if actor.role == UserRole::Applicant {
            match &filter.applicant {
                Some(applicant) if applicant != &actor.id => {
                    return Err(WorkflowError::Forbidden(
                        "applicants may only list their own submissions".to_string(),
                    ));
                }
                _ => filter.applicant = Some(actor.id.clone()),
            }
        }

        let mut submissions = self.submissions.list(&filter)?;
        submissions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(submissions)
    }

    /// Ordered audit history of one submission.
    pub fn audit_log(
        &self,
        id: &SubmissionId,
        actor_id: &UserId,
    ) -> Result<Vec<LogEntry>, WorkflowError> {
        let actor = self.directory.resolve(actor_id)?;
        let submission = self.load(id)?;
        ensure_can_view(&actor, &submission)?;
        Ok(self.ledger.list_by_submission(id)?)
    }

    pub(crate) fn load(&self, id: &SubmissionId) -> Result<Submission, WorkflowError> {
        self.submissions
            .get(id)
            .map_err(|err| WorkflowError::from_submission_store(id, err))
    }

    fn find_user(&self, id: &UserId) -> Result<Option<User>, WorkflowError> {
        match self.directory.resolve(id) {
            Ok(user) => Ok(Some(user)),
            Err(WorkflowError::NotFound(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    /// Second half of write-then-log. Never fails the caller.
    fn record(&self, entry: NewLogEntry) -> LedgerWrite {
        // Later entries must queue behind earlier ones for the same submission.
        if self.retry_queue.has_pending(&entry.submission_id)
            || self.retry_queue.has_lost_write(&entry.submission_id)
        {
            return self.enqueue(entry, "earlier ledger writes are still pending");
        }

        match self.ledger.append(entry.clone()) {
            Ok(stored) => LedgerWrite::Recorded { entry_id: stored.id },
            Err(StoreError::VersionConflict { found, .. }) => {
                info!(
                    submission_id = %entry.submission_id,
                    version = entry.submission_version,
                    ledger_version = found,
                    "ledger already caught up past this transition"
                );
                LedgerWrite::CaughtUp
            }
            Err(err) => {
                warn!(
                    submission_id = %entry.submission_id,
                    version = entry.submission_version,
                    error = %err,
                    "ledger append failed; queueing for retry"
                );
                self.enqueue(entry, &err.to_string())
            }
        }
    }

    fn enqueue(&self, entry: NewLogEntry, cause: &str) -> LedgerWrite {
        let submission_id = entry.submission_id.clone();
        let version = entry.submission_version;
        match self.retry_queue.enqueue(entry, cause) {
            Ok(()) => LedgerWrite::Queued,
            Err(err @ RetryQueueError::EarlierWriteLost(_)) => {
                warn!(
                    submission_id = %submission_id,
                    version,
                    error = %err,
                    "ledger write deferred to reconciliation"
                );
                LedgerWrite::Deferred
            }
            Err(err @ RetryQueueError::Full { .. }) => {
                error!(
                    submission_id = %submission_id,
                    version,
                    error = %err,
                    "ledger write dropped; reconciliation will restore it"
                );
                LedgerWrite::Dropped
            }
        }
    }
}

fn ensure_can_view(actor: &User, submission: &Submission) -> Result<(), WorkflowError> {
    if actor.role == UserRole::Applicant && actor.id != submission.applicant {
        Err(WorkflowError::Forbidden(format!(
            "submission {} belongs to another applicant",
            submission.id
        )))
    } else {
        Ok(())
    }
}
