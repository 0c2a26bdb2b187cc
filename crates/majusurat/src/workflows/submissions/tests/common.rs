use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::response::Response;
use serde_json::Value;

use crate::workflows::submissions::attachments::AttachmentManager;
use crate::workflows::submissions::coordinator::{
    CreateSubmission, SubmissionCoordinator, TransitionCommand, TransitionOutcome,
};
use crate::workflows::submissions::directory::IdentityDirectory;
use crate::workflows::submissions::domain::{
    LetterType, LogEntry, NewLogEntry, NewSubmission, Submission, SubmissionId, SubmissionStatus,
    TransitionPayload, User, UserId, UserRole,
};
use crate::workflows::submissions::error::WorkflowError;
use crate::workflows::submissions::ledger::AuditLedger;
use crate::workflows::submissions::memory::{
    InMemoryAttachmentStore, InMemoryAuditLedger, InMemorySubmissionStore, InMemoryUploadStore,
    InMemoryUserDirectory,
};
use crate::workflows::submissions::retry::{LedgerRetryQueue, RetryPolicy};
use crate::workflows::submissions::router::{submission_router, WorkflowServices};
use crate::workflows::submissions::store::{
    StoreError, SubmissionChange, SubmissionFilter, SubmissionStore,
};

pub(super) const APPLICANT: &str = "warga-1";
pub(super) const OTHER_APPLICANT: &str = "warga-2";
pub(super) const STAFF: &str = "petugas-1";
pub(super) const ADMIN: &str = "admin";

pub(super) fn uid(raw: &str) -> UserId {
    UserId(raw.to_string())
}

pub(super) fn users() -> Vec<User> {
    vec![
        User {
            id: uid(APPLICANT),
            display_name: "Siti Aminah".to_string(),
            role: UserRole::Applicant,
        },
        User {
            id: uid(OTHER_APPLICANT),
            display_name: "Budi Santoso".to_string(),
            role: UserRole::Applicant,
        },
        User {
            id: uid(STAFF),
            display_name: "Petugas Pelayanan".to_string(),
            role: UserRole::Staff,
        },
        User {
            id: uid(ADMIN),
            display_name: "Kepala Desa".to_string(),
            role: UserRole::Admin,
        },
    ]
}

pub(super) fn business_fields() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("nik".to_string(), "3201010101900001".to_string()),
        ("purpose".to_string(), "Pengajuan KUR".to_string()),
        ("business_name".to_string(), "Warung Sembako Amanah".to_string()),
        ("business_address".to_string(), "Jl. Melati No. 4".to_string()),
    ])
}

/// Retry policy that never backs off in tests driven by `flush`.
pub(super) fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        capacity: 16,
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
    }
}

/// Valid payload for the table row ending in `to`.
pub(super) fn payload_for(to: SubmissionStatus) -> TransitionPayload {
    let mut payload = TransitionPayload::default();
    match to {
        SubmissionStatus::UnderReview => payload.reviewer = Some(uid(STAFF)),
        SubmissionStatus::Approved => payload.note = Some("berkas lengkap".to_string()),
        SubmissionStatus::Rejected => payload.reason = Some("NIK tidak terdaftar".to_string()),
        SubmissionStatus::Completed => {
            payload.issuance_reference = Some("470/012/DS/2025".to_string())
        }
        SubmissionStatus::Draft | SubmissionStatus::Submitted => {}
    }
    payload
}

pub(super) fn command(to: SubmissionStatus, payload: TransitionPayload) -> TransitionCommand {
    TransitionCommand {
        status: to,
        expected_version: None,
        payload,
    }
}

type ReadHook = Box<dyn FnOnce() + Send>;

/// Ledger whose reads and appends can be switched off independently.
#[derive(Default)]
pub(super) struct FlakyLedger {
    inner: InMemoryAuditLedger,
    appends_down: AtomicBool,
    reads_down: AtomicBool,
    after_next_read: Mutex<Option<ReadHook>>,
}

impl FlakyLedger {
    pub(super) fn fail_appends(&self, down: bool) {
        self.appends_down.store(down, Ordering::SeqCst);
    }

    pub(super) fn fail_reads(&self, down: bool) {
        self.reads_down.store(down, Ordering::SeqCst);
    }

    /// Runs `hook` once, right after the next read has been served.
    pub(super) fn after_next_read(&self, hook: impl FnOnce() + Send + 'static) {
        *self.after_next_read.lock().expect("hook mutex poisoned") = Some(Box::new(hook));
    }

    pub(super) fn entries(&self) -> Vec<LogEntry> {
        self.inner.entries()
    }

    pub(super) fn entries_for(&self, id: &SubmissionId) -> Vec<LogEntry> {
        self.inner
            .entries()
            .into_iter()
            .filter(|entry| &entry.submission_id == id)
            .collect()
    }
}

impl AuditLedger for FlakyLedger {
    fn append(&self, entry: NewLogEntry) -> Result<LogEntry, StoreError> {
        if self.appends_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("audit store offline".to_string()));
        }
        self.inner.append(entry)
    }

    fn append_after(&self, expected_tail: u64, entry: NewLogEntry) -> Result<LogEntry, StoreError> {
        if self.appends_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("audit store offline".to_string()));
        }
        self.inner.append_after(expected_tail, entry)
    }

    fn list_by_submission(&self, id: &SubmissionId) -> Result<Vec<LogEntry>, StoreError> {
        if self.reads_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("audit store offline".to_string()));
        }
        let entries = self.inner.list_by_submission(id);
        let hook = self.after_next_read.lock().expect("hook mutex poisoned").take();
        if let Some(hook) = hook {
            hook();
        }
        entries
    }
}

/// Serves a frozen snapshot from `get` once armed, simulating a caller that loaded the
/// submission before a competing write landed.
#[derive(Default)]
pub(super) struct StaleReadStore {
    inner: InMemorySubmissionStore,
    frozen: Mutex<Option<Submission>>,
}

impl StaleReadStore {
    pub(super) fn freeze(&self, id: &SubmissionId) {
        let snapshot = self.inner.get(id).expect("submission to freeze");
        *self.frozen.lock().expect("stale store mutex poisoned") = Some(snapshot);
    }
}

impl SubmissionStore for StaleReadStore {
    fn create(&self, draft: NewSubmission) -> Result<Submission, StoreError> {
        self.inner.create(draft)
    }

    fn get(&self, id: &SubmissionId) -> Result<Submission, StoreError> {
        let frozen = self.frozen.lock().expect("stale store mutex poisoned");
        match frozen.as_ref() {
            Some(snapshot) if &snapshot.id == id => Ok(snapshot.clone()),
            _ => self.inner.get(id),
        }
    }

    fn conditional_update(
        &self,
        id: &SubmissionId,
        expected_version: u64,
        change: SubmissionChange,
    ) -> Result<Submission, StoreError> {
        self.inner.conditional_update(id, expected_version, change)
    }

    fn list(&self, filter: &SubmissionFilter) -> Result<Vec<Submission>, StoreError> {
        self.inner.list(filter)
    }
}

/// Fails every call, standing in for an unreachable primary store.
pub(super) struct OfflineSubmissionStore;

impl SubmissionStore for OfflineSubmissionStore {
    fn create(&self, _draft: NewSubmission) -> Result<Submission, StoreError> {
        Err(StoreError::Unavailable("primary store offline".to_string()))
    }

    fn get(&self, _id: &SubmissionId) -> Result<Submission, StoreError> {
        Err(StoreError::Unavailable("primary store offline".to_string()))
    }

    fn conditional_update(
        &self,
        _id: &SubmissionId,
        _expected_version: u64,
        _change: SubmissionChange,
    ) -> Result<Submission, StoreError> {
        Err(StoreError::Unavailable("primary store offline".to_string()))
    }

    fn list(&self, _filter: &SubmissionFilter) -> Result<Vec<Submission>, StoreError> {
        Err(StoreError::Unavailable("primary store offline".to_string()))
    }
}

pub(super) struct Harness {
    pub(super) submissions: Arc<dyn SubmissionStore>,
    pub(super) ledger: Arc<FlakyLedger>,
    pub(super) attachment_rows: Arc<InMemoryAttachmentStore>,
    pub(super) uploads: Arc<InMemoryUploadStore>,
    pub(super) queue: Arc<LedgerRetryQueue>,
    pub(super) coordinator: Arc<SubmissionCoordinator>,
    pub(super) attachments: Arc<AttachmentManager>,
}

impl Harness {
    pub(super) fn new() -> Self {
        Self::with_parts(Arc::new(InMemorySubmissionStore::default()), fast_policy())
    }

    pub(super) fn with_policy(policy: RetryPolicy) -> Self {
        Self::with_parts(Arc::new(InMemorySubmissionStore::default()), policy)
    }

    pub(super) fn with_parts(submissions: Arc<dyn SubmissionStore>, policy: RetryPolicy) -> Self {
        let ledger = Arc::new(FlakyLedger::default());
        let attachment_rows = Arc::new(InMemoryAttachmentStore::default());
        let uploads = Arc::new(InMemoryUploadStore::default());
        let queue = Arc::new(LedgerRetryQueue::new(policy));
        let directory =
            IdentityDirectory::new(Arc::new(InMemoryUserDirectory::with_users(users())));

        let coordinator = Arc::new(SubmissionCoordinator::new(
            submissions.clone(),
            ledger.clone(),
            directory.clone(),
            queue.clone(),
        ));
        let attachments = Arc::new(AttachmentManager::new(
            submissions.clone(),
            attachment_rows.clone(),
            uploads.clone(),
            directory,
        ));

        Self {
            submissions,
            ledger,
            attachment_rows,
            uploads,
            queue,
            coordinator,
            attachments,
        }
    }

    pub(super) fn router(&self) -> axum::Router {
        submission_router(WorkflowServices {
            coordinator: self.coordinator.clone(),
            attachments: self.attachments.clone(),
        })
    }

    pub(super) fn create_draft(&self, applicant: &str) -> Submission {
        self.coordinator
            .create(
                &uid(applicant),
                CreateSubmission {
                    letter_type: LetterType::Business,
                    fields: business_fields(),
                    submit: false,
                },
            )
            .expect("draft created")
            .submission
    }

    pub(super) fn transition(
        &self,
        id: &SubmissionId,
        actor: &str,
        to: SubmissionStatus,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.coordinator
            .apply_transition(id, &uid(actor), command(to, payload_for(to)))
    }

    /// Creates a submission and walks it along the happy path until it reaches `target`.
    pub(super) fn submission_in(&self, target: SubmissionStatus) -> Submission {
        let draft = self.create_draft(APPLICANT);
        let path: &[(SubmissionStatus, &str)] = match target {
            SubmissionStatus::Draft => &[],
            SubmissionStatus::Submitted => &[(SubmissionStatus::Submitted, APPLICANT)],
            SubmissionStatus::UnderReview => &[
                (SubmissionStatus::Submitted, APPLICANT),
                (SubmissionStatus::UnderReview, STAFF),
            ],
            SubmissionStatus::Approved => &[
                (SubmissionStatus::Submitted, APPLICANT),
                (SubmissionStatus::UnderReview, STAFF),
                (SubmissionStatus::Approved, STAFF),
            ],
            SubmissionStatus::Rejected => &[
                (SubmissionStatus::Submitted, APPLICANT),
                (SubmissionStatus::UnderReview, STAFF),
                (SubmissionStatus::Rejected, STAFF),
            ],
            SubmissionStatus::Completed => &[
                (SubmissionStatus::Submitted, APPLICANT),
                (SubmissionStatus::UnderReview, STAFF),
                (SubmissionStatus::Approved, STAFF),
                (SubmissionStatus::Completed, STAFF),
            ],
        };

        let mut current = draft;
        for (to, actor) in path {
            current = self
                .transition(&current.id, actor, *to)
                .expect("happy path transition")
                .submission;
        }
        assert_eq!(current.status, target);
        current
    }

    pub(super) fn stored(&self, id: &SubmissionId) -> Submission {
        self.submissions.get(id).expect("stored submission")
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
