//! Process-local adapters used by the service binary, the CLI demo, and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::attachments::{AttachmentStore, NewAttachment, UploadStore};
use super::directory::UserDirectory;
use super::domain::{
    Attachment, LogEntry, NewLogEntry, NewSubmission, Submission, SubmissionId, User, UserId,
    UserRole,
};
use super::ledger::AuditLedger;
use super::store::{StoreError, SubmissionChange, SubmissionFilter, SubmissionStore};

#[derive(Default, Clone)]
pub struct InMemorySubmissionStore {
    records: Arc<Mutex<BTreeMap<SubmissionId, Submission>>>,
    sequence: Arc<AtomicU64>,
}

impl SubmissionStore for InMemorySubmissionStore {
    fn create(&self, draft: NewSubmission) -> Result<Submission, StoreError> {
        let id = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let submission = Submission {
            id: SubmissionId(format!("srt-{id:06}")),
            applicant: draft.applicant,
            letter_type: draft.letter_type,
            fields: draft.fields,
            status: draft.status,
            assigned_reviewer: None,
            review_note: None,
            rejection_reason: None,
            issuance_reference: None,
            version: 1,
            created_at: draft.created_at,
            updated_at: draft.created_at,
        };

        let mut guard = self.records.lock().expect("submission mutex poisoned");
        if guard.contains_key(&submission.id) {
            return Err(StoreError::Constraint(format!(
                "duplicate submission id {}",
                submission.id
            )));
        }
        guard.insert(submission.id.clone(), submission.clone());
        Ok(submission)
    }

    fn get(&self, id: &SubmissionId) -> Result<Submission, StoreError> {
        let guard = self.records.lock().expect("submission mutex poisoned");
        guard.get(id).cloned().ok_or(StoreError::NotFound)
    }

    fn conditional_update(
        &self,
        id: &SubmissionId,
        expected_version: u64,
        change: SubmissionChange,
    ) -> Result<Submission, StoreError> {
        let mut guard = self.records.lock().expect("submission mutex poisoned");
        let record = guard.get_mut(id).ok_or(StoreError::NotFound)?;
        if record.version != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                found: record.version,
            });
        }

        record.status = change.status;
        record.fields = change.fields;
        record.assigned_reviewer = change.assigned_reviewer;
        record.review_note = change.review_note;
        record.rejection_reason = change.rejection_reason;
        record.issuance_reference = change.issuance_reference;
        record.updated_at = change.updated_at;
        record.version += 1;
        Ok(record.clone())
    }

    fn list(&self, filter: &SubmissionFilter) -> Result<Vec<Submission>, StoreError> {
        let guard = self.records.lock().expect("submission mutex poisoned");
        Ok(guard
            .values()
            .filter(|submission| filter.matches(submission))
            .cloned()
            .collect())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryAuditLedger {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl InMemoryAuditLedger {
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().expect("ledger mutex poisoned").clone()
    }
}

impl InMemoryAuditLedger {
    fn push(
        &self,
        entry: NewLogEntry,
        accept: impl FnOnce(u64) -> Result<(), StoreError>,
    ) -> Result<LogEntry, StoreError> {
        let mut guard = self.entries.lock().expect("ledger mutex poisoned");
        let tail = guard
            .iter()
            .filter(|stored| stored.submission_id == entry.submission_id)
            .map(|stored| stored.submission_version)
            .max()
            .unwrap_or(0);
        accept(tail)?;
        if entry.submission_version <= tail {
            return Err(StoreError::VersionConflict {
                expected: entry.submission_version,
                found: tail,
            });
        }

        let stored = LogEntry {
            id: guard.len() as u64 + 1,
            submission_id: entry.submission_id,
            from_status: entry.from_status,
            to_status: entry.to_status,
            actor: entry.actor,
            recorded_at: entry.recorded_at,
            note: entry.note,
            submission_version: entry.submission_version,
            kind: entry.kind,
        };
        guard.push(stored.clone());
        Ok(stored)
    }
}

impl AuditLedger for InMemoryAuditLedger {
    fn append(&self, entry: NewLogEntry) -> Result<LogEntry, StoreError> {
        self.push(entry, |_| Ok(()))
    }

    fn append_after(&self, expected_tail: u64, entry: NewLogEntry) -> Result<LogEntry, StoreError> {
        self.push(entry, |tail| {
            if tail == expected_tail {
                Ok(())
            } else {
                Err(StoreError::VersionConflict {
                    expected: expected_tail,
                    found: tail,
                })
            }
        })
    }

    fn list_by_submission(&self, id: &SubmissionId) -> Result<Vec<LogEntry>, StoreError> {
        let guard = self.entries.lock().expect("ledger mutex poisoned");
        Ok(guard
            .iter()
            .filter(|entry| &entry.submission_id == id)
            .cloned()
            .collect())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryUserDirectory {
    users: Arc<Mutex<HashMap<UserId, User>>>,
}

impl InMemoryUserDirectory {
    /// Seeds the directory without going through admin checks.
    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        let directory = Self::default();
        {
            let mut guard = directory.users.lock().expect("directory mutex poisoned");
            for user in users {
                guard.insert(user.id.clone(), user);
            }
        }
        directory
    }
}

impl UserDirectory for InMemoryUserDirectory {
    fn find(&self, id: &UserId) -> Result<Option<User>, StoreError> {
        let guard = self.users.lock().expect("directory mutex poisoned");
        Ok(guard.get(id).cloned())
    }

    fn insert(&self, user: User) -> Result<User, StoreError> {
        let mut guard = self.users.lock().expect("directory mutex poisoned");
        if guard.contains_key(&user.id) {
            return Err(StoreError::Constraint(format!("user {} already exists", user.id)));
        }
        guard.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    fn update_role(&self, id: &UserId, role: UserRole) -> Result<User, StoreError> {
        let mut guard = self.users.lock().expect("directory mutex poisoned");
        let user = guard.get_mut(id).ok_or(StoreError::NotFound)?;
        user.role = role;
        Ok(user.clone())
    }

    fn list(&self) -> Result<Vec<User>, StoreError> {
        let guard = self.users.lock().expect("directory mutex poisoned");
        let mut users: Vec<User> = guard.values().cloned().collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(users)
    }
}

#[derive(Default, Clone)]
pub struct InMemoryAttachmentStore {
    rows: Arc<Mutex<Vec<Attachment>>>,
}

impl AttachmentStore for InMemoryAttachmentStore {
    fn insert(&self, attachment: NewAttachment) -> Result<Attachment, StoreError> {
        let mut guard = self.rows.lock().expect("attachment mutex poisoned");
        let stored = Attachment {
            id: guard.len() as u64 + 1,
            submission_id: attachment.submission_id,
            storage_path: attachment.storage_path,
            file_name: attachment.file_name,
            content_type: attachment.content_type,
            size_bytes: attachment.size_bytes,
            checksum: attachment.checksum,
            uploaded_by: attachment.uploaded_by,
            uploaded_at: attachment.uploaded_at,
        };
        guard.push(stored.clone());
        Ok(stored)
    }

    fn list_by_submission(&self, id: &SubmissionId) -> Result<Vec<Attachment>, StoreError> {
        let guard = self.rows.lock().expect("attachment mutex poisoned");
        Ok(guard
            .iter()
            .filter(|row| &row.submission_id == id)
            .cloned()
            .collect())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryUploadStore {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryUploadStore {
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .expect("upload mutex poisoned")
            .get(path)
            .cloned()
    }
}

impl UploadStore for InMemoryUploadStore {
    fn put(&self, relative_path: &str, bytes: &[u8]) -> Result<bool, StoreError> {
        let previous = self
            .files
            .lock()
            .expect("upload mutex poisoned")
            .insert(relative_path.to_string(), bytes.to_vec());
        Ok(previous.is_none())
    }

    fn remove(&self, relative_path: &str) -> Result<(), StoreError> {
        self.files
            .lock()
            .expect("upload mutex poisoned")
            .remove(relative_path);
        Ok(())
    }
}
