use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::directory::IdentityDirectory;
use super::domain::{Attachment, SubmissionId, UserId, UserRole};
use super::error::WorkflowError;
use super::store::{StoreError, SubmissionStore};

/// Attachment row before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttachment {
    pub submission_id: SubmissionId,
    pub storage_path: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub uploaded_by: UserId,
    pub uploaded_at: DateTime<Utc>,
}

/// Metadata store for attachment rows.
pub trait AttachmentStore: Send + Sync {
    fn insert(&self, attachment: NewAttachment) -> Result<Attachment, StoreError>;
    fn list_by_submission(&self, id: &SubmissionId) -> Result<Vec<Attachment>, StoreError>;
}

/// Byte storage behind the static `/uploads` route.
pub trait UploadStore: Send + Sync {
    /// Writes `bytes` at `relative_path`. Returns `false` when a file was already there.
    fn put(&self, relative_path: &str, bytes: &[u8]) -> Result<bool, StoreError>;
    fn remove(&self, relative_path: &str) -> Result<(), StoreError>;
}

/// Writes uploads below a local directory.
#[derive(Debug, Clone)]
pub struct LocalUploadStore {
    root: PathBuf,
}

impl LocalUploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl UploadStore for LocalUploadStore {
    fn put(&self, relative_path: &str, bytes: &[u8]) -> Result<bool, StoreError> {
        let path = self.root.join(relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| StoreError::Unavailable(format!("{}: {err}", parent.display())))?;
        }
        let existed = path.exists();
        fs::write(&path, bytes)
            .map_err(|err| StoreError::Unavailable(format!("{}: {err}", path.display())))?;
        Ok(!existed)
    }

    fn remove(&self, relative_path: &str) -> Result<(), StoreError> {
        let path = self.root.join(relative_path);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Unavailable(format!("{}: {err}", path.display()))),
        }
    }
}

/// An uploaded file as received from the transport layer.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub file_name: String,
    pub content: Vec<u8>,
}

pub struct AttachmentManager {
    submissions: Arc<dyn SubmissionStore>,
    attachments: Arc<dyn AttachmentStore>,
    uploads: Arc<dyn UploadStore>,
    directory: IdentityDirectory,
}

impl AttachmentManager {
    pub fn new(
        submissions: Arc<dyn SubmissionStore>,
        attachments: Arc<dyn AttachmentStore>,
        uploads: Arc<dyn UploadStore>,
        directory: IdentityDirectory,
    ) -> Self {
        Self {
            submissions,
            attachments,
            uploads,
            directory,
        }
    }

    /// Stores `upload` and links it to an open submission.
    pub fn attach(
        &self,
        submission_id: &SubmissionId,
        upload: FileUpload,
        uploader_id: &UserId,
    ) -> Result<Attachment, WorkflowError> {
        let uploader = self.directory.resolve(uploader_id)?;
        let submission = self
            .submissions
            .get(submission_id)
            .map_err(|err| WorkflowError::from_submission_store(submission_id, err))?;

        if submission.status.is_terminal() {
            return Err(WorkflowError::SubmissionClosed {
                id: submission_id.clone(),
                status: submission.status,
            });
        }
        if uploader.role == UserRole::Applicant && uploader.id != submission.applicant {
            return Err(WorkflowError::Forbidden(format!(
                "submission {submission_id} belongs to another applicant"
            )));
        }

        let file_name = sanitize_file_name(&upload.file_name).ok_or_else(|| {
            WorkflowError::Validation("attachment needs a file name".to_string())
        })?;
        if upload.content.is_empty() {
            return Err(WorkflowError::Validation(
                "attachment content is empty".to_string(),
            ));
        }

        let checksum = checksum_hex(&upload.content);
        let storage_path = format!("{}/{}-{}", submission_id, &checksum[..12], file_name);
        let content_type = mime_guess::from_path(&file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        let created = self.uploads.put(&storage_path, &upload.content)?;

        let inserted = self.attachments.insert(NewAttachment {
            submission_id: submission_id.clone(),
            storage_path: storage_path.clone(),
            file_name,
            content_type,
            size_bytes: upload.content.len() as u64,
            checksum,
            uploaded_by: uploader.id,
            uploaded_at: Utc::now(),
        });
        let attachment = match inserted {
            Ok(attachment) => attachment,
            Err(err) => {
                // Identical bytes under the same name may already back another row.
                if created {
                    if let Err(cleanup) = self.uploads.remove(&storage_path) {
                        warn!(
                            submission_id = %submission_id,
                            storage_path = %storage_path,
                            error = %cleanup,
                            "orphaned upload could not be removed"
                        );
                    }
                }
                return Err(err.into());
            }
        };

        info!(
            submission_id = %submission_id,
            attachment_id = attachment.id,
            size_bytes = attachment.size_bytes,
            "attachment stored"
        );
        Ok(attachment)
    }

    pub fn list(
        &self,
        submission_id: &SubmissionId,
        actor_id: &UserId,
    ) -> Result<Vec<Attachment>, WorkflowError> {
        let actor = self.directory.resolve(actor_id)?;
        let submission = self
            .submissions
            .get(submission_id)
            .map_err(|err| WorkflowError::from_submission_store(submission_id, err))?;
        if actor.role == UserRole::Applicant && actor.id != submission.applicant {
            return Err(WorkflowError::Forbidden(format!(
                "submission {submission_id} belongs to another applicant"
            )));
        }
        Ok(self.attachments.list_by_submission(submission_id)?)
    }
}

/// Lowercase hex SHA-256 digest.
pub fn checksum_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Keeps the final path segment and replaces anything outside `[A-Za-z0-9._-]`.
fn sanitize_file_name(raw: &str) -> Option<String> {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim();
    let cleaned: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}
