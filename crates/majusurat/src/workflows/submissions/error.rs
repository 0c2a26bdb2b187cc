use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::domain::{SubmissionId, SubmissionStatus};
use super::machine::TransitionError;
use super::store::StoreError;

/// Error raised by the submission workflow services.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("{0}")]
    Validation(String),
    #[error("cannot move a submission from {from} to {to}")]
    InvalidTransition {
        from: SubmissionStatus,
        to: SubmissionStatus,
    },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("submission {0} was modified concurrently; reload and retry")]
    ConcurrentModification(SubmissionId),
    #[error("submission {id} is {status} and no longer accepts changes")]
    SubmissionClosed {
        id: SubmissionId,
        status: SubmissionStatus,
    },
    #[error("store unavailable: {0}")]
    Store(String),
}

impl WorkflowError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            WorkflowError::Validation(_)
            | WorkflowError::InvalidTransition { .. }
            | WorkflowError::SubmissionClosed { .. } => StatusCode::BAD_REQUEST,
            WorkflowError::Forbidden(_) => StatusCode::FORBIDDEN,
            WorkflowError::NotFound(_) => StatusCode::NOT_FOUND,
            WorkflowError::ConcurrentModification(_) => StatusCode::CONFLICT,
            WorkflowError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Maps a store failure on a submission row into the workflow taxonomy.
    pub(crate) fn from_submission_store(id: &SubmissionId, error: StoreError) -> Self {
        match error {
            StoreError::NotFound => Self::NotFound(format!("submission {id}")),
            StoreError::VersionConflict { .. } => Self::ConcurrentModification(id.clone()),
            StoreError::Constraint(message) | StoreError::Unavailable(message) => {
                Self::Store(message)
            }
        }
    }
}

impl From<TransitionError> for WorkflowError {
    fn from(value: TransitionError) -> Self {
        match value {
            TransitionError::InvalidTransition { from, to } => {
                Self::InvalidTransition { from, to }
            }
            forbidden @ TransitionError::Forbidden { .. } => Self::Forbidden(forbidden.to_string()),
            TransitionError::Validation(message) => Self::Validation(message),
        }
    }
}

impl From<StoreError> for WorkflowError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound => Self::NotFound("record".to_string()),
            StoreError::VersionConflict { .. } => {
                Self::Store("unexpected version conflict".to_string())
            }
            StoreError::Constraint(message) | StoreError::Unavailable(message) => {
                Self::Store(message)
            }
        }
    }
}

/// Uniform `{status: "Error", message}` envelope.
pub fn error_body(message: impl Into<String>) -> Json<serde_json::Value> {
    Json(json!({ "status": "Error", "message": message.into() }))
}

impl IntoResponse for WorkflowError {
    fn into_response(self) -> Response {
        (self.status_code(), error_body(self.to_string())).into_response()
    }
}
