use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;

use super::attachments::{AttachmentManager, FileUpload};
use super::coordinator::{CreateSubmission, SubmissionCoordinator, TransitionCommand};
use super::directory::NewUser;
use super::domain::{
    Attachment, LogEntry, Submission, SubmissionId, SubmissionStatus, User, UserId, UserRole,
};
use super::error::{error_body, WorkflowError};
use super::reconciliation::ReconciliationReport;
use super::retry::RetryQueueSnapshot;
use super::store::SubmissionFilter;

/// Header carrying the caller id resolved by the upstream authentication layer.
pub const CALLER_HEADER: &str = "x-user-id";

/// Shared handles for the workflow routes.
#[derive(Clone)]
pub struct WorkflowServices {
    pub coordinator: Arc<SubmissionCoordinator>,
    pub attachments: Arc<AttachmentManager>,
}

/// Router exposing submission, audit, attachment, user, and admin endpoints.
pub fn submission_router(services: WorkflowServices) -> Router {
    Router::new()
        .route(
            "/submissions",
            post(create_handler).get(list_handler),
        )
        .route(
            "/submissions/:submission_id",
            get(get_handler).patch(update_fields_handler),
        )
        .route(
            "/submissions/:submission_id/status",
            patch(transition_handler),
        )
        .route("/submissions/:submission_id/log", get(log_handler))
        .route(
            "/submissions/:submission_id/attachments",
            post(upload_handler).get(list_attachments_handler),
        )
        .route("/users", post(create_user_handler).get(list_users_handler))
        .route("/users/:user_id", get(get_user_handler))
        .route("/users/:user_id/role", patch(change_role_handler))
        .route("/admin/reconcile", post(reconcile_handler))
        .route("/admin/retry-queue", get(retry_queue_handler))
        .fallback(not_found_handler)
        .with_state(services)
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    #[serde(default)]
    status: Option<SubmissionStatus>,
    #[serde(default)]
    applicant: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpdateFieldsRequest {
    fields: BTreeMap<String, String>,
    #[serde(default)]
    expected_version: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UploadQuery {
    file_name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RoleChange {
    role: UserRole,
}

pub(crate) fn caller(headers: &HeaderMap) -> Result<UserId, WorkflowError> {
    headers
        .get(CALLER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| UserId(value.to_string()))
        .ok_or_else(|| WorkflowError::Validation(format!("missing {CALLER_HEADER} header")))
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, WorkflowError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| WorkflowError::Validation(rejection.body_text()))
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, WorkflowError> {
    params
        .map(|Query(value)| value)
        .map_err(|rejection| WorkflowError::Validation(rejection.body_text()))
}

fn require_admin(services: &WorkflowServices, headers: &HeaderMap) -> Result<User, WorkflowError> {
    let actor = services.coordinator.directory().resolve(&caller(headers)?)?;
    if actor.role == UserRole::Admin {
        Ok(actor)
    } else {
        Err(WorkflowError::Forbidden(format!(
            "role {} may not run administrative operations",
            actor.role
        )))
    }
}

pub(crate) async fn create_handler(
    State(services): State<WorkflowServices>,
    headers: HeaderMap,
    payload: Result<Json<CreateSubmission>, JsonRejection>,
) -> Result<(StatusCode, Json<Submission>), WorkflowError> {
    let actor = caller(&headers)?;
    let request = json_body(payload)?;
    let outcome = services.coordinator.create(&actor, request)?;
    Ok((StatusCode::CREATED, Json(outcome.submission)))
}

pub(crate) async fn list_handler(
    State(services): State<WorkflowServices>,
    headers: HeaderMap,
    params: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<Submission>>, WorkflowError> {
    let actor = caller(&headers)?;
    let params = query(params)?;
    let filter = SubmissionFilter {
        status: params.status,
        applicant: params.applicant.map(UserId),
    };
    Ok(Json(services.coordinator.list(&actor, filter)?))
}

pub(crate) async fn get_handler(
    State(services): State<WorkflowServices>,
    headers: HeaderMap,
    Path(submission_id): Path<String>,
) -> Result<Json<Submission>, WorkflowError> {
    let actor = caller(&headers)?;
    let submission = services
        .coordinator
        .get(&SubmissionId(submission_id), &actor)?;
    Ok(Json(submission))
}

pub(crate) async fn update_fields_handler(
    State(services): State<WorkflowServices>,
    headers: HeaderMap,
    Path(submission_id): Path<String>,
    payload: Result<Json<UpdateFieldsRequest>, JsonRejection>,
) -> Result<Json<Submission>, WorkflowError> {
    let actor = caller(&headers)?;
    let request = json_body(payload)?;
    let submission = services.coordinator.update_fields(
        &SubmissionId(submission_id),
        &actor,
        request.fields,
        request.expected_version,
    )?;
    Ok(Json(submission))
}

pub(crate) async fn transition_handler(
    State(services): State<WorkflowServices>,
    headers: HeaderMap,
    Path(submission_id): Path<String>,
    payload: Result<Json<TransitionCommand>, JsonRejection>,
) -> Result<Json<Submission>, WorkflowError> {
    let actor = caller(&headers)?;
    let command = json_body(payload)?;
    let outcome =
        services
            .coordinator
            .apply_transition(&SubmissionId(submission_id), &actor, command)?;
    Ok(Json(outcome.submission))
}

pub(crate) async fn log_handler(
    State(services): State<WorkflowServices>,
    headers: HeaderMap,
    Path(submission_id): Path<String>,
) -> Result<Json<Vec<LogEntry>>, WorkflowError> {
    let actor = caller(&headers)?;
    let entries = services
        .coordinator
        .audit_log(&SubmissionId(submission_id), &actor)?;
    Ok(Json(entries))
}

pub(crate) async fn upload_handler(
    State(services): State<WorkflowServices>,
    headers: HeaderMap,
    Path(submission_id): Path<String>,
    params: Result<Query<UploadQuery>, QueryRejection>,
    body: Bytes,
) -> Result<(StatusCode, Json<Attachment>), WorkflowError> {
    let actor = caller(&headers)?;
    let params = query(params)?;
    let attachment = services.attachments.attach(
        &SubmissionId(submission_id),
        FileUpload {
            file_name: params.file_name,
            content: body.to_vec(),
        },
        &actor,
    )?;
    Ok((StatusCode::CREATED, Json(attachment)))
}

pub(crate) async fn list_attachments_handler(
    State(services): State<WorkflowServices>,
    headers: HeaderMap,
    Path(submission_id): Path<String>,
) -> Result<Json<Vec<Attachment>>, WorkflowError> {
    let actor = caller(&headers)?;
    let attachments = services
        .attachments
        .list(&SubmissionId(submission_id), &actor)?;
    Ok(Json(attachments))
}

pub(crate) async fn create_user_handler(
    State(services): State<WorkflowServices>,
    headers: HeaderMap,
    payload: Result<Json<NewUser>, JsonRejection>,
) -> Result<(StatusCode, Json<User>), WorkflowError> {
    let directory = services.coordinator.directory();
    let actor = directory.resolve(&caller(&headers)?)?;
    let request = json_body(payload)?;
    let user = directory.provision(&actor, request)?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub(crate) async fn list_users_handler(
    State(services): State<WorkflowServices>,
    headers: HeaderMap,
) -> Result<Json<Vec<User>>, WorkflowError> {
    let actor = services.coordinator.directory().resolve(&caller(&headers)?)?;
    if actor.role == UserRole::Applicant {
        return Err(WorkflowError::Forbidden(
            "applicants may not list users".to_string(),
        ));
    }
    Ok(Json(services.coordinator.directory().list()?))
}

pub(crate) async fn get_user_handler(
    State(services): State<WorkflowServices>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<User>, WorkflowError> {
    let directory = services.coordinator.directory();
    let actor = directory.resolve(&caller(&headers)?)?;
    let target = UserId(user_id);
    if actor.role == UserRole::Applicant && actor.id != target {
        return Err(WorkflowError::Forbidden(
            "applicants may only view their own profile".to_string(),
        ));
    }
    Ok(Json(directory.resolve(&target)?))
}

pub(crate) async fn change_role_handler(
    State(services): State<WorkflowServices>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    payload: Result<Json<RoleChange>, JsonRejection>,
) -> Result<Json<User>, WorkflowError> {
    let directory = services.coordinator.directory();
    let actor = directory.resolve(&caller(&headers)?)?;
    let request = json_body(payload)?;
    let user = directory.change_role(&actor, &UserId(user_id), request.role)?;
    Ok(Json(user))
}

pub(crate) async fn reconcile_handler(
    State(services): State<WorkflowServices>,
    headers: HeaderMap,
) -> Result<Json<ReconciliationReport>, WorkflowError> {
    require_admin(&services, &headers)?;
    Ok(Json(services.coordinator.reconcile()?))
}

pub(crate) async fn retry_queue_handler(
    State(services): State<WorkflowServices>,
    headers: HeaderMap,
) -> Result<Json<RetryQueueSnapshot>, WorkflowError> {
    require_admin(&services, &headers)?;
    Ok(Json(services.coordinator.retry_queue().snapshot()))
}

pub(crate) async fn not_found_handler() -> Response {
    (StatusCode::NOT_FOUND, error_body("route not found")).into_response()
}
