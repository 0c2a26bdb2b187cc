use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use majusurat::config::AppConfig;
use majusurat::workflows::submissions::{
    AttachmentManager, AuditLedger, IdentityDirectory, InMemoryAttachmentStore,
    InMemorySubmissionStore, InMemoryUserDirectory, LedgerRetryQueue, RetryPolicy,
    SubmissionCoordinator, SubmissionStore, UploadStore, User, UserId, UserRole,
    WorkflowServices,
};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Fully wired workflow plus the handles the background workers need.
pub(crate) struct WorkflowStack {
    pub(crate) services: WorkflowServices,
    pub(crate) ledger: Arc<dyn AuditLedger>,
    pub(crate) queue: Arc<LedgerRetryQueue>,
}

pub(crate) fn bootstrap_admin(id: &str) -> User {
    User {
        id: UserId(id.to_string()),
        display_name: "Bootstrap administrator".to_string(),
        role: UserRole::Admin,
    }
}

/// Wires in-process stores. `extra_users` are seeded next to the bootstrap admin.
pub(crate) fn build_workflow(
    policy: RetryPolicy,
    admin_id: &str,
    extra_users: Vec<User>,
    ledger: Arc<dyn AuditLedger>,
    uploads: Arc<dyn UploadStore>,
) -> WorkflowStack {
    let submissions: Arc<dyn SubmissionStore> = Arc::new(InMemorySubmissionStore::default());
    let users = std::iter::once(bootstrap_admin(admin_id)).chain(extra_users);
    let directory = IdentityDirectory::new(Arc::new(InMemoryUserDirectory::with_users(users)));
    let queue = Arc::new(LedgerRetryQueue::new(policy));

    let coordinator = Arc::new(SubmissionCoordinator::new(
        submissions.clone(),
        ledger.clone(),
        directory.clone(),
        queue.clone(),
    ));
    let attachments = Arc::new(AttachmentManager::new(
        submissions,
        Arc::new(InMemoryAttachmentStore::default()),
        uploads,
        directory,
    ));

    WorkflowStack {
        services: WorkflowServices {
            coordinator,
            attachments,
        },
        ledger,
        queue,
    }
}

pub(crate) fn retry_policy(config: &AppConfig) -> RetryPolicy {
    RetryPolicy::from(&config.ledger_retry)
}
