use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use super::domain::{User, UserId, UserRole};
use super::error::WorkflowError;
use super::store::StoreError;

/// Storage abstraction for user records. Provisioning and authentication live elsewhere;
/// the workflow only needs to resolve ids and roles.
pub trait UserDirectory: Send + Sync {
    fn find(&self, id: &UserId) -> Result<Option<User>, StoreError>;
    fn insert(&self, user: User) -> Result<User, StoreError>;
    fn update_role(&self, id: &UserId, role: UserRole) -> Result<User, StoreError>;
    fn list(&self) -> Result<Vec<User>, StoreError>;
}

/// Request body for provisioning a user.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub id: UserId,
    pub display_name: String,
    pub role: UserRole,
}

/// Resolves callers and gates admin-only directory changes.
#[derive(Clone)]
pub struct IdentityDirectory {
    users: Arc<dyn UserDirectory>,
}

impl IdentityDirectory {
    pub fn new(users: Arc<dyn UserDirectory>) -> Self {
        Self { users }
    }

    pub fn resolve(&self, id: &UserId) -> Result<User, WorkflowError> {
        self.users
            .find(id)?
            .ok_or_else(|| WorkflowError::NotFound(format!("user {id}")))
    }

    pub fn list(&self) -> Result<Vec<User>, WorkflowError> {
        Ok(self.users.list()?)
    }

    /// Adds a user; only admins may provision accounts.
    pub fn provision(&self, actor: &User, request: NewUser) -> Result<User, WorkflowError> {
        require_admin(actor, "provision users")?;

        let display_name = request.display_name.trim();
        if request.id.0.trim().is_empty() || display_name.is_empty() {
            return Err(WorkflowError::Validation(
                "user id and display name are required".to_string(),
            ));
        }

        let user = User {
            id: request.id,
            display_name: display_name.to_string(),
            role: request.role,
        };

        let stored = self.users.insert(user).map_err(|err| match err {
            StoreError::Constraint(message) => WorkflowError::Validation(message),
            other => other.into(),
        })?;
        info!(user_id = %stored.id, role = %stored.role, provisioned_by = %actor.id, "user provisioned");
        Ok(stored)
    }

    pub fn change_role(
        &self,
        actor: &User,
        target: &UserId,
        role: UserRole,
    ) -> Result<User, WorkflowError> {
        require_admin(actor, "change roles")?;
        let updated = self.users.update_role(target, role).map_err(|err| match err {
            StoreError::NotFound => WorkflowError::NotFound(format!("user {target}")),
            other => other.into(),
        })?;
        info!(user_id = %updated.id, role = %updated.role, changed_by = %actor.id, "user role changed");
        Ok(updated)
    }
}

fn require_admin(actor: &User, action: &str) -> Result<(), WorkflowError> {
    if actor.role == UserRole::Admin {
        Ok(())
    } else {
        Err(WorkflowError::Forbidden(format!(
            "role {} may not {action}",
            actor.role
        )))
    }
}
