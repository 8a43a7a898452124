//! Access gate — who may join or act on a resource.
//!
//! DESIGN
//! ======
//! Membership is re-derived from the store on every gated action instead of
//! trusting the role captured at join time: a collaborator may be downgraded
//! or removed while their connection stays open, and the next mutating
//! action is where that takes effect.
//!
//! ERROR HANDLING
//! ==============
//! Store reads are bounded by a timeout. A timeout or store failure is
//! reported as a persistence error and never treated as a grant.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use super::store::{InviteStatus, Resource, ResourceStore, Role, StoreError};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("resource not found: {0}")]
    ResourceNotFound(Uuid),
    #[error("not permitted to {} this resource", .0.as_str())]
    Unauthorized(Permission),
    #[error("store did not answer within {0:?}")]
    Timeout(Duration),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl crate::frame::ErrorCode for AccessError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ResourceNotFound(_) => "ResourceNotFound",
            Self::Unauthorized(_) => "Unauthorized",
            Self::Timeout(_) | Self::Store(_) => "InternalPersistenceError",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Store(_))
    }
}

/// Action classes checked against a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Join the live session, read the snapshot, chat.
    View,
    /// Patch resource content.
    Edit,
    /// Invite, remove, and re-role collaborators.
    Manage,
}

impl Permission {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Edit => "edit",
            Self::Manage => "manage",
        }
    }
}

/// Result of a membership check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Membership {
    pub allowed: bool,
    pub role: Option<Role>,
}

impl Membership {
    const DENIED: Self = Self { allowed: false, role: None };

    fn granted(role: Role) -> Self {
        Self { allowed: true, role: Some(role) }
    }
}

#[must_use]
pub fn role_satisfies(role: Role, permission: Permission) -> bool {
    match permission {
        Permission::View => true,
        Permission::Edit | Permission::Manage => matches!(role, Role::Owner | Role::Editor),
    }
}

/// Evaluate membership against an already loaded resource.
#[must_use]
pub fn membership_of(resource: &Resource, user_id: Uuid) -> Membership {
    if resource.owner_id == user_id {
        return Membership::granted(Role::Owner);
    }
    match resource.collaborator(user_id) {
        Some(entry) if entry.status == InviteStatus::Accepted => Membership::granted(entry.role),
        _ => Membership::DENIED,
    }
}

// =============================================================================
// GATE
// =============================================================================

#[derive(Clone)]
pub struct AccessGate {
    store: Arc<dyn ResourceStore>,
    timeout: Duration,
}

impl AccessGate {
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        self.timeout
    }

    /// Load a resource, bounded by the store timeout.
    ///
    /// # Errors
    ///
    /// `ResourceNotFound` if absent, `Timeout`/`Store` if the read fails.
    pub async fn load(&self, resource_id: Uuid) -> Result<Resource, AccessError> {
        let read = tokio::time::timeout(self.timeout, self.store.get_resource(resource_id)).await;
        let Ok(result) = read else {
            return Err(AccessError::Timeout(self.timeout));
        };
        result?.ok_or(AccessError::ResourceNotFound(resource_id))
    }

    /// Owner or accepted collaborator check. No side effects.
    ///
    /// # Errors
    ///
    /// Fails only when the resource cannot be loaded.
    pub async fn verify_membership(&self, resource_id: Uuid, user_id: Uuid) -> Result<Membership, AccessError> {
        let resource = self.load(resource_id).await?;
        Ok(membership_of(&resource, user_id))
    }

    /// Require `permission` and return the loaded resource with the caller's role.
    ///
    /// # Errors
    ///
    /// `Unauthorized` if the user is not a member or the role is too weak.
    pub async fn authorize(
        &self,
        resource_id: Uuid,
        user_id: Uuid,
        permission: Permission,
    ) -> Result<(Resource, Role), AccessError> {
        let resource = self.load(resource_id).await?;
        let membership = membership_of(&resource, user_id);
        match membership.role {
            Some(role) if membership.allowed && role_satisfies(role, permission) => Ok((resource, role)),
            _ => Err(AccessError::Unauthorized(permission)),
        }
    }

    /// Same as [`AccessGate::authorize`] when only the role matters.
    ///
    /// # Errors
    ///
    /// See [`AccessGate::authorize`].
    pub async fn require(&self, resource_id: Uuid, user_id: Uuid, permission: Permission) -> Result<Role, AccessError> {
        self.authorize(resource_id, user_id, permission)
            .await
            .map(|(_, role)| role)
    }
}

#[cfg(test)]
#[path = "access_test.rs"]
mod tests;
