//! Membership workflow — durable invite / respond / remove / re-role.
//!
//! DESIGN
//! ======
//! Every operation re-runs the access gate for the requester against a fresh
//! store read. Collaborator entries are only ever written here. Removing or
//! downgrading someone does not touch live sessions: their connection stays
//! joined and the next gated action they attempt is rejected.
//!
//! Owner membership is implicit (`resources.owner_id`) and never stored as
//! an entry, so the owner can be neither invited, removed, nor re-roled.

use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::frame::now_ms;
use crate::services::access::{AccessError, AccessGate, Permission, membership_of};
use crate::services::store::{
    Collaborator, InviteStatus, LogEntry, Resource, ResourceStore, Role, StoreError, SystemNotice,
};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("no user with email {0}")]
    UserNotFound(String),
    #[error("user {0} is already a collaborator")]
    AlreadyCollaborator(Uuid),
    #[error("invalid role: {0}")]
    InvalidRole(String),
    #[error("no pending invitation for user {0}")]
    InvitePending(Uuid),
    #[error("user {0} is not a collaborator")]
    CollaboratorNotFound(Uuid),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl crate::frame::ErrorCode for MembershipError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Access(e) => e.error_code(),
            Self::UserNotFound(_) => "UserNotFound",
            Self::AlreadyCollaborator(_) => "AlreadyCollaborator",
            Self::InvalidRole(_) => "InvalidRole",
            Self::InvitePending(_) => "InvitePending",
            Self::CollaboratorNotFound(_) => "CollaboratorNotFound",
            Self::Store(StoreError::ResourceNotFound(_)) => "ResourceNotFound",
            Self::Store(_) => "InternalPersistenceError",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Access(e) => e.retryable(),
            Self::Store(StoreError::ResourceNotFound(_)) => false,
            Self::Store(_) => true,
            _ => false,
        }
    }
}

/// Who is being invited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteeIdentity {
    UserId(Uuid),
    Email(String),
}

impl InviteeIdentity {
    /// Label used in the invitation notice.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::UserId(id) => id.to_string(),
            Self::Email(email) => email.clone(),
        }
    }
}

/// Invitee's answer to a pending invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Decline,
}

impl Decision {
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "accept" => Some(Self::Accept),
            "decline" => Some(Self::Decline),
            _ => None,
        }
    }
}

/// Result of a successful invite.
#[derive(Debug, Clone)]
pub struct Invitation {
    pub collaborator: Collaborator,
    /// Set for resources with a message log; already appended to that log.
    pub notice: Option<SystemNotice>,
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// Invite a user as `role`. A previously declined entry is reset to pending.
///
/// # Errors
///
/// `Unauthorized` unless the requester may manage, `InvalidRole` for
/// `owner`, `UserNotFound` for an unknown email, `AlreadyCollaborator` if
/// the invitee is the owner or already has a pending or accepted entry.
pub async fn invite(
    gate: &AccessGate,
    store: &dyn ResourceStore,
    resource_id: Uuid,
    requester_id: Uuid,
    invitee: &InviteeIdentity,
    role: Role,
) -> Result<Invitation, MembershipError> {
    let (resource, _) = gate
        .authorize(resource_id, requester_id, Permission::Manage)
        .await?;
    if role == Role::Owner {
        return Err(MembershipError::InvalidRole(role.as_str().to_owned()));
    }

    let user_id = match invitee {
        InviteeIdentity::UserId(id) => *id,
        InviteeIdentity::Email(email) => store
            .find_user_by_email(email)
            .await?
            .ok_or_else(|| MembershipError::UserNotFound(email.clone()))?,
    };

    if resource.owner_id == user_id {
        return Err(MembershipError::AlreadyCollaborator(user_id));
    }
    if let Some(existing) = resource.collaborator(user_id)
        && existing.status != InviteStatus::Declined
    {
        return Err(MembershipError::AlreadyCollaborator(user_id));
    }

    let collaborator = Collaborator { user_id, role, status: InviteStatus::Pending, joined_at: None };
    store
        .upsert_collaborator(resource_id, &collaborator)
        .await?;

    let notice = if resource.kind.has_message_log() {
        let notice = SystemNotice { text: format!("Invitation sent to {}", invitee.label()), timestamp: now_ms() };
        store
            .append_message(resource_id, &LogEntry::Notice(notice.clone()))
            .await?;
        Some(notice)
    } else {
        None
    };

    info!(
        %resource_id,
        kind = resource.kind.as_str(),
        %requester_id,
        invitee = %user_id,
        role = role.as_str(),
        "collaborator invited"
    );
    Ok(Invitation { collaborator, notice })
}

/// Accept or decline the caller's own pending invitation.
///
/// # Errors
///
/// `InvitePending` if the caller has no pending entry, `ResourceNotFound`
/// if the resource is gone.
pub async fn respond_invite(
    store: &dyn ResourceStore,
    resource_id: Uuid,
    user_id: Uuid,
    decision: Decision,
) -> Result<Collaborator, MembershipError> {
    let entry = store
        .is_collaborator(resource_id, user_id)
        .await?
        .filter(|c| c.status == InviteStatus::Pending)
        .ok_or(MembershipError::InvitePending(user_id))?;

    let collaborator = match decision {
        Decision::Accept => Collaborator {
            status: InviteStatus::Accepted,
            joined_at: Some(OffsetDateTime::now_utc()),
            ..entry
        },
        Decision::Decline => Collaborator { status: InviteStatus::Declined, joined_at: None, ..entry },
    };
    store
        .upsert_collaborator(resource_id, &collaborator)
        .await?;

    info!(%resource_id, %user_id, status = collaborator.status.as_str(), "invitation answered");
    Ok(collaborator)
}

/// Delete a collaborator entry. Live connections of the target are left in
/// place until their next gated action.
///
/// # Errors
///
/// `Unauthorized`, `InvalidRole` when targeting the owner, or
/// `CollaboratorNotFound`.
pub async fn remove_collaborator(
    gate: &AccessGate,
    store: &dyn ResourceStore,
    resource_id: Uuid,
    requester_id: Uuid,
    target_id: Uuid,
) -> Result<(), MembershipError> {
    let (resource, _) = gate
        .authorize(resource_id, requester_id, Permission::Manage)
        .await?;
    if resource.owner_id == target_id {
        return Err(MembershipError::InvalidRole(Role::Owner.as_str().to_owned()));
    }
    if !store.remove_collaborator(resource_id, target_id).await? {
        return Err(MembershipError::CollaboratorNotFound(target_id));
    }

    info!(%resource_id, %requester_id, target = %target_id, "collaborator removed");
    Ok(())
}

/// Change a pending or accepted collaborator's role.
///
/// # Errors
///
/// `Unauthorized`, `InvalidRole` when targeting the owner or assigning
/// `owner`, `CollaboratorNotFound` for missing or declined entries.
pub async fn change_role(
    gate: &AccessGate,
    store: &dyn ResourceStore,
    resource_id: Uuid,
    requester_id: Uuid,
    target_id: Uuid,
    role: Role,
) -> Result<Collaborator, MembershipError> {
    let (resource, _) = gate
        .authorize(resource_id, requester_id, Permission::Manage)
        .await?;
    if role == Role::Owner || resource.owner_id == target_id {
        return Err(MembershipError::InvalidRole(Role::Owner.as_str().to_owned()));
    }

    let entry = resource
        .collaborator(target_id)
        .filter(|c| c.status != InviteStatus::Declined)
        .ok_or(MembershipError::CollaboratorNotFound(target_id))?;
    let collaborator = Collaborator { role, ..entry.clone() };
    store
        .upsert_collaborator(resource_id, &collaborator)
        .await?;

    info!(%resource_id, %requester_id, target = %target_id, role = role.as_str(), "collaborator role changed");
    Ok(collaborator)
}

/// Owner first, then stored entries in invitation order.
///
/// # Errors
///
/// `Unauthorized` unless the requester is the owner or an accepted collaborator.
pub async fn list_collaborators(
    gate: &AccessGate,
    resource_id: Uuid,
    requester_id: Uuid,
) -> Result<Vec<Collaborator>, MembershipError> {
    let resource = gate.load(resource_id).await?;
    if !membership_of(&resource, requester_id).allowed {
        return Err(AccessError::Unauthorized(Permission::View).into());
    }
    Ok(with_owner(resource))
}

fn with_owner(resource: Resource) -> Vec<Collaborator> {
    let owner = Collaborator {
        user_id: resource.owner_id,
        role: Role::Owner,
        status: InviteStatus::Accepted,
        joined_at: None,
    };
    std::iter::once(owner)
        .chain(resource.collaborators)
        .collect()
}

#[cfg(test)]
#[path = "membership_test.rs"]
mod tests;
