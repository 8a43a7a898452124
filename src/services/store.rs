//! Resource store — the persistence adapter seam.
//!
//! DESIGN
//! ======
//! The collaboration core never talks to Postgres directly. Everything
//! durable (ownership, collaborator lists, content, the mood-board message
//! log) goes through the `ResourceStore` trait so the gate, broadcaster and
//! membership workflow can be exercised against an in-memory double.
//!
//! Content updates are shallow overwrites: each top-level key in a patch
//! replaces the stored value for that key. There is no merge and no version
//! check, so concurrent writers resolve last-write-wins.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("resource not found: {0}")]
    ResourceNotFound(Uuid),
    #[error("stored value is invalid: {0}")]
    Corrupt(String),
}

// =============================================================================
// ROLE / STATUS
// =============================================================================

/// Collaborator role on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Editor => "editor",
            Self::Viewer => "viewer",
        }
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "editor" => Some(Self::Editor),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }
}

/// Invitation status of a collaborator entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InviteStatus {
    Pending,
    Accepted,
    Declined,
}

impl InviteStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
        }
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "declined" => Some(Self::Declined),
            _ => None,
        }
    }
}

/// Kind of collaboratively edited resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Trip,
    MoodBoard,
}

impl ResourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trip => "trip",
            Self::MoodBoard => "mood_board",
        }
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "trip" => Some(Self::Trip),
            "mood_board" => Some(Self::MoodBoard),
            _ => None,
        }
    }

    /// Mood boards keep a durable chat/notice log; trips only relay chat live.
    #[must_use]
    pub fn has_message_log(self) -> bool {
        matches!(self, Self::MoodBoard)
    }
}

// =============================================================================
// RECORDS
// =============================================================================

/// Durable membership record on a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collaborator {
    pub user_id: Uuid,
    pub role: Role,
    pub status: InviteStatus,
    /// Set when the invite is accepted.
    #[serde(with = "time::serde::rfc3339::option")]
    pub joined_at: Option<OffsetDateTime>,
}

/// A trip or mood board as seen by the collaboration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: Uuid,
    pub kind: ResourceKind,
    pub owner_id: Uuid,
    /// Opaque JSON object; the core only overwrites top-level keys.
    pub content: Value,
    pub collaborators: Vec<Collaborator>,
}

impl Resource {
    /// Find the stored entry for `user_id`, ignoring the implicit owner.
    #[must_use]
    pub fn collaborator(&self, user_id: Uuid) -> Option<&Collaborator> {
        self.collaborators.iter().find(|c| c.user_id == user_id)
    }
}

/// User-authored chat line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender_id: Uuid,
    pub sender_name: String,
    pub text: String,
    /// Milliseconds since Unix epoch.
    pub timestamp: i64,
}

/// Server-authored notice ("Invitation sent to X"). Never carries a sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemNotice {
    pub text: String,
    /// Milliseconds since Unix epoch.
    pub timestamp: i64,
}

/// One line of a resource's durable message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogEntry {
    Chat(ChatMessage),
    Notice(SystemNotice),
}

// =============================================================================
// ADAPTER
// =============================================================================

/// Persistence adapter consumed by the collaboration core.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    /// Load a resource with its collaborator list. `None` if it does not exist.
    async fn get_resource(&self, resource_id: Uuid) -> Result<Option<Resource>, StoreError>;

    /// Look up the stored membership entry for one user. `ResourceNotFound`
    /// if the resource itself does not exist.
    async fn is_collaborator(&self, resource_id: Uuid, user_id: Uuid) -> Result<Option<Collaborator>, StoreError>;

    /// Overwrite the addressed top-level content fields.
    async fn apply_content_update(&self, resource_id: Uuid, patch: &Map<String, Value>) -> Result<(), StoreError>;

    /// Append to the message log. Only called for message-log resources.
    async fn append_message(&self, resource_id: Uuid, entry: &LogEntry) -> Result<(), StoreError>;

    /// Insert or replace the entry for `collaborator.user_id`.
    async fn upsert_collaborator(&self, resource_id: Uuid, collaborator: &Collaborator) -> Result<(), StoreError>;

    /// Delete an entry. Returns whether one existed.
    async fn remove_collaborator(&self, resource_id: Uuid, user_id: Uuid) -> Result<bool, StoreError>;

    /// Resolve an invitee email to a user id.
    async fn find_user_by_email(&self, email: &str) -> Result<Option<Uuid>, StoreError>;
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
