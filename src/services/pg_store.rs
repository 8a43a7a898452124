//! Postgres-backed `ResourceStore`.
//!
//! DESIGN
//! ======
//! Resource content lives in a `jsonb` column and patches are applied with
//! the `||` operator, which overwrites only the top-level keys present in the
//! patch. Collaborators are one row per `(resource_id, user_id)`; the primary
//! key enforces the one-entry-per-user invariant and upserts reuse it.

use serde_json::{Map, Value};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::store::{Collaborator, InviteStatus, LogEntry, Resource, ResourceKind, ResourceStore, Role, StoreError};

type CollaboratorRow = (Uuid, String, String, Option<OffsetDateTime>);

/// Collaborator columns from an outer join; all null when the user has no entry.
type MaybeCollaboratorRow = (Option<Uuid>, Option<String>, Option<String>, Option<OffsetDateTime>);

#[derive(Clone)]
pub struct PgResourceStore {
    pool: PgPool,
}

impl PgResourceStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn collaborator_from_row((user_id, role, status, joined_at): CollaboratorRow) -> Result<Collaborator, StoreError> {
    let role = Role::from_str(&role).ok_or_else(|| StoreError::Corrupt(format!("role {role}")))?;
    let status = InviteStatus::from_str(&status).ok_or_else(|| StoreError::Corrupt(format!("status {status}")))?;
    Ok(Collaborator { user_id, role, status, joined_at })
}

fn entry_from_joined_row(
    (user_id, role, status, joined_at): MaybeCollaboratorRow,
) -> Result<Option<Collaborator>, StoreError> {
    match (user_id, role, status) {
        (Some(user_id), Some(role), Some(status)) => collaborator_from_row((user_id, role, status, joined_at)).map(Some),
        (None, _, _) => Ok(None),
        _ => Err(StoreError::Corrupt("collaborator row with null columns".into())),
    }
}

#[async_trait::async_trait]
impl ResourceStore for PgResourceStore {
    async fn get_resource(&self, resource_id: Uuid) -> Result<Option<Resource>, StoreError> {
        // Resource row and collaborator rows come from one snapshot.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, (Uuid, String, Uuid, Value)>(
            "SELECT id, kind, owner_id, content FROM resources WHERE id = $1",
        )
        .bind(resource_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id, kind, owner_id, content)) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let kind = ResourceKind::from_str(&kind).ok_or_else(|| StoreError::Corrupt(format!("kind {kind}")))?;

        let rows = sqlx::query_as::<_, CollaboratorRow>(
            "SELECT user_id, role, status, joined_at
             FROM resource_collaborators
             WHERE resource_id = $1
             ORDER BY invited_at ASC",
        )
        .bind(resource_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let collaborators = rows
            .into_iter()
            .map(collaborator_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(Resource { id, kind, owner_id, content, collaborators }))
    }

    async fn is_collaborator(&self, resource_id: Uuid, user_id: Uuid) -> Result<Option<Collaborator>, StoreError> {
        let row = sqlx::query_as::<_, MaybeCollaboratorRow>(
            "SELECT c.user_id, c.role, c.status, c.joined_at
             FROM resources r
             LEFT JOIN resource_collaborators c
                 ON c.resource_id = r.id AND c.user_id = $2
             WHERE r.id = $1",
        )
        .bind(resource_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(StoreError::ResourceNotFound(resource_id));
        };
        entry_from_joined_row(row)
    }

    async fn apply_content_update(&self, resource_id: Uuid, patch: &Map<String, Value>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE resources SET content = content || $2, updated_at = now() WHERE id = $1")
            .bind(resource_id)
            .bind(Value::Object(patch.clone()))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ResourceNotFound(resource_id));
        }
        Ok(())
    }

    async fn append_message(&self, resource_id: Uuid, entry: &LogEntry) -> Result<(), StoreError> {
        let (kind, sender_id, sender_name, text, timestamp) = match entry {
            LogEntry::Chat(msg) => ("chat", Some(msg.sender_id), Some(msg.sender_name.as_str()), &msg.text, msg.timestamp),
            LogEntry::Notice(notice) => ("notice", None, None, &notice.text, notice.timestamp),
        };

        sqlx::query(
            "INSERT INTO resource_messages (id, resource_id, kind, sender_id, sender_name, text, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, to_timestamp($7::double precision / 1000.0))",
        )
        .bind(Uuid::new_v4())
        .bind(resource_id)
        .bind(kind)
        .bind(sender_id)
        .bind(sender_name)
        .bind(text)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_collaborator(&self, resource_id: Uuid, collaborator: &Collaborator) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO resource_collaborators (resource_id, user_id, role, status, joined_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (resource_id, user_id) DO UPDATE SET
                 role = EXCLUDED.role,
                 status = EXCLUDED.status,
                 joined_at = EXCLUDED.joined_at",
        )
        .bind(resource_id)
        .bind(collaborator.user_id)
        .bind(collaborator.role.as_str())
        .bind(collaborator.status.as_str())
        .bind(collaborator.joined_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_collaborator(&self, resource_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM resource_collaborators WHERE resource_id = $1 AND user_id = $2")
            .bind(resource_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<Uuid>, StoreError> {
        let id = sqlx::query_scalar::<_, Uuid>("SELECT id FROM users WHERE lower(email) = lower($1)")
            .bind(email.trim())
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }
}

#[cfg(test)]
#[path = "pg_store_test.rs"]
mod tests;
