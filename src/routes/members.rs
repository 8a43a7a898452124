//! Collaborator management routes.
//!
//! Thin HTTP translation over `services::membership`. Every error is
//! returned as `{code, message}` with a status derived from the code, so
//! HTTP and websocket clients see the same error vocabulary.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::frame::ErrorCode;
use crate::routes::auth::AuthUser;
use crate::services::access::Membership;
use crate::services::membership::{self, Decision, InviteeIdentity, MembershipError};
use crate::services::store::{Collaborator, Role};
use crate::state::AppState;

// =============================================================================
// ERRORS
// =============================================================================

/// JSON error body: `{ "code": ..., "message": ... }`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, code, message: message.into() }
    }
}

impl From<MembershipError> for ApiError {
    fn from(err: MembershipError) -> Self {
        let code = err.error_code();
        Self { status: status_for_code(code), code, message: err.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(code = self.code, message = %self.message, "members: request failed");
        }
        (self.status, Json(serde_json::json!({ "code": self.code, "message": self.message }))).into_response()
    }
}

pub(crate) fn status_for_code(code: &str) -> StatusCode {
    match code {
        "Unauthorized" => StatusCode::FORBIDDEN,
        "ResourceNotFound" | "UserNotFound" | "CollaboratorNotFound" => StatusCode::NOT_FOUND,
        "AlreadyCollaborator" | "InvitePending" => StatusCode::CONFLICT,
        "InvalidRole" => StatusCode::BAD_REQUEST,
        "InternalPersistenceError" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn parse_role(raw: &str) -> Result<Role, ApiError> {
    Role::from_str(raw).ok_or_else(|| ApiError::bad_request("InvalidRole", format!("invalid role: {raw}")))
}

// =============================================================================
// BODIES
// =============================================================================

#[derive(Debug, Serialize)]
pub struct CollaboratorResponse {
    pub user_id: Uuid,
    pub role: Role,
    pub status: String,
    pub is_owner: bool,
}

impl From<Collaborator> for CollaboratorResponse {
    fn from(c: Collaborator) -> Self {
        Self { user_id: c.user_id, role: c.role, status: c.status.as_str().to_owned(), is_owner: c.role == Role::Owner }
    }
}

#[derive(Deserialize)]
pub struct InviteBody {
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub role: String,
}

#[derive(Deserialize)]
pub struct ChangeRoleBody {
    pub role: String,
}

#[derive(Deserialize)]
pub struct RespondBody {
    pub decision: String,
}

// =============================================================================
// HANDLERS
// =============================================================================

/// `GET /api/resources/:id/membership` — the caller's own access.
pub async fn my_membership(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(resource_id): Path<Uuid>,
) -> Result<Json<Membership>, ApiError> {
    let membership = state
        .gate
        .verify_membership(resource_id, auth.identity.user_id)
        .await
        .map_err(MembershipError::from)?;
    Ok(Json(membership))
}

/// `GET /api/resources/:id/collaborators` — owner first, then entries.
pub async fn list_collaborators(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(resource_id): Path<Uuid>,
) -> Result<Json<Vec<CollaboratorResponse>>, ApiError> {
    let rows = membership::list_collaborators(&state.gate, resource_id, auth.identity.user_id).await?;
    Ok(Json(rows.into_iter().map(CollaboratorResponse::from).collect()))
}

/// `POST /api/resources/:id/collaborators` — invite by user id or email.
pub async fn invite(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(resource_id): Path<Uuid>,
    Json(body): Json<InviteBody>,
) -> Result<(StatusCode, Json<CollaboratorResponse>), ApiError> {
    let role = parse_role(&body.role)?;
    let invitee = match (body.user_id, body.email) {
        (Some(user_id), _) => InviteeIdentity::UserId(user_id),
        (None, Some(email)) if !email.trim().is_empty() => InviteeIdentity::Email(email.trim().to_owned()),
        _ => return Err(ApiError::bad_request("InvalidInvitee", "user_id or email required")),
    };

    let invitation = membership::invite(
        &state.gate,
        state.store.as_ref(),
        resource_id,
        auth.identity.user_id,
        &invitee,
        role,
    )
    .await?;

    if let Some(notice) = invitation.notice {
        state.broadcaster.notify(resource_id, notice).await;
    }
    Ok((StatusCode::CREATED, Json(invitation.collaborator.into())))
}

/// `PATCH /api/resources/:id/collaborators/:user_id` — change a role.
pub async fn change_role(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((resource_id, target_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<ChangeRoleBody>,
) -> Result<Json<CollaboratorResponse>, ApiError> {
    let role = parse_role(&body.role)?;
    let updated = membership::change_role(
        &state.gate,
        state.store.as_ref(),
        resource_id,
        auth.identity.user_id,
        target_id,
        role,
    )
    .await?;
    Ok(Json(updated.into()))
}

/// `DELETE /api/resources/:id/collaborators/:user_id` — remove an entry.
pub async fn remove_collaborator(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((resource_id, target_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    membership::remove_collaborator(&state.gate, state.store.as_ref(), resource_id, auth.identity.user_id, target_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/resources/:id/invite` — accept or decline the caller's invite.
pub async fn respond_invite(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(resource_id): Path<Uuid>,
    Json(body): Json<RespondBody>,
) -> Result<Json<CollaboratorResponse>, ApiError> {
    let Some(decision) = Decision::from_str(&body.decision) else {
        return Err(ApiError::bad_request("InvalidDecision", "decision must be accept or decline"));
    };
    let entry = membership::respond_invite(state.store.as_ref(), resource_id, auth.identity.user_id, decision).await?;
    Ok(Json(entry.into()))
}

#[cfg(test)]
#[path = "members_test.rs"]
mod tests;
