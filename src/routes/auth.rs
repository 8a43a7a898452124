//! Auth routes — session cookie extractor and WS ticket issuance.

use axum::extract::{FromRef, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar};

use crate::services::auth::{self as auth_svc, Identity};
use crate::state::AppState;

const COOKIE_NAME: &str = "session_token";

// =============================================================================
// AUTH EXTRACTOR
// =============================================================================

/// Authenticated user extracted from the session cookie.
/// Use as a handler parameter to require authentication.
pub struct AuthUser {
    pub identity: Identity,
}

impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut axum::http::request::Parts, state: &S) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let token = jar.get(COOKIE_NAME).map(Cookie::value).unwrap_or_default();
        if token.is_empty() {
            return Err(StatusCode::UNAUTHORIZED);
        }

        let app_state = AppState::from_ref(state);
        let identity = auth_svc::validate_session(&app_state.pool, token)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "session validation failed");
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .ok_or(StatusCode::UNAUTHORIZED)?;

        Ok(Self { identity })
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

/// `POST /api/auth/ws-ticket` — issue a one-time ticket for `GET /api/ws`.
pub async fn ws_ticket(State(state): State<AppState>, auth: AuthUser) -> Result<Json<serde_json::Value>, StatusCode> {
    let ticket = auth_svc::create_ws_ticket(&state.pool, auth.identity.user_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!({ "ticket": ticket })))
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
