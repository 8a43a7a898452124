//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! This module binds the HTTP membership API and the collaboration
//! websocket under a single Axum router. Authentication happens per
//! handler via the `AuthUser` extractor; the websocket authenticates with
//! a one-time ticket instead of the cookie.

pub mod auth;
pub mod members;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Full application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/auth/ws-ticket", post(auth::ws_ticket))
        .route("/api/resources/{id}/membership", get(members::my_membership))
        .route(
            "/api/resources/{id}/collaborators",
            get(members::list_collaborators).post(members::invite),
        )
        .route(
            "/api/resources/{id}/collaborators/{user_id}",
            patch(members::change_role).delete(members::remove_collaborator),
        )
        .route("/api/resources/{id}/invite", post(members::respond_invite))
        .route("/api/ws", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
