//! WebSocket handler — connection lifecycle and frame dispatch.
//!
//! DESIGN
//! ======
//! On upgrade, the ticket is consumed, a connection ID is generated, and the
//! socket enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Room events queued by the broadcaster → forward to client
//!
//! Handler functions validate input, call the broadcaster, and return an
//! `Outcome` describing the reply to the sender. Fan-out to peers is owned by
//! the broadcaster; the dispatch layer only ever answers the originator.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `session:connected` with `connection_id`
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Dispatch turns the Outcome into a done/error reply (or nothing)
//! 4. Close or error → `disconnect` removes the connection from every
//!    session it joined and peers receive `participant:left`
//!
//! Frames from one connection are handled strictly in arrival order. The
//! socket is still read while a frame is in flight: further text frames
//! are queued behind it, and a close drops the in-flight work, so a join
//! still waiting on the gate registers nothing.

use std::collections::{HashMap, VecDeque};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::{Data, Frame, Status};
use crate::services::auth::{self, Identity};
use crate::services::broadcast::Connection;
use crate::services::event::Event;
use crate::services::registry::Cursor;
use crate::state::AppState;

// =============================================================================
// OUTCOME
// =============================================================================

/// What the sender gets back for one inbound frame.
#[derive(Debug)]
enum Outcome {
    /// Send done+data to sender.
    Reply(Data),
    /// Send empty done to sender.
    Done,
    /// No reply. Used for cursor moves.
    Silent,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(ticket) = params.get("ticket") else {
        return (StatusCode::UNAUTHORIZED, "ticket required").into_response();
    };

    let identity = match auth::consume_ws_ticket(&state.pool, ticket).await {
        Ok(Some(identity)) => identity,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "invalid or expired ticket").into_response(),
        Err(e) => {
            tracing::error!(error = %e, "ws ticket validation failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "ticket validation error").into_response();
        }
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, identity))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, identity: Identity) {
    let connection_id = Uuid::new_v4();

    // Per-connection queue for room events pushed by the broadcaster.
    let (tx, mut rx) = mpsc::channel::<Frame>(state.config.client_queue_capacity);
    let conn = Connection { connection_id, user_id: identity.user_id, display_name: identity.display_name, tx };

    let welcome = Frame::request("session:connected", Data::new())
        .with_data("connection_id", connection_id.to_string())
        .with_data("user_id", identity.user_id.to_string());
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }

    info!(%connection_id, user_id = %conn.user_id, "ws: client connected");

    // Text frames that arrived while an earlier frame was still in flight.
    let mut backlog: VecDeque<String> = VecDeque::new();

    'conn: loop {
        let text = if let Some(text) = backlog.pop_front() {
            text
        } else {
            tokio::select! {
                msg = socket.next_message() => match msg {
                    Inbound::Text(text) => text,
                    Inbound::Closed => break,
                    Inbound::Other => continue,
                },
                Some(frame) = rx.recv() => {
                    if send_frame(&mut socket, &frame).await.is_err() {
                        break;
                    }
                    continue;
                }
            }
        };

        let Some(replies) = dispatch_until_closed(&state, &conn, &text, &mut socket, &mut backlog).await else {
            break;
        };
        for frame in replies {
            if send_frame(&mut socket, &frame).await.is_err() {
                break 'conn;
            }
        }
    }

    let left = state.broadcaster.disconnect(connection_id).await;
    let live_sessions = state.broadcaster.registry().session_count().await;
    info!(%connection_id, sessions_left = left, live_sessions, "ws: client disconnected");
}

// =============================================================================
// INBOUND
// =============================================================================

/// One client message, reduced to what the connection loop acts on.
#[derive(Debug)]
enum Inbound {
    Text(String),
    Closed,
    Other,
}

/// Source of client messages. The live socket in production; a plain
/// channel in tests.
trait ClientMessages {
    async fn next_message(&mut self) -> Inbound;
}

impl ClientMessages for WebSocket {
    async fn next_message(&mut self) -> Inbound {
        match self.recv().await {
            Some(Ok(Message::Text(text))) => Inbound::Text(text.as_str().to_owned()),
            Some(Ok(Message::Close(_)) | Err(_)) | None => Inbound::Closed,
            Some(Ok(_)) => Inbound::Other,
        }
    }
}

/// Process one inbound frame while still watching the client.
///
/// If the client goes away before processing finishes, the in-flight work
/// is dropped and `None` is returned. A join still waiting on the gate is
/// therefore abandoned before it registers anything. Text frames that
/// arrive meanwhile are queued on `backlog` in order.
async fn dispatch_until_closed(
    state: &AppState,
    conn: &Connection,
    text: &str,
    client: &mut impl ClientMessages,
    backlog: &mut VecDeque<String>,
) -> Option<Vec<Frame>> {
    let work = process_inbound_text(state, conn, text);
    tokio::pin!(work);
    loop {
        tokio::select! {
            replies = &mut work => return Some(replies),
            msg = client.next_message() => match msg {
                Inbound::Text(next) => backlog.push_back(next),
                Inbound::Closed => {
                    info!(connection_id = %conn.connection_id, "ws: client closed mid-request; abandoning");
                    return None;
                }
                Inbound::Other => {}
            },
        }
    }
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
///
/// Kept separate from the socket so tests can drive dispatch end-to-end
/// with plain channels.
async fn process_inbound_text(state: &AppState, conn: &Connection, text: &str) -> Vec<Frame> {
    let req: Frame = match serde_json::from_str::<Frame>(text) {
        Ok(r) => r.with_from(conn.user_id.to_string()),
        Err(e) => {
            warn!(connection_id = %conn.connection_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new()).with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };

    if req.prefix() != "cursor" {
        info!(connection_id = %conn.connection_id, id = %req.id, syscall = %req.syscall, "ws: recv frame");
    }

    let Some(resource_id) = req.resource_id else {
        return vec![req.error("resource_id required")];
    };

    let result = match req.prefix() {
        "session" => handle_session(state, conn, resource_id, &req).await,
        "cursor" => handle_cursor(state, conn, resource_id, &req).await,
        "content" => handle_content(state, conn, resource_id, &req).await,
        "chat" => handle_chat(state, conn, resource_id, &req).await,
        prefix => Err(req.error(format!("unknown prefix: {prefix}"))),
    };

    match result {
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Done) => vec![req.done()],
        Ok(Outcome::Silent) => vec![],
        Err(err_frame) => vec![err_frame],
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

async fn handle_session(state: &AppState, conn: &Connection, resource_id: Uuid, req: &Frame) -> Result<Outcome, Frame> {
    match req.op() {
        "join" => match state.broadcaster.join(conn, resource_id).await {
            Ok(event) => Ok(Outcome::Reply(event.data())),
            Err(e) => Err(req.error_from(&e)),
        },
        "leave" => {
            state.broadcaster.leave(resource_id, conn.connection_id).await;
            Ok(Outcome::Done)
        }
        op => Err(req.error(format!("unknown session op: {op}"))),
    }
}

async fn handle_cursor(state: &AppState, conn: &Connection, resource_id: Uuid, req: &Frame) -> Result<Outcome, Frame> {
    if req.op() != "move" {
        return Err(req.error(format!("unknown cursor op: {}", req.op())));
    }
    let x = req.data.get("x").and_then(Value::as_f64);
    let y = req.data.get("y").and_then(Value::as_f64);
    let (Some(x), Some(y)) = (x, y) else {
        // Malformed moves are dropped; the last good position stands.
        debug!(connection_id = %conn.connection_id, "ws: cursor move without numeric x/y ignored");
        return Ok(Outcome::Silent);
    };
    state
        .broadcaster
        .cursor_move(resource_id, conn.connection_id, Cursor { x, y })
        .await;
    Ok(Outcome::Silent)
}

async fn handle_content(state: &AppState, conn: &Connection, resource_id: Uuid, req: &Frame) -> Result<Outcome, Frame> {
    if req.op() != "update" {
        return Err(req.error(format!("unknown content op: {}", req.op())));
    }
    let Some(Value::Object(patch)) = req.data.get("patch") else {
        return Err(req.error("patch must be an object"));
    };

    match state
        .broadcaster
        .content_update(resource_id, conn.connection_id, patch.clone())
        .await
    {
        Ok(()) => Ok(Outcome::Done),
        Err(e) => Err(req.error_from(&e)),
    }
}

async fn handle_chat(state: &AppState, conn: &Connection, resource_id: Uuid, req: &Frame) -> Result<Outcome, Frame> {
    if req.op() != "message" {
        return Err(req.error(format!("unknown chat op: {}", req.op())));
    }
    let text = req
        .data
        .get("text")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if text.is_empty() {
        return Err(req.error("text required"));
    }

    match state
        .broadcaster
        .chat_message(resource_id, conn.connection_id, text)
        .await
    {
        Ok(message) => Ok(Outcome::Reply(Event::ChatMessage(message).data())),
        Err(e) => Err(req.error_from(&e)),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if !frame.syscall.starts_with("cursor:") {
        if frame.status == Status::Error {
            let code = frame.error_code().unwrap_or("-");
            let message = frame
                .data
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("-");
            warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
        } else {
            info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
        }
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
