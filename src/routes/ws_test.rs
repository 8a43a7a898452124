use super::*;
use crate::frame::{FRAME_CODE, FRAME_RETRYABLE};
use crate::services::event::{CONTENT_PATCHED, CURSOR_UPDATE, PARTICIPANT_JOINED, PARTICIPANT_LEFT};
use crate::services::memory_store::MemoryStore;
use crate::services::store::{InviteStatus, ResourceKind, Role};
use crate::state::test_helpers;
use serde_json::json;
use std::sync::Arc;
use tokio::time::{Duration, timeout};

fn connection(user_id: Uuid, name: &str) -> (Connection, mpsc::Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(32);
    (Connection { connection_id: Uuid::new_v4(), user_id, display_name: name.to_owned(), tx }, rx)
}

fn request_text(resource_id: Option<Uuid>, syscall: &str, data: Data) -> String {
    let mut req = Frame::request(syscall, data);
    req.resource_id = resource_id;
    serde_json::to_string(&req).unwrap()
}

async fn send(state: &AppState, conn: &Connection, resource_id: Uuid, syscall: &str, data: Data) -> Vec<Frame> {
    process_inbound_text(state, conn, &request_text(Some(resource_id), syscall, data)).await
}

/// Client side of a connection, fed by the test instead of a socket.
impl ClientMessages for mpsc::Receiver<Inbound> {
    async fn next_message(&mut self) -> Inbound {
        self.recv().await.unwrap_or(Inbound::Closed)
    }
}

async fn recv_room_event(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("room event receive timed out")
        .expect("room channel closed unexpectedly")
}

async fn assert_no_room_event(rx: &mut mpsc::Receiver<Frame>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected no room event"
    );
}

/// Owner (A) and accepted editor (B) of one trip, both joined.
async fn joined_room(
    store: &Arc<MemoryStore>,
    state: &AppState,
) -> (Uuid, (Connection, mpsc::Receiver<Frame>), (Connection, mpsc::Receiver<Frame>)) {
    let owner = Uuid::new_v4();
    let editor = Uuid::new_v4();
    let resource_id = store.insert_resource(ResourceKind::Trip, owner);
    store.seed_collaborator(resource_id, editor, Role::Editor, InviteStatus::Accepted);

    let (a, mut rx_a) = connection(owner, "alice");
    let (b, rx_b) = connection(editor, "bob");
    send(state, &a, resource_id, "session:join", Data::new()).await;
    send(state, &b, resource_id, "session:join", Data::new()).await;
    assert_eq!(recv_room_event(&mut rx_a).await.syscall, PARTICIPANT_JOINED);
    (resource_id, (a, rx_a), (b, rx_b))
}

// =============================================================================
// PARSING
// =============================================================================

#[tokio::test]
async fn invalid_json_returns_gateway_error() {
    let (state, _) = test_helpers::test_app_state();
    let (conn, _rx) = connection(Uuid::new_v4(), "alice");
    let replies = process_inbound_text(&state, &conn, "{not json").await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].syscall, "gateway:error");
}

#[tokio::test]
async fn missing_resource_id_is_rejected() {
    let (state, _) = test_helpers::test_app_state();
    let (conn, _rx) = connection(Uuid::new_v4(), "alice");
    let replies = process_inbound_text(&state, &conn, &request_text(None, "session:join", Data::new())).await;
    assert_eq!(replies[0].status, Status::Error);
    assert_eq!(replies[0].data["message"], "resource_id required");
}

#[tokio::test]
async fn unknown_prefix_is_rejected() {
    let (state, _) = test_helpers::test_app_state();
    let (conn, _rx) = connection(Uuid::new_v4(), "alice");
    let replies = send(&state, &conn, Uuid::new_v4(), "board:join", Data::new()).await;
    assert_eq!(replies[0].status, Status::Error);
}

// =============================================================================
// SESSION
// =============================================================================

#[tokio::test]
async fn join_reply_carries_participants_and_content() {
    let (state, store) = test_helpers::test_app_state();
    let owner = Uuid::new_v4();
    let resource_id = store.insert_resource(ResourceKind::MoodBoard, owner);
    let (conn, _rx) = connection(owner, "alice");

    let replies = send(&state, &conn, resource_id, "session:join", Data::new()).await;
    assert_eq!(replies.len(), 1);
    let reply = &replies[0];
    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.resource_id, Some(resource_id));
    assert_eq!(reply.data["participants"][0]["display_name"], "alice");
    assert_eq!(reply.data["participants"][0]["role"], "owner");
    assert_eq!(reply.data["content"]["title"], "Untitled");
}

#[tokio::test]
async fn unauthorized_join_gets_structured_error() {
    let (state, store) = test_helpers::test_app_state();
    let resource_id = store.insert_resource(ResourceKind::Trip, Uuid::new_v4());
    let (conn, _rx) = connection(Uuid::new_v4(), "mallory");

    let replies = send(&state, &conn, resource_id, "session:join", Data::new()).await;
    assert_eq!(replies[0].status, Status::Error);
    assert_eq!(replies[0].error_code(), Some("Unauthorized"));
    assert_eq!(replies[0].data[FRAME_RETRYABLE], false);
    assert_eq!(state.broadcaster.registry().session_count().await, 0);
}

#[tokio::test]
async fn explicit_leave_notifies_peers() {
    let (state, store) = test_helpers::test_app_state();
    let (resource_id, (_a, mut rx_a), (b, _rx_b)) = joined_room(&store, &state).await;

    let replies = send(&state, &b, resource_id, "session:leave", Data::new()).await;
    assert_eq!(replies[0].status, Status::Done);
    let left = recv_room_event(&mut rx_a).await;
    assert_eq!(left.syscall, PARTICIPANT_LEFT);
    assert_eq!(left.data["user_id"], json!(b.user_id));
    assert_eq!(state.broadcaster.registry().participant_count(resource_id).await, 1);
}

// =============================================================================
// CURSOR / CONTENT / CHAT
// =============================================================================

#[tokio::test]
async fn cursor_move_has_no_reply_and_skips_sender() {
    let (state, store) = test_helpers::test_app_state();
    let (resource_id, (a, mut rx_a), (_b, mut rx_b)) = joined_room(&store, &state).await;

    let mut data = Data::new();
    data.insert("x".into(), json!(40.0));
    data.insert("y".into(), json!(8.5));
    let replies = send(&state, &a, resource_id, "cursor:move", data).await;

    assert!(replies.is_empty());
    let update = recv_room_event(&mut rx_b).await;
    assert_eq!(update.syscall, CURSOR_UPDATE);
    assert_eq!(update.data["y"], 8.5);
    assert_no_room_event(&mut rx_a).await;
}

#[tokio::test]
async fn cursor_move_without_coordinates_is_dropped() {
    let (state, store) = test_helpers::test_app_state();
    let (resource_id, (a, _rx_a), (_b, mut rx_b)) = joined_room(&store, &state).await;

    let mut data = Data::new();
    data.insert("x".into(), json!(12.0));
    data.insert("y".into(), json!(7.0));
    send(&state, &a, resource_id, "cursor:move", data).await;
    assert_eq!(recv_room_event(&mut rx_b).await.syscall, CURSOR_UPDATE);

    let mut data = Data::new();
    data.insert("x".into(), json!("left"));
    let replies = send(&state, &a, resource_id, "cursor:move", data).await;

    assert!(replies.is_empty());
    assert_no_room_event(&mut rx_b).await;
    let view = state
        .broadcaster
        .registry()
        .participant(resource_id, a.connection_id)
        .await
        .expect("sender should still be joined");
    assert_eq!(view.cursor, Cursor { x: 12.0, y: 7.0 });
}

#[tokio::test]
async fn unknown_cursor_op_is_rejected() {
    let (state, store) = test_helpers::test_app_state();
    let (resource_id, (a, _rx_a), (_b, mut rx_b)) = joined_room(&store, &state).await;

    let replies = send(&state, &a, resource_id, "cursor:teleport", Data::new()).await;
    assert_eq!(replies[0].status, Status::Error);
    assert_no_room_event(&mut rx_b).await;
}

#[tokio::test]
async fn content_update_acks_sender_and_patches_peer() {
    let (state, store) = test_helpers::test_app_state();
    let (resource_id, (a, mut rx_a), (_b, mut rx_b)) = joined_room(&store, &state).await;

    let mut data = Data::new();
    data.insert("patch".into(), json!({"title": "Day 2 Revised"}));
    let replies = send(&state, &a, resource_id, "content:update", data).await;

    assert_eq!(replies[0].status, Status::Done);
    assert!(replies[0].data.is_empty());
    let patched = recv_room_event(&mut rx_b).await;
    assert_eq!(patched.syscall, CONTENT_PATCHED);
    assert_eq!(patched.data["patch"]["title"], "Day 2 Revised");
    assert_no_room_event(&mut rx_a).await;
    assert_eq!(store.content(resource_id)["title"], "Day 2 Revised");
}

#[tokio::test]
async fn non_object_patch_is_rejected_before_store() {
    let (state, store) = test_helpers::test_app_state();
    let (resource_id, (a, _rx_a), (_b, mut rx_b)) = joined_room(&store, &state).await;

    let mut data = Data::new();
    data.insert("patch".into(), json!(["title"]));
    let replies = send(&state, &a, resource_id, "content:update", data).await;

    assert_eq!(replies[0].status, Status::Error);
    assert!(!replies[0].data.contains_key(FRAME_CODE));
    assert_no_room_event(&mut rx_b).await;
}

#[tokio::test]
async fn viewer_patch_is_unauthorized_and_not_broadcast() {
    let (state, store) = test_helpers::test_app_state();
    let (resource_id, (_a, mut rx_a), _) = joined_room(&store, &state).await;
    let viewer = Uuid::new_v4();
    store.seed_collaborator(resource_id, viewer, Role::Viewer, InviteStatus::Accepted);
    let (c, _rx_c) = connection(viewer, "carol");
    send(&state, &c, resource_id, "session:join", Data::new()).await;
    assert_eq!(recv_room_event(&mut rx_a).await.syscall, PARTICIPANT_JOINED);

    let mut data = Data::new();
    data.insert("patch".into(), json!({"title": "x"}));
    let replies = send(&state, &c, resource_id, "content:update", data).await;

    assert_eq!(replies[0].error_code(), Some("Unauthorized"));
    assert_no_room_event(&mut rx_a).await;
    assert_eq!(store.content(resource_id)["title"], "Untitled");
}

#[tokio::test]
async fn chat_is_trimmed_echoed_to_sender_and_relayed_to_peer() {
    let (state, store) = test_helpers::test_app_state();
    let (resource_id, (a, mut rx_a), (_b, mut rx_b)) = joined_room(&store, &state).await;

    let mut data = Data::new();
    data.insert("text".into(), json!("  see you at the airport  "));
    let replies = send(&state, &a, resource_id, "chat:message", data).await;

    assert_eq!(replies[0].status, Status::Done);
    assert_eq!(replies[0].data["text"], "see you at the airport");
    assert_eq!(replies[0].data["type"], "chat");
    let relayed = recv_room_event(&mut rx_b).await;
    assert_eq!(relayed.data["sender_name"], "alice");
    assert_no_room_event(&mut rx_a).await;
}

#[tokio::test]
async fn blank_chat_is_rejected() {
    let (state, store) = test_helpers::test_app_state();
    let (resource_id, (a, _rx_a), (_b, mut rx_b)) = joined_room(&store, &state).await;

    let mut data = Data::new();
    data.insert("text".into(), json!("   "));
    let replies = send(&state, &a, resource_id, "chat:message", data).await;

    assert_eq!(replies[0].status, Status::Error);
    assert_no_room_event(&mut rx_b).await;
}

// =============================================================================
// DISCONNECT
// =============================================================================

#[tokio::test]
async fn disconnect_without_leave_notifies_remaining_participants() {
    let (state, store) = test_helpers::test_app_state();
    let (resource_id, (_a, mut rx_a), (b, rx_b)) = joined_room(&store, &state).await;

    drop(rx_b);
    state.broadcaster.disconnect(b.connection_id).await;

    let left = recv_room_event(&mut rx_a).await;
    assert_eq!(left.syscall, PARTICIPANT_LEFT);
    assert_eq!(left.data["connection_id"], json!(b.connection_id));
    assert!(
        state
            .broadcaster
            .registry()
            .participant(resource_id, b.connection_id)
            .await
            .is_none()
    );
}

// =============================================================================
// CLIENT CLOSE DURING A REQUEST
// =============================================================================

#[tokio::test]
async fn close_while_join_awaits_gate_registers_nothing() {
    let (state, store) = test_helpers::test_app_state();
    let owner = Uuid::new_v4();
    let editor = Uuid::new_v4();
    let resource_id = store.insert_resource(ResourceKind::Trip, owner);
    store.seed_collaborator(resource_id, editor, Role::Editor, InviteStatus::Accepted);
    let (a, mut rx_a) = connection(owner, "alice");
    send(&state, &a, resource_id, "session:join", Data::new()).await;

    store.set_read_delay(Duration::from_millis(100));
    let (b, _rx_b) = connection(editor, "bob");
    let (client_tx, mut client) = mpsc::channel(4);
    client_tx.send(Inbound::Closed).await.unwrap();
    let mut backlog = VecDeque::new();

    let join = request_text(Some(resource_id), "session:join", Data::new());
    let replies = dispatch_until_closed(&state, &b, &join, &mut client, &mut backlog).await;

    assert!(replies.is_none());
    assert_no_room_event(&mut rx_a).await;
    assert!(
        state
            .broadcaster
            .registry()
            .participant(resource_id, b.connection_id)
            .await
            .is_none()
    );
    assert_eq!(state.broadcaster.registry().participant_count(resource_id).await, 1);
}

#[tokio::test]
async fn frames_arriving_mid_request_are_queued_in_order() {
    let (state, store) = test_helpers::test_app_state();
    let owner = Uuid::new_v4();
    let resource_id = store.insert_resource(ResourceKind::Trip, owner);
    store.set_read_delay(Duration::from_millis(50));
    let (a, _rx_a) = connection(owner, "alice");

    let (client_tx, mut client) = mpsc::channel(4);
    client_tx.send(Inbound::Text("first".into())).await.unwrap();
    client_tx.send(Inbound::Text("second".into())).await.unwrap();
    let mut backlog = VecDeque::new();

    let join = request_text(Some(resource_id), "session:join", Data::new());
    let replies = dispatch_until_closed(&state, &a, &join, &mut client, &mut backlog)
        .await
        .expect("open client should get its replies");

    assert_eq!(replies[0].status, Status::Done);
    assert_eq!(backlog, ["first", "second"]);
    drop(client_tx);
}
