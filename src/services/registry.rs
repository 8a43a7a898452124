//! Session registry — live collaboration sessions keyed by resource.
//!
//! DESIGN
//! ======
//! One registry instance is built at startup and handed to the broadcaster
//! and the websocket layer; tests build their own. The outer map only
//! resolves `resource_id -> session`; each session sits behind its own mutex
//! so joins, leaves and fan-out for one resource serialize while different
//! resources proceed in parallel. Neither lock is ever held across store I/O.
//!
//! LIFECYCLE
//! =========
//! Sessions are created lazily by the first admitted participant and removed
//! as soon as the last one leaves. Garbage collection takes the map lock,
//! then the session lock, and marks the session closed before dropping it;
//! a join that raced and still holds the old handle sees `closed` and retries
//! against a fresh session.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::Frame;
use crate::services::store::Role;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection {0} already joined this resource")]
    AlreadyJoined(Uuid),
}

impl crate::frame::ErrorCode for SessionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyJoined(_) => "AlreadyJoined",
        }
    }
}

/// Pointer position in resource coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

/// One connection's live presence in a session.
pub struct Participant {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    /// Role at join time. Informational only; gated actions re-check the store.
    pub role: Role,
    pub cursor: Cursor,
    /// Outbound frames for this connection.
    pub tx: mpsc::Sender<Frame>,
    seq: u64,
}

impl Participant {
    #[must_use]
    pub fn new(connection_id: Uuid, user_id: Uuid, display_name: &str, role: Role, tx: mpsc::Sender<Frame>) -> Self {
        Self { connection_id, user_id, display_name: display_name.to_owned(), role, cursor: Cursor::default(), tx, seq: 0 }
    }

    #[must_use]
    pub fn view(&self) -> ParticipantView {
        ParticipantView {
            connection_id: self.connection_id,
            user_id: self.user_id,
            display_name: self.display_name.clone(),
            role: self.role,
            cursor: self.cursor,
        }
    }
}

/// Serializable participant snapshot sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantView {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    pub role: Role,
    pub cursor: Cursor,
}

/// Live state for one resource.
pub struct CollabSession {
    pub resource_id: Uuid,
    participants: HashMap<Uuid, Participant>,
    next_seq: u64,
    closed: bool,
}

impl CollabSession {
    fn new(resource_id: Uuid) -> Self {
        Self { resource_id, participants: HashMap::new(), next_seq: 0, closed: false }
    }

    /// Participants in join order.
    fn views(&self) -> Vec<ParticipantView> {
        let mut ordered: Vec<&Participant> = self.participants.values().collect();
        ordered.sort_by_key(|p| p.seq);
        ordered.into_iter().map(Participant::view).collect()
    }

    fn deliver(&self, frame: &Frame, exclude: Option<Uuid>) -> usize {
        let mut delivered = 0;
        for (connection_id, participant) in &self.participants {
            if exclude == Some(*connection_id) {
                continue;
            }
            // Best-effort: a full or closed queue drops this frame for that client only.
            match participant.tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        resource_id = %self.resource_id,
                        %connection_id,
                        syscall = %frame.syscall,
                        error = %e,
                        "dropped frame for participant"
                    );
                }
            }
        }
        delivered
    }
}

type SharedSession = Arc<Mutex<CollabSession>>;

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, SharedSession>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn get(&self, resource_id: Uuid) -> Option<SharedSession> {
        self.sessions.read().await.get(&resource_id).cloned()
    }

    /// Return the live session for `resource_id`, creating an empty one if needed.
    pub async fn get_or_create_session(&self, resource_id: Uuid) -> SharedSession {
        if let Some(session) = self.get(resource_id).await {
            return session;
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(resource_id)
            .or_insert_with(|| {
                info!(%resource_id, "session created");
                Arc::new(Mutex::new(CollabSession::new(resource_id)))
            })
            .clone()
    }

    /// Admit a participant and return the session roster including it.
    ///
    /// # Errors
    ///
    /// `AlreadyJoined` if the connection is already in this session.
    pub async fn add_participant(
        &self,
        resource_id: Uuid,
        mut participant: Participant,
    ) -> Result<Vec<ParticipantView>, SessionError> {
        loop {
            let session = self.get_or_create_session(resource_id).await;
            let mut session = session.lock().await;
            if session.closed {
                // EDGE: collected between lookup and lock; retry on a fresh session.
                continue;
            }
            if session.participants.contains_key(&participant.connection_id) {
                return Err(SessionError::AlreadyJoined(participant.connection_id));
            }

            participant.seq = session.next_seq;
            session.next_seq += 1;
            let connection_id = participant.connection_id;
            session.participants.insert(connection_id, participant);
            info!(%resource_id, %connection_id, participants = session.participants.len(), "participant joined");
            return Ok(session.views());
        }
    }

    /// Remove a participant. Callers follow up with [`Self::maybe_garbage_collect`].
    pub async fn remove_participant(&self, resource_id: Uuid, connection_id: Uuid) -> Option<ParticipantView> {
        let session = self.get(resource_id).await?;
        let mut session = session.lock().await;
        let removed = session.participants.remove(&connection_id)?;
        info!(%resource_id, %connection_id, remaining = session.participants.len(), "participant left");
        Some(removed.view())
    }

    /// Drop the session if it has no participants. Returns whether it was dropped.
    pub async fn maybe_garbage_collect(&self, resource_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get(&resource_id).cloned() else {
            return false;
        };
        let mut session = session.lock().await;
        if !session.participants.is_empty() {
            return false;
        }
        session.closed = true;
        sessions.remove(&resource_id);
        info!(%resource_id, "session removed");
        true
    }

    /// Move a participant's cursor. `None` if the connection is not in the session.
    pub async fn update_cursor(&self, resource_id: Uuid, connection_id: Uuid, cursor: Cursor) -> Option<ParticipantView> {
        let session = self.get(resource_id).await?;
        let mut session = session.lock().await;
        let participant = session.participants.get_mut(&connection_id)?;
        participant.cursor = cursor;
        Some(participant.view())
    }

    pub async fn participant(&self, resource_id: Uuid, connection_id: Uuid) -> Option<ParticipantView> {
        let session = self.get(resource_id).await?;
        let session = session.lock().await;
        session.participants.get(&connection_id).map(Participant::view)
    }

    /// Current roster in join order. Empty if no session exists.
    #[cfg(test)]
    pub async fn snapshot(&self, resource_id: Uuid) -> Vec<ParticipantView> {
        let Some(session) = self.get(resource_id).await else {
            return Vec::new();
        };
        session.lock().await.views()
    }

    /// Fan a frame out to every participant except `exclude`. Returns deliveries.
    pub async fn broadcast(&self, resource_id: Uuid, frame: &Frame, exclude: Option<Uuid>) -> usize {
        let Some(session) = self.get(resource_id).await else {
            return 0;
        };
        session.lock().await.deliver(frame, exclude)
    }

    /// Every resource whose session currently contains `connection_id`.
    pub async fn resources_for(&self, connection_id: Uuid) -> Vec<Uuid> {
        let handles: Vec<SharedSession> = self.sessions.read().await.values().cloned().collect();
        let mut resources = Vec::new();
        for handle in handles {
            let session = handle.lock().await;
            if session.participants.contains_key(&connection_id) {
                resources.push(session.resource_id);
            }
        }
        resources
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    #[cfg(test)]
    pub async fn participant_count(&self, resource_id: Uuid) -> usize {
        let Some(session) = self.get(resource_id).await else {
            return 0;
        };
        session.lock().await.participants.len()
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
