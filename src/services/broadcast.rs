//! Broadcaster — admits participants and fans room events out.
//!
//! DESIGN
//! ======
//! Each operation validates against the access gate, mutates the registry,
//! and pushes typed events to the other participants of the same session.
//! The originating connection is answered by the caller (the websocket
//! layer) from the returned value; the broadcaster never echoes a sender's
//! own cursor, patch, or chat line back to it.
//!
//! ORDERING
//! ========
//! A connection's frames are handled one at a time and fan-out uses
//! per-recipient FIFO queues, so each peer sees one sender's events in the
//! order they were accepted. Two senders racing on content both reach the
//! store; whichever write lands last wins, and peers may observe the two
//! `content:patched` events in either order.
//!
//! ERROR HANDLING
//! ==============
//! Every error stays with the originating request. A failed store write
//! happens before any broadcast, so peers never see a patch or chat line
//! that was not persisted. Writes share the gate's store timeout so a hung
//! database cannot stall the connection that issued them.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::frame::{Frame, now_ms};
use crate::services::access::{AccessError, AccessGate, Permission};
use crate::services::event::Event;
use crate::services::registry::{Cursor, Participant, ParticipantView, SessionError, SessionRegistry};
use crate::services::store::{ChatMessage, LogEntry, ResourceStore, StoreError, SystemNotice};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("must join resource {0} first")]
    NotJoined(Uuid),
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("store write did not finish within {0:?}")]
    WriteTimeout(Duration),
}

impl crate::frame::ErrorCode for CollabError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Access(e) => e.error_code(),
            Self::Session(e) => e.error_code(),
            Self::NotJoined(_) => "Unauthorized",
            Self::Persistence(_) | Self::WriteTimeout(_) => "InternalPersistenceError",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Access(e) => e.retryable(),
            Self::Persistence(_) | Self::WriteTimeout(_) => true,
            _ => false,
        }
    }
}

/// An authenticated transport connection.
#[derive(Clone)]
pub struct Connection {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    pub tx: mpsc::Sender<Frame>,
}

// =============================================================================
// BROADCASTER
// =============================================================================

#[derive(Clone)]
pub struct Broadcaster {
    registry: SessionRegistry,
    gate: AccessGate,
    store: Arc<dyn ResourceStore>,
}

impl Broadcaster {
    #[must_use]
    pub fn new(registry: SessionRegistry, gate: AccessGate, store: Arc<dyn ResourceStore>) -> Self {
        Self { registry, gate, store }
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Admit `conn` to the resource's session.
    ///
    /// Returns the `ParticipantList` reply for the joiner; peers get
    /// `participant:joined`. Nothing is registered unless authorization
    /// succeeds. Dropping the future while the gate is still reading leaves
    /// no state behind.
    ///
    /// # Errors
    ///
    /// `Unauthorized`/`ResourceNotFound` from the gate, or `AlreadyJoined`.
    pub async fn join(&self, conn: &Connection, resource_id: Uuid) -> Result<Event, CollabError> {
        let (resource, role) = self
            .gate
            .authorize(resource_id, conn.user_id, Permission::View)
            .await?;

        let participant = Participant::new(conn.connection_id, conn.user_id, &conn.display_name, role, conn.tx.clone());
        let participants = self
            .registry
            .add_participant(resource_id, participant)
            .await?;

        if let Some(joined) = participants
            .iter()
            .find(|p| p.connection_id == conn.connection_id)
        {
            let frame = Event::ParticipantJoined(joined.clone()).to_frame(resource_id);
            self.registry
                .broadcast(resource_id, &frame, Some(conn.connection_id))
                .await;
        }

        Ok(Event::ParticipantList { participants, content: resource.content })
    }

    /// Record a cursor move and relay it to peers. Unknown connections are ignored.
    pub async fn cursor_move(&self, resource_id: Uuid, connection_id: Uuid, cursor: Cursor) {
        let Some(participant) = self
            .registry
            .update_cursor(resource_id, connection_id, cursor)
            .await
        else {
            debug!(%resource_id, %connection_id, "cursor move from non-participant ignored");
            return;
        };

        let frame = Event::CursorUpdate { connection_id, user_id: participant.user_id, cursor }.to_frame(resource_id);
        self.registry
            .broadcast(resource_id, &frame, Some(connection_id))
            .await;
    }

    /// Persist a content patch and relay it to peers.
    ///
    /// # Errors
    ///
    /// `NotJoined`, `Unauthorized` for viewers or removed collaborators, or
    /// `Persistence`/`WriteTimeout` if the store write fails or hangs
    /// (nothing is broadcast).
    pub async fn content_update(
        &self,
        resource_id: Uuid,
        connection_id: Uuid,
        patch: Map<String, Value>,
    ) -> Result<(), CollabError> {
        let participant = self.joined(resource_id, connection_id).await?;
        self.gate
            .require(resource_id, participant.user_id, Permission::Edit)
            .await?;

        self.bounded_write(self.store.apply_content_update(resource_id, &patch))
            .await?;

        let event = Event::ContentPatched {
            patch,
            user_id: participant.user_id,
            display_name: participant.display_name,
            timestamp: now_ms(),
        };
        let delivered = self
            .registry
            .broadcast(resource_id, &event.to_frame(resource_id), Some(connection_id))
            .await;
        info!(%resource_id, %connection_id, delivered, "content patched");
        Ok(())
    }

    /// Relay a chat line, appending it to the message log first when the
    /// resource keeps one.
    ///
    /// # Errors
    ///
    /// `NotJoined`, `Unauthorized` if membership was revoked, or
    /// `Persistence`/`WriteTimeout` if the log append fails or hangs.
    pub async fn chat_message(
        &self,
        resource_id: Uuid,
        connection_id: Uuid,
        text: &str,
    ) -> Result<ChatMessage, CollabError> {
        let participant = self.joined(resource_id, connection_id).await?;
        let (resource, _) = self
            .gate
            .authorize(resource_id, participant.user_id, Permission::View)
            .await?;

        let message = ChatMessage {
            sender_id: participant.user_id,
            sender_name: participant.display_name,
            text: text.to_owned(),
            timestamp: now_ms(),
        };

        if resource.kind.has_message_log() {
            let entry = LogEntry::Chat(message.clone());
            self.bounded_write(self.store.append_message(resource_id, &entry))
                .await?;
        }

        let frame = Event::ChatMessage(message.clone()).to_frame(resource_id);
        self.registry
            .broadcast(resource_id, &frame, Some(connection_id))
            .await;
        Ok(message)
    }

    /// Remove one connection from one session and tell the rest.
    /// Returns whether the connection was a participant.
    pub async fn leave(&self, resource_id: Uuid, connection_id: Uuid) -> bool {
        let Some(participant) = self
            .registry
            .remove_participant(resource_id, connection_id)
            .await
        else {
            return false;
        };

        let frame = Event::ParticipantLeft(participant).to_frame(resource_id);
        self.registry.broadcast(resource_id, &frame, None).await;
        self.registry.maybe_garbage_collect(resource_id).await;
        true
    }

    /// Remove a closed connection from every session it joined.
    /// Returns the number of sessions it was removed from.
    pub async fn disconnect(&self, connection_id: Uuid) -> usize {
        let mut left = 0;
        for resource_id in self.registry.resources_for(connection_id).await {
            if self.leave(resource_id, connection_id).await {
                left += 1;
            }
        }
        left
    }

    /// Push a system notice to everyone in the live session, if any.
    pub async fn notify(&self, resource_id: Uuid, notice: SystemNotice) -> usize {
        let frame = Event::SystemNotice(notice).to_frame(resource_id);
        self.registry.broadcast(resource_id, &frame, None).await
    }

    /// Run a store write under the gate's store timeout.
    async fn bounded_write(&self, write: impl Future<Output = Result<(), StoreError>>) -> Result<(), CollabError> {
        let limit = self.gate.store_timeout();
        match tokio::time::timeout(limit, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CollabError::WriteTimeout(limit)),
        }
    }

    async fn joined(&self, resource_id: Uuid, connection_id: Uuid) -> Result<ParticipantView, CollabError> {
        self.registry
            .participant(resource_id, connection_id)
            .await
            .ok_or(CollabError::NotJoined(resource_id))
    }
}

#[cfg(test)]
#[path = "broadcast_test.rs"]
mod tests;
