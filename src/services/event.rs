//! Outbound room events and their frame encoding.
//!
//! Each variant maps to one syscall. System notices and user chat are
//! separate variants and encode with distinct `type` tags, so a client
//! never has to guess whether a line was authored by a person.

use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::services::registry::{Cursor, ParticipantView};
use crate::services::store::{ChatMessage, SystemNotice};

pub const PARTICIPANT_JOINED: &str = "participant:joined";
pub const PARTICIPANT_LEFT: &str = "participant:left";
pub const CURSOR_UPDATE: &str = "cursor:update";
pub const CONTENT_PATCHED: &str = "content:patched";
pub const CHAT_MESSAGE: &str = "chat:message";
pub const SYSTEM_NOTICE: &str = "system:notice";

#[derive(Debug, Clone)]
pub enum Event {
    /// Join reply: roster including the joiner, plus current content.
    ParticipantList { participants: Vec<ParticipantView>, content: Value },
    ParticipantJoined(ParticipantView),
    ParticipantLeft(ParticipantView),
    CursorUpdate { connection_id: Uuid, user_id: Uuid, cursor: Cursor },
    ContentPatched { patch: Map<String, Value>, user_id: Uuid, display_name: String, timestamp: i64 },
    ChatMessage(ChatMessage),
    SystemNotice(SystemNotice),
}

impl Event {
    #[must_use]
    pub fn syscall(&self) -> &'static str {
        match self {
            Self::ParticipantList { .. } => "session:join",
            Self::ParticipantJoined(_) => PARTICIPANT_JOINED,
            Self::ParticipantLeft(_) => PARTICIPANT_LEFT,
            Self::CursorUpdate { .. } => CURSOR_UPDATE,
            Self::ContentPatched { .. } => CONTENT_PATCHED,
            Self::ChatMessage(_) => CHAT_MESSAGE,
            Self::SystemNotice(_) => SYSTEM_NOTICE,
        }
    }

    #[must_use]
    pub fn data(&self) -> Data {
        let mut data = Data::new();
        match self {
            Self::ParticipantList { participants, content } => {
                data.insert("participants".into(), serde_json::to_value(participants).unwrap_or_default());
                data.insert("content".into(), content.clone());
            }
            Self::ParticipantJoined(p) => {
                data.insert("connection_id".into(), json!(p.connection_id));
                data.insert("user_id".into(), json!(p.user_id));
                data.insert("display_name".into(), json!(p.display_name));
                data.insert("role".into(), json!(p.role));
            }
            Self::ParticipantLeft(p) => {
                data.insert("connection_id".into(), json!(p.connection_id));
                data.insert("user_id".into(), json!(p.user_id));
                data.insert("display_name".into(), json!(p.display_name));
            }
            Self::CursorUpdate { connection_id, user_id, cursor } => {
                data.insert("connection_id".into(), json!(connection_id));
                data.insert("user_id".into(), json!(user_id));
                data.insert("x".into(), json!(cursor.x));
                data.insert("y".into(), json!(cursor.y));
            }
            Self::ContentPatched { patch, user_id, display_name, timestamp } => {
                data.insert("patch".into(), Value::Object(patch.clone()));
                data.insert("user_id".into(), json!(user_id));
                data.insert("display_name".into(), json!(display_name));
                data.insert("timestamp".into(), json!(timestamp));
            }
            Self::ChatMessage(msg) => {
                data.insert("sender_id".into(), json!(msg.sender_id));
                data.insert("sender_name".into(), json!(msg.sender_name));
                data.insert("text".into(), json!(msg.text));
                data.insert("type".into(), json!("chat"));
                data.insert("timestamp".into(), json!(msg.timestamp));
            }
            Self::SystemNotice(notice) => {
                data.insert("text".into(), json!(notice.text));
                data.insert("type".into(), json!("notice"));
                data.insert("timestamp".into(), json!(notice.timestamp));
            }
        }
        data
    }

    /// Encode as a server-pushed request frame addressed to `resource_id`.
    #[must_use]
    pub fn to_frame(&self, resource_id: Uuid) -> Frame {
        Frame::request(self.syscall(), self.data()).with_resource_id(resource_id)
    }
}
