//! Typed event catalog for the session wire protocol.
//!
//! Every frame is a JSON text message:
//! ```text
//! { "event": "chat:message", "data": { "roomId": "AB12CD", "message": "hi", "userName": "Ada" } }
//! ```
//!
//! The catalog is closed: [`ClientEvent`] covers everything a client may send,
//! [`ServerEvent`] everything the server may emit. Unknown event names and
//! payloads of the wrong shape fail to decode and are dropped by the caller.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use uuid::Uuid;

use crate::history::{ChatMessage, Stroke, StrokeInput};
use crate::presence::Participant;
use crate::snapshot::SnapshotTree;

/// Longest accepted room id.
pub const MAX_ROOM_ID_LEN: usize = 64;

/// Longest accepted chat message, in characters.
pub const MAX_CHAT_LEN: usize = 2000;

/// Room identifier as sent by clients. Durable lookups use its uppercase form.
pub type RoomId = String;

/// Transport-assigned identity of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Editor caret position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

/// Editor selection range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRange {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

/// Why a join was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    CapacityExceeded,
    NotFound,
}

/// Audience class of a server event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Rest of the room; never echoed to the origin.
    ExcludeSender,
    /// Whole room including the origin.
    IncludeSender,
    /// Exactly one connection.
    Direct,
}

/// Events a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    #[serde(rename = "room:join")]
    RoomJoin {
        room_id: RoomId,
        user_name: Option<String>,
    },
    #[serde(rename = "room:leave")]
    RoomLeave { room_id: RoomId },
    #[serde(rename = "cursor:update")]
    CursorUpdate {
        room_id: RoomId,
        position: CursorPosition,
        file_path: Option<String>,
    },
    #[serde(rename = "selection:update")]
    SelectionUpdate {
        room_id: RoomId,
        selection: Option<SelectionRange>,
        file_path: Option<String>,
    },
    #[serde(rename = "chat:message")]
    ChatMessage {
        room_id: RoomId,
        message: String,
        user_name: Option<String>,
    },
    #[serde(rename = "chat:get-history")]
    ChatGetHistory { room_id: RoomId },
    #[serde(rename = "chat:typing")]
    ChatTyping {
        room_id: RoomId,
        user_name: Option<String>,
        is_typing: bool,
    },
    #[serde(rename = "whiteboard:draw")]
    WhiteboardDraw { room_id: RoomId, stroke: StrokeInput },
    #[serde(rename = "whiteboard:clear")]
    WhiteboardClear { room_id: RoomId },
    #[serde(rename = "whiteboard:get-history")]
    WhiteboardGetHistory { room_id: RoomId },
    #[serde(rename = "whiteboard:undo")]
    WhiteboardUndo { room_id: RoomId },
    #[serde(rename = "whiteboard:cursor")]
    WhiteboardCursor { room_id: RoomId, x: f64, y: f64 },
    #[serde(rename = "code:update")]
    CodeUpdate {
        room_id: RoomId,
        file_path: String,
        content: String,
    },
    #[serde(rename = "file:change")]
    FileChange {
        room_id: RoomId,
        file_path: String,
        operation: String,
    },
    #[serde(rename = "participant:file_change")]
    ParticipantFileChange { room_id: RoomId, file_path: String },
    #[serde(rename = "project:sync:request")]
    ProjectSyncRequest { room_id: RoomId },
    #[serde(rename = "project:sync:data")]
    ProjectSyncData {
        room_id: RoomId,
        target_id: ConnectionId,
        files: SnapshotTree,
    },
}

impl ClientEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoomJoin { .. } => "room:join",
            Self::RoomLeave { .. } => "room:leave",
            Self::CursorUpdate { .. } => "cursor:update",
            Self::SelectionUpdate { .. } => "selection:update",
            Self::ChatMessage { .. } => "chat:message",
            Self::ChatGetHistory { .. } => "chat:get-history",
            Self::ChatTyping { .. } => "chat:typing",
            Self::WhiteboardDraw { .. } => "whiteboard:draw",
            Self::WhiteboardClear { .. } => "whiteboard:clear",
            Self::WhiteboardGetHistory { .. } => "whiteboard:get-history",
            Self::WhiteboardUndo { .. } => "whiteboard:undo",
            Self::WhiteboardCursor { .. } => "whiteboard:cursor",
            Self::CodeUpdate { .. } => "code:update",
            Self::FileChange { .. } => "file:change",
            Self::ParticipantFileChange { .. } => "participant:file_change",
            Self::ProjectSyncRequest { .. } => "project:sync:request",
            Self::ProjectSyncData { .. } => "project:sync:data",
        }
    }

    /// Room the event is addressed to.
    pub fn room_id(&self) -> &str {
        match self {
            Self::RoomJoin { room_id, .. }
            | Self::RoomLeave { room_id }
            | Self::CursorUpdate { room_id, .. }
            | Self::SelectionUpdate { room_id, .. }
            | Self::ChatMessage { room_id, .. }
            | Self::ChatGetHistory { room_id }
            | Self::ChatTyping { room_id, .. }
            | Self::WhiteboardDraw { room_id, .. }
            | Self::WhiteboardClear { room_id }
            | Self::WhiteboardGetHistory { room_id }
            | Self::WhiteboardUndo { room_id }
            | Self::WhiteboardCursor { room_id, .. }
            | Self::CodeUpdate { room_id, .. }
            | Self::FileChange { room_id, .. }
            | Self::ParticipantFileChange { room_id, .. }
            | Self::ProjectSyncRequest { room_id }
            | Self::ProjectSyncData { room_id, .. } => room_id,
        }
    }

    /// Structural checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let room_id = self.room_id();
        if room_id.trim().is_empty() || room_id.chars().count() > MAX_ROOM_ID_LEN {
            return Err(ProtocolError::invalid(
                "roomId",
                format!("must be 1..={MAX_ROOM_ID_LEN} characters"),
            ));
        }

        match self {
            Self::ChatMessage { message, .. } => {
                let len = message.chars().count();
                if len == 0 || len > MAX_CHAT_LEN {
                    return Err(ProtocolError::invalid(
                        "message",
                        format!("must be 1..={MAX_CHAT_LEN} characters, got {len}"),
                    ));
                }
            }
            Self::WhiteboardDraw { stroke, .. } => {
                if stroke.points.is_empty() {
                    return Err(ProtocolError::invalid("stroke.points", "stroke has no points"));
                }
            }
            Self::WhiteboardCursor { x, y, .. } => {
                if !x.is_finite() || !y.is_finite() {
                    return Err(ProtocolError::invalid("x/y", "coordinates must be finite"));
                }
            }
            Self::CodeUpdate { file_path, .. }
            | Self::FileChange { file_path, .. }
            | Self::ParticipantFileChange { file_path, .. } => {
                if file_path.is_empty() {
                    return Err(ProtocolError::invalid("filePath", "must not be empty"));
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode and validate a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let event: Self =
            serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }
}

/// Events the server emits to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "room:participants")]
    RoomParticipants {
        room_id: RoomId,
        participants: Vec<Participant>,
    },
    #[serde(rename = "room:participant-joined")]
    ParticipantJoined {
        participant: Participant,
        participant_count: usize,
    },
    #[serde(rename = "room:participant-left")]
    ParticipantLeft {
        participant_id: ConnectionId,
        participant_count: usize,
    },
    #[serde(rename = "room:error")]
    RoomError {
        room_id: RoomId,
        reason: RejectReason,
        message: String,
    },
    #[serde(rename = "cursor:update")]
    CursorUpdate {
        participant_id: ConnectionId,
        position: CursorPosition,
        file_path: Option<String>,
        color: String,
        name: String,
    },
    #[serde(rename = "selection:update")]
    SelectionUpdate {
        participant_id: ConnectionId,
        selection: Option<SelectionRange>,
        file_path: Option<String>,
        color: String,
    },
    #[serde(rename = "chat:message")]
    ChatMessage(ChatMessage),
    #[serde(rename = "chat:history")]
    ChatHistory(Vec<ChatMessage>),
    #[serde(rename = "chat:typing")]
    ChatTyping {
        user_id: ConnectionId,
        user_name: String,
        is_typing: bool,
    },
    #[serde(rename = "whiteboard:draw")]
    WhiteboardDraw(Stroke),
    #[serde(rename = "whiteboard:clear")]
    WhiteboardClear,
    #[serde(rename = "whiteboard:history")]
    WhiteboardHistory(Vec<Stroke>),
    #[serde(rename = "whiteboard:undo")]
    WhiteboardUndo,
    #[serde(rename = "whiteboard:cursor")]
    WhiteboardCursor {
        participant_id: ConnectionId,
        x: f64,
        y: f64,
    },
    #[serde(rename = "code:update")]
    CodeUpdate {
        file_path: String,
        content: String,
        user_id: ConnectionId,
    },
    #[serde(rename = "file:change")]
    FileChange {
        file_path: String,
        operation: String,
        user_id: ConnectionId,
    },
    #[serde(rename = "participant:file_change")]
    ParticipantFileChange {
        participant_id: ConnectionId,
        file_path: String,
    },
    #[serde(rename = "project:sync:request")]
    ProjectSyncRequest { requester_id: ConnectionId },
    #[serde(rename = "project:sync:data")]
    ProjectSyncData { files: SnapshotTree },
}

impl ServerEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoomParticipants { .. } => "room:participants",
            Self::ParticipantJoined { .. } => "room:participant-joined",
            Self::ParticipantLeft { .. } => "room:participant-left",
            Self::RoomError { .. } => "room:error",
            Self::CursorUpdate { .. } => "cursor:update",
            Self::SelectionUpdate { .. } => "selection:update",
            Self::ChatMessage(_) => "chat:message",
            Self::ChatHistory(_) => "chat:history",
            Self::ChatTyping { .. } => "chat:typing",
            Self::WhiteboardDraw(_) => "whiteboard:draw",
            Self::WhiteboardClear => "whiteboard:clear",
            Self::WhiteboardHistory(_) => "whiteboard:history",
            Self::WhiteboardUndo => "whiteboard:undo",
            Self::WhiteboardCursor { .. } => "whiteboard:cursor",
            Self::CodeUpdate { .. } => "code:update",
            Self::FileChange { .. } => "file:change",
            Self::ParticipantFileChange { .. } => "participant:file_change",
            Self::ProjectSyncRequest { .. } => "project:sync:request",
            Self::ProjectSyncData { .. } => "project:sync:data",
        }
    }

    /// Audience class. Deltas skip the origin; canonical confirmations
    /// (chat, membership, whiteboard clear/undo) reach it too.
    pub fn delivery(&self) -> Delivery {
        match self {
            Self::CursorUpdate { .. }
            | Self::SelectionUpdate { .. }
            | Self::ChatTyping { .. }
            | Self::WhiteboardDraw(_)
            | Self::WhiteboardCursor { .. }
            | Self::CodeUpdate { .. }
            | Self::FileChange { .. }
            | Self::ParticipantFileChange { .. }
            | Self::ProjectSyncRequest { .. } => Delivery::ExcludeSender,

            Self::ParticipantJoined { .. }
            | Self::ParticipantLeft { .. }
            | Self::ChatMessage(_)
            | Self::WhiteboardClear
            | Self::WhiteboardUndo => Delivery::IncludeSender,

            Self::RoomParticipants { .. }
            | Self::RoomError { .. }
            | Self::ChatHistory(_)
            | Self::WhiteboardHistory(_)
            | Self::ProjectSyncData { .. } => Delivery::Direct,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Milliseconds since the Unix epoch.
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Protocol errors. All of them are dropped at the dispatch boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Malformed event: {0}")]
    Decode(String),
    #[error("Invalid field '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("Unsupported frame type")]
    UnsupportedFrame,
    #[error("Connection closed")]
    ConnectionClosed,
}

impl ProtocolError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
