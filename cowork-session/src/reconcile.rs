//! Client-side mirror of session state.
//!
//! [`ClientStore`] is purely reactive: presence, chat, typing and whiteboard
//! state change only through [`ClientStore::apply`] with an event the server
//! broadcast. The one thing it originates is `code:update` for local edits,
//! and it suppresses those when the edit is the editor replaying a change
//! that arrived from the network.
//!
//! ```text
//!   Disconnected ──connect──► Connected ◄──reconnected── Reconnecting
//!        │                        │                          ▲
//!        │                        └────── transport drop ────┘
//!        └──────────────── any ──fatal──► Error
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::history::{ChatMessage, Stroke};
use crate::presence::Participant;
use crate::protocol::{ClientEvent, ConnectionId, RejectReason, RoomId, ServerEvent};

/// Transport health as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Reconnecting { attempt: u32 },
    Connected,
    Error(String),
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: &ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self, next) {
            (_, Error(_)) => true,
            (_, Disconnected) => true,
            (Disconnected, Connected) | (Disconnected, Reconnecting { .. }) => true,
            (Reconnecting { .. }, Reconnecting { .. }) | (Reconnecting { .. }, Connected) => true,
            (Connected, Reconnecting { .. }) => true,
            (Error(_), Reconnecting { .. }) => true,
            _ => false,
        }
    }
}

/// Someone typing in the chat panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: ConnectionId,
    pub user_name: String,
}

/// The last join rejection the server reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRejection {
    pub room_id: RoomId,
    pub reason: RejectReason,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct OpenFile {
    content: String,
    /// Set when the content was replaced from the network; the editor's next
    /// change callback for this file is that replacement, not a user edit.
    remote_pending: bool,
}

/// Client-local session state.
#[derive(Debug, Clone)]
pub struct ClientStore {
    status: ConnectionStatus,
    room_id: Option<RoomId>,
    participants: Vec<Participant>,
    messages: Vec<ChatMessage>,
    typing: Vec<TypingUser>,
    strokes: Vec<Stroke>,
    open_files: HashMap<String, OpenFile>,
    file_changes: Vec<(String, String)>,
    last_rejection: Option<JoinRejection>,
}

impl Default for ClientStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientStore {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            room_id: None,
            participants: Vec::new(),
            messages: Vec::new(),
            typing: Vec::new(),
            strokes: Vec::new(),
            open_files: HashMap::new(),
            file_changes: Vec::new(),
            last_rejection: None,
        }
    }

    // ─── Connection ─────────────────────────────────────────────

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// Move to `next`. Illegal transitions are ignored and return false.
    pub fn set_status(&mut self, next: ConnectionStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(&next) {
            log::warn!("Ignoring status change {:?} -> {:?}", self.status, next);
            return false;
        }
        // A dropped transport means the server forgot our membership.
        if !next.is_connected() {
            self.participants.clear();
            self.typing.clear();
        }
        self.status = next;
        true
    }

    // ─── Room ───────────────────────────────────────────────────

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    /// Record the room the user is entering. State of any previous room is dropped.
    pub fn enter_room(&mut self, room_id: impl Into<RoomId>) {
        let room_id = room_id.into();
        if self.room_id.as_deref() != Some(room_id.as_str()) {
            self.reset_room_state();
        }
        self.room_id = Some(room_id);
        self.last_rejection = None;
    }

    pub fn exit_room(&mut self) {
        self.room_id = None;
        self.reset_room_state();
    }

    fn reset_room_state(&mut self) {
        self.participants.clear();
        self.messages.clear();
        self.typing.clear();
        self.strokes.clear();
        self.file_changes.clear();
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant(&self, id: ConnectionId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn typing(&self) -> &[TypingUser] {
        &self.typing
    }

    pub fn strokes(&self) -> &[Stroke] {
        &self.strokes
    }

    /// File operations other participants reported, oldest first.
    pub fn file_changes(&self) -> &[(String, String)] {
        &self.file_changes
    }

    pub fn last_rejection(&self) -> Option<&JoinRejection> {
        self.last_rejection.as_ref()
    }

    // ─── Server events ──────────────────────────────────────────

    /// Fold one server event into the mirror.
    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::RoomParticipants { room_id, participants } => {
                if self.room_id.is_none() {
                    self.room_id = Some(room_id.clone());
                }
                self.participants = participants.clone();
            }
            ServerEvent::ParticipantJoined { participant, .. } => {
                self.upsert_participant(participant.clone());
            }
            ServerEvent::ParticipantLeft { participant_id, .. } => {
                self.participants.retain(|p| p.id != *participant_id);
                self.typing.retain(|t| t.user_id != *participant_id);
            }
            ServerEvent::RoomError { room_id, reason, message } => {
                log::warn!("Join of {room_id} refused: {message}");
                if self.room_id.as_deref() == Some(room_id.as_str()) {
                    self.room_id = None;
                    self.reset_room_state();
                }
                self.last_rejection = Some(JoinRejection {
                    room_id: room_id.clone(),
                    reason: *reason,
                    message: message.clone(),
                });
            }
            ServerEvent::CursorUpdate { participant_id, position, file_path, .. } => {
                if let Some(p) = self.participant_mut(*participant_id) {
                    p.cursor = Some(*position);
                    if let Some(path) = file_path.as_ref().filter(|f| !f.is_empty()) {
                        p.current_file = Some(path.clone());
                    }
                }
            }
            ServerEvent::SelectionUpdate { participant_id, selection, file_path, .. } => {
                if let Some(p) = self.participant_mut(*participant_id) {
                    p.selection = *selection;
                    if let Some(path) = file_path.as_ref().filter(|f| !f.is_empty()) {
                        p.current_file = Some(path.clone());
                    }
                }
            }
            ServerEvent::ParticipantFileChange { participant_id, file_path } => {
                if let Some(p) = self.participant_mut(*participant_id) {
                    p.current_file = Some(file_path.clone());
                }
            }
            ServerEvent::ChatMessage(message) => {
                self.typing.retain(|t| t.user_id != message.user_id);
                self.messages.push(message.clone());
            }
            ServerEvent::ChatHistory(history) => {
                self.messages = history.clone();
            }
            ServerEvent::ChatTyping { user_id, user_name, is_typing } => {
                self.typing.retain(|t| t.user_id != *user_id);
                if *is_typing {
                    self.typing.push(TypingUser {
                        user_id: *user_id,
                        user_name: user_name.clone(),
                    });
                }
            }
            ServerEvent::WhiteboardDraw(stroke) => self.strokes.push(stroke.clone()),
            ServerEvent::WhiteboardHistory(strokes) => self.strokes = strokes.clone(),
            ServerEvent::WhiteboardClear => self.strokes.clear(),
            ServerEvent::WhiteboardUndo => {
                self.strokes.pop();
            }
            ServerEvent::CodeUpdate { file_path, content, .. } => {
                self.apply_remote_content(file_path, content);
            }
            ServerEvent::FileChange { file_path, operation, .. } => {
                self.file_changes.push((file_path.clone(), operation.clone()));
            }
            // Transient or handled by the transport layer.
            ServerEvent::WhiteboardCursor { .. }
            | ServerEvent::ProjectSyncRequest { .. }
            | ServerEvent::ProjectSyncData { .. } => {}
        }
    }

    fn upsert_participant(&mut self, participant: Participant) {
        match self.participants.iter_mut().find(|p| p.id == participant.id) {
            Some(existing) => *existing = participant,
            None => self.participants.push(participant),
        }
    }

    fn participant_mut(&mut self, id: ConnectionId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.id == id)
    }

    // ─── Open files and echo suppression ────────────────────────

    /// Track a file the editor opened with its current contents.
    pub fn open_file(&mut self, path: &str, content: impl Into<String>) {
        self.open_files.insert(
            path.to_string(),
            OpenFile {
                content: content.into(),
                remote_pending: false,
            },
        );
    }

    pub fn close_file(&mut self, path: &str) {
        self.open_files.remove(path);
    }

    pub fn file_content(&self, path: &str) -> Option<&str> {
        self.open_files.get(path).map(|f| f.content.as_str())
    }

    /// Whether the next change callback for `path` is a network replay.
    pub fn is_remote_pending(&self, path: &str) -> bool {
        self.open_files.get(path).is_some_and(|f| f.remote_pending)
    }

    fn apply_remote_content(&mut self, path: &str, content: &str) {
        // Updates for files we do not have open are not ours to track.
        if let Some(file) = self.open_files.get_mut(path) {
            if file.content != content {
                file.content = content.to_string();
                file.remote_pending = true;
            }
        }
    }

    /// Report an editor change. Returns the event to send, or `None` when the
    /// change is the echo of a remote update or changes nothing.
    pub fn local_edit(&mut self, path: &str, content: &str) -> Option<ClientEvent> {
        let room_id = self.room_id.clone()?;
        let file = self.open_files.entry(path.to_string()).or_default();

        if file.remote_pending {
            file.remote_pending = false;
            if file.content == content {
                log::trace!("Suppressing echo of remote update to {path}");
                return None;
            }
        }
        if file.content == content {
            return None;
        }
        file.content = content.to_string();

        Some(ClientEvent::CodeUpdate {
            room_id,
            file_path: path.to_string(),
            content: content.to_string(),
        })
    }

    /// Distinct files other participants are viewing, with who is in each.
    pub fn viewers(&self) -> BTreeMap<String, Vec<ConnectionId>> {
        let mut out: BTreeMap<String, Vec<ConnectionId>> = BTreeMap::new();
        for p in &self.participants {
            if let Some(file) = &p.current_file {
                out.entry(file.clone()).or_default().push(p.id);
            }
        }
        out
    }

    /// Names shown in the typing indicator, deduplicated.
    pub fn typing_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.typing
            .iter()
            .filter(|t| seen.insert(t.user_name.as_str()))
            .map(|t| t.user_name.as_str())
            .collect()
    }
}
