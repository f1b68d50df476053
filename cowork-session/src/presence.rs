//! Session registry: who is in which room, and how each room is backed.
//!
//! ## Architecture
//!
//! ```text
//! room:join ──► SessionHub ──► durable lookup (RoomState) ──► SessionRegistry::join()
//!                                                                   │
//!                      rooms: RoomId ──► LiveRoom { state, participants (join order) }
//!                      memberships: ConnectionId ──► [RoomId]
//!                                                                   │
//! transport drop ──► SessionRegistry::disconnect() ── enumerates memberships first,
//!                                                     then leaves every room
//! ```
//!
//! The registry is plain owned data. It is injected into the hub that owns it,
//! so tests can build as many independent registries as they like.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::protocol::{timestamp_millis, ConnectionId, CursorPosition, RoomId, SelectionRange};

/// Participant colors, handed out least-used first.
pub const PALETTE: [&str; 7] = [
    "#3b82f6", "#8b5cf6", "#ec4899", "#10b981", "#f59e0b", "#ef4444", "#06b6d4",
];

/// Participant cap applied to rooms without a durable record.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 10;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// A live member of a room. One per (connection, room).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ConnectionId,
    pub name: String,
    pub color: String,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<SelectionRange>,
    pub current_file: Option<String>,
    pub joined_at: u64,
}

/// Who is joining: the transport connection plus a display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: ConnectionId,
    pub name: Option<String>,
}

impl Identity {
    pub fn new(id: ConnectionId, name: Option<String>) -> Self {
        Self { id, name }
    }
}

/// Durable room record a live room is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomHandle {
    /// Uppercase room code used as the durable key.
    pub code: String,
    pub max_participants: usize,
}

/// How a live room's history is backed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomState {
    /// No durable record; history lives in the in-memory fallback.
    Ephemeral,
    /// Bound to a durable record.
    Persisted(RoomHandle),
}

impl RoomState {
    pub fn is_persisted(&self) -> bool {
        matches!(self, Self::Persisted(_))
    }

    pub fn handle(&self) -> Option<&RoomHandle> {
        match self {
            Self::Persisted(handle) => Some(handle),
            Self::Ephemeral => None,
        }
    }
}

/// Join failures. Both are reported to the joiner as `room:error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("Room {room_id} is full ({max} participants)")]
    CapacityExceeded { room_id: RoomId, max: usize },
    #[error("Room {0} not found")]
    NotFound(RoomId),
}

/// Result of removing one participant from one room.
#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    pub room_id: RoomId,
    pub participant: Participant,
    /// Members left behind after the removal.
    pub remaining: Vec<ConnectionId>,
    /// Set when the room became empty and was deleted.
    pub closed: Option<RoomState>,
}

#[derive(Debug)]
struct LiveRoom {
    state: RoomState,
    participants: Vec<Participant>,
}

impl LiveRoom {
    fn max_participants(&self, default_max: usize) -> usize {
        match &self.state {
            RoomState::Persisted(handle) => handle.max_participants,
            RoomState::Ephemeral => default_max,
        }
    }

    fn position(&self, id: ConnectionId) -> Option<usize> {
        self.participants.iter().position(|p| p.id == id)
    }
}

// ───────────────────────────────────────────────────────────────────
// SessionRegistry
// ───────────────────────────────────────────────────────────────────

/// Room membership and participant presence.
#[derive(Debug)]
pub struct SessionRegistry {
    rooms: HashMap<RoomId, LiveRoom>,
    memberships: HashMap<ConnectionId, Vec<RoomId>>,
    default_max_participants: usize,
    joined_total: u64,
}

impl SessionRegistry {
    pub fn new(default_max_participants: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            memberships: HashMap::new(),
            default_max_participants,
            joined_total: 0,
        }
    }

    /// Add a participant to a room, creating the room with `state` if needed.
    ///
    /// Joining a room the connection is already in returns the existing
    /// participant unchanged. The room's state is fixed at creation, so a
    /// `state` passed for an existing room is ignored.
    pub fn join(
        &mut self,
        room_id: &str,
        identity: Identity,
        state: RoomState,
    ) -> Result<Participant, JoinError> {
        let default_max = self.default_max_participants;
        let room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                log::debug!("Creating room {} ({:?})", room_id, state);
                LiveRoom {
                    state,
                    participants: Vec::new(),
                }
            });

        if let Some(idx) = room.position(identity.id) {
            return Ok(room.participants[idx].clone());
        }

        let max = room.max_participants(default_max);
        if room.participants.len() >= max {
            let empty = room.participants.is_empty();
            if empty {
                self.rooms.remove(room_id);
            }
            return Err(JoinError::CapacityExceeded {
                room_id: room_id.to_string(),
                max,
            });
        }

        self.joined_total += 1;
        let name = identity
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("User {}", self.joined_total));

        let participant = Participant {
            id: identity.id,
            name,
            color: pick_color(&room.participants, &mut rand::thread_rng()),
            cursor: None,
            selection: None,
            current_file: None,
            joined_at: timestamp_millis(),
        };
        room.participants.push(participant.clone());

        self.memberships
            .entry(identity.id)
            .or_default()
            .push(room_id.to_string());

        log::info!(
            "{} ({}) joined room {} [{} participants]",
            participant.name,
            participant.id,
            room_id,
            room.participants.len()
        );
        Ok(participant)
    }

    /// Remove a participant from one room. Deletes the room when it empties.
    pub fn leave(&mut self, id: ConnectionId, room_id: &str) -> Option<Departure> {
        let room = self.rooms.get_mut(room_id)?;
        let idx = room.position(id)?;
        let participant = room.participants.remove(idx);
        let remaining: Vec<ConnectionId> = room.participants.iter().map(|p| p.id).collect();

        if let Some(rooms) = self.memberships.get_mut(&id) {
            rooms.retain(|r| r != room_id);
            if rooms.is_empty() {
                self.memberships.remove(&id);
            }
        }

        let closed = if remaining.is_empty() {
            self.rooms.remove(room_id).map(|room| {
                log::debug!("Room {} is empty, removing", room_id);
                room.state
            })
        } else {
            None
        };

        log::info!("{} left room {} [{} remaining]", id, room_id, remaining.len());
        Some(Departure {
            room_id: room_id.to_string(),
            participant,
            remaining,
            closed,
        })
    }

    /// Remove a connection from every room it belongs to.
    pub fn disconnect(&mut self, id: ConnectionId) -> Vec<Departure> {
        let rooms = self.memberships.get(&id).cloned().unwrap_or_default();
        rooms
            .iter()
            .filter_map(|room_id| self.leave(id, room_id))
            .collect()
    }

    /// Participants of a room in join order. Empty for unknown rooms.
    pub fn list(&self, room_id: &str) -> Vec<Participant> {
        self.rooms
            .get(room_id)
            .map(|room| room.participants.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, room_id: &str, id: ConnectionId) -> Option<&Participant> {
        self.rooms
            .get(room_id)
            .and_then(|room| room.participants.iter().find(|p| p.id == id))
    }

    pub fn members(&self, room_id: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room_id)
            .map(|room| room.participants.iter().map(|p| p.id).collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, room_id: &str, id: ConnectionId) -> bool {
        self.get(room_id, id).is_some()
    }

    pub fn room_state(&self, room_id: &str) -> Option<&RoomState> {
        self.rooms.get(room_id).map(|room| &room.state)
    }

    pub fn rooms_of(&self, id: ConnectionId) -> &[RoomId] {
        self.memberships.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn participant_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, |room| room.participants.len())
    }

    // ─── Presence updates ──────────────────────────────────────────

    pub fn update_cursor(
        &mut self,
        room_id: &str,
        id: ConnectionId,
        position: CursorPosition,
        file_path: Option<&str>,
    ) -> Option<&Participant> {
        let participant = self.participant_mut(room_id, id)?;
        participant.cursor = Some(position);
        if let Some(path) = file_path {
            participant.current_file = Some(path.to_string());
        }
        Some(participant)
    }

    pub fn update_selection(
        &mut self,
        room_id: &str,
        id: ConnectionId,
        selection: Option<SelectionRange>,
    ) -> Option<&Participant> {
        let participant = self.participant_mut(room_id, id)?;
        participant.selection = selection;
        Some(participant)
    }

    pub fn set_current_file(
        &mut self,
        room_id: &str,
        id: ConnectionId,
        file_path: &str,
    ) -> Option<&Participant> {
        let participant = self.participant_mut(room_id, id)?;
        participant.current_file = Some(file_path.to_string());
        Some(participant)
    }

    fn participant_mut(&mut self, room_id: &str, id: ConnectionId) -> Option<&mut Participant> {
        self.rooms
            .get_mut(room_id)?
            .participants
            .iter_mut()
            .find(|p| p.id == id)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PARTICIPANTS)
    }
}

/// Pick a random palette color not used by `existing`, or any palette color
/// once all seven are taken.
fn pick_color<R: Rng>(existing: &[Participant], rng: &mut R) -> String {
    let unused: Vec<&str> = PALETTE
        .iter()
        .copied()
        .filter(|c| !existing.iter().any(|p| p.color == *c))
        .collect();
    let pool: &[&str] = if unused.is_empty() { &PALETTE } else { &unused };
    pool.choose(rng).copied().unwrap_or(PALETTE[0]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> Identity {
        Identity::new(ConnectionId::new(), Some(name.to_string()))
    }

    #[test]
    fn test_join_assigns_distinct_palette_colors() {
        let mut registry = SessionRegistry::default();
        let mut colors = Vec::new();
        for i in 0..PALETTE.len() {
            let p = registry
                .join("r1", identity(&format!("p{i}")), RoomState::Ephemeral)
                .unwrap();
            assert!(PALETTE.contains(&p.color.as_str()));
            colors.push(p.color);
        }
        colors.sort();
        colors.dedup();
        assert_eq!(colors.len(), PALETTE.len());
    }

    #[test]
    fn test_palette_exhaustion_falls_back_to_palette() {
        let mut registry = SessionRegistry::new(20);
        for i in 0..PALETTE.len() + 3 {
            let p = registry
                .join("r1", identity(&format!("p{i}")), RoomState::Ephemeral)
                .unwrap();
            assert!(PALETTE.contains(&p.color.as_str()));
        }
        assert_eq!(registry.participant_count("r1"), PALETTE.len() + 3);
    }

    #[test]
    fn test_list_preserves_join_order() {
        let mut registry = SessionRegistry::default();
        let a = registry.join("r1", identity("a"), RoomState::Ephemeral).unwrap();
        let b = registry.join("r1", identity("b"), RoomState::Ephemeral).unwrap();
        let c = registry.join("r1", identity("c"), RoomState::Ephemeral).unwrap();

        let ids: Vec<_> = registry.list("r1").iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn test_rejoin_does_not_duplicate() {
        let mut registry = SessionRegistry::default();
        let who = identity("ada");
        let first = registry.join("r1", who.clone(), RoomState::Ephemeral).unwrap();
        let second = registry.join("r1", who, RoomState::Ephemeral).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.participant_count("r1"), 1);
        assert_eq!(registry.rooms_of(first.id).len(), 1);
    }

    #[test]
    fn test_default_name_when_missing_or_blank() {
        let mut registry = SessionRegistry::default();
        let p = registry
            .join("r1", Identity::new(ConnectionId::new(), None), RoomState::Ephemeral)
            .unwrap();
        assert_eq!(p.name, "User 1");
        let q = registry
            .join("r1", Identity::new(ConnectionId::new(), Some("  ".into())), RoomState::Ephemeral)
            .unwrap();
        assert_eq!(q.name, "User 2");
    }

    #[test]
    fn test_capacity_enforced_from_room_state() {
        let mut registry = SessionRegistry::default();
        let state = RoomState::Persisted(RoomHandle {
            code: "ABC123".into(),
            max_participants: 2,
        });
        registry.join("ABC123", identity("a"), state.clone()).unwrap();
        registry.join("ABC123", identity("b"), state.clone()).unwrap();

        let err = registry.join("ABC123", identity("c"), state).unwrap_err();
        assert_eq!(
            err,
            JoinError::CapacityExceeded {
                room_id: "ABC123".into(),
                max: 2
            }
        );
        assert_eq!(registry.participant_count("ABC123"), 2);
    }

    #[test]
    fn test_zero_capacity_does_not_leave_empty_room() {
        let mut registry = SessionRegistry::new(0);
        assert!(registry.join("r1", identity("a"), RoomState::Ephemeral).is_err());
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_leave_deletes_empty_room() {
        let mut registry = SessionRegistry::default();
        let a = registry.join("r1", identity("a"), RoomState::Ephemeral).unwrap();
        let b = registry.join("r1", identity("b"), RoomState::Ephemeral).unwrap();

        let departure = registry.leave(a.id, "r1").unwrap();
        assert_eq!(departure.remaining, vec![b.id]);
        assert!(departure.closed.is_none());

        let departure = registry.leave(b.id, "r1").unwrap();
        assert!(departure.remaining.is_empty());
        assert_eq!(departure.closed, Some(RoomState::Ephemeral));
        assert_eq!(registry.room_count(), 0);
        assert!(registry.leave(b.id, "r1").is_none());
    }

    #[test]
    fn test_disconnect_leaves_every_room() {
        let mut registry = SessionRegistry::default();
        let who = identity("ada");
        let other = identity("bob");
        registry.join("r1", who.clone(), RoomState::Ephemeral).unwrap();
        registry.join("r2", who.clone(), RoomState::Ephemeral).unwrap();
        registry.join("r2", other.clone(), RoomState::Ephemeral).unwrap();

        let departures = registry.disconnect(who.id);
        assert_eq!(departures.len(), 2);
        assert!(departures.iter().all(|d| d.participant.id == who.id));
        assert!(registry.rooms_of(who.id).is_empty());
        assert_eq!(registry.list("r2").len(), 1);
        assert_eq!(registry.room_count(), 1);

        // Second disconnect is a no-op.
        assert!(registry.disconnect(who.id).is_empty());
    }

    #[test]
    fn test_room_state_fixed_at_creation() {
        let mut registry = SessionRegistry::default();
        registry.join("r1", identity("a"), RoomState::Ephemeral).unwrap();
        let persisted = RoomState::Persisted(RoomHandle {
            code: "R1".into(),
            max_participants: 5,
        });
        registry.join("r1", identity("b"), persisted).unwrap();
        assert_eq!(registry.room_state("r1"), Some(&RoomState::Ephemeral));
    }

    #[test]
    fn test_presence_updates() {
        let mut registry = SessionRegistry::default();
        let a = registry.join("r1", identity("a"), RoomState::Ephemeral).unwrap();

        let pos = CursorPosition { line: 4, column: 2 };
        let updated = registry.update_cursor("r1", a.id, pos, Some("src/main.rs")).unwrap();
        assert_eq!(updated.cursor, Some(pos));
        assert_eq!(updated.current_file.as_deref(), Some("src/main.rs"));

        registry.set_current_file("r1", a.id, "README.md");
        assert_eq!(
            registry.get("r1", a.id).unwrap().current_file.as_deref(),
            Some("README.md")
        );
        assert!(registry.update_cursor("r2", a.id, pos, None).is_none());
    }
}
