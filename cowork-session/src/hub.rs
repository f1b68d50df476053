//! The session hub: one logical worker that owns all room state.
//!
//! ## Architecture
//!
//! ```text
//! conn task A ──┐
//! conn task B ──┼── HubCommand (mpsc) ──► SessionHub::run()
//! conn task C ──┘                             │
//!                                             ├─ SessionRegistry   (membership, presence)
//!                                             ├─ Broadcaster       (per-connection outboxes)
//!                                             └─ HistoryStore      (durable + fallback)
//! ```
//!
//! Commands are handled one at a time, so registry mutations never interleave.
//! Within a handler the registry is fully updated and the live broadcast is
//! queued before any durable write is awaited: persistence can be slow or
//! fail without holding back delivery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::broadcast::{AtomicBroadcastStats, Broadcaster, Frame};
use crate::history::{ChatMessage, HistoryLimits, HistoryStore, Persistence, Stroke};
use crate::presence::{
    Departure, Identity, JoinError, RoomHandle, RoomState, SessionRegistry, DEFAULT_MAX_PARTICIPANTS,
};
use crate::protocol::{
    timestamp_millis, ClientEvent, ConnectionId, ProtocolError, RejectReason, RoomId, ServerEvent,
};
use crate::storage::DurableStore;

/// Hub behaviour knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Cap for rooms without a durable record.
    pub default_max_participants: usize,
    /// Refuse joins for codes with no durable record (needs a store).
    pub strict_rooms: bool,
    pub limits: HistoryLimits,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            default_max_participants: DEFAULT_MAX_PARTICIPANTS,
            strict_rooms: false,
            limits: HistoryLimits::default(),
        }
    }
}

/// Messages from connection tasks to the hub.
#[derive(Debug)]
pub enum HubCommand {
    Connect {
        id: ConnectionId,
        outbox: mpsc::Sender<Frame>,
    },
    Event {
        id: ConnectionId,
        event: ClientEvent,
    },
    Disconnect {
        id: ConnectionId,
    },
}

/// Why an event was dropped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Invalid(#[from] ProtocolError),
    #[error("{origin} sent {event} to room {room_id} without being a member")]
    NotMember {
        origin: ConnectionId,
        room_id: RoomId,
        event: &'static str,
    },
    #[error("Sync target {target} is not in room {room_id}")]
    UnknownTarget { target: ConnectionId, room_id: RoomId },
}

/// Hub counters, readable from outside the hub task.
#[derive(Debug, Default)]
pub struct AtomicHubStats {
    events_handled: AtomicU64,
    events_rejected: AtomicU64,
    durable_writes: AtomicU64,
    fallback_writes: AtomicU64,
    active_rooms: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub events_handled: u64,
    pub events_rejected: u64,
    pub durable_writes: u64,
    pub fallback_writes: u64,
    pub active_rooms: u64,
}

impl AtomicHubStats {
    pub fn snapshot(&self) -> HubStats {
        HubStats {
            events_handled: self.events_handled.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            durable_writes: self.durable_writes.load(Ordering::Relaxed),
            fallback_writes: self.fallback_writes.load(Ordering::Relaxed),
            active_rooms: self.active_rooms.load(Ordering::Relaxed),
        }
    }

    fn record_write(&self, persistence: Persistence) {
        let counter = match persistence {
            Persistence::Durable => &self.durable_writes,
            Persistence::Fallback => &self.fallback_writes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct SessionHub {
    registry: SessionRegistry,
    broadcaster: Broadcaster,
    history: HistoryStore,
    store: Option<Arc<dyn DurableStore>>,
    config: HubConfig,
    stats: Arc<AtomicHubStats>,
}

impl SessionHub {
    pub fn new(config: HubConfig, store: Option<Arc<dyn DurableStore>>) -> Self {
        Self {
            registry: SessionRegistry::new(config.default_max_participants),
            broadcaster: Broadcaster::new(),
            history: HistoryStore::new(store.clone(), config.limits),
            store,
            config,
            stats: Arc::new(AtomicHubStats::default()),
        }
    }

    pub fn stats_handle(&self) -> Arc<AtomicHubStats> {
        self.stats.clone()
    }

    pub fn broadcast_stats_handle(&self) -> Arc<AtomicBroadcastStats> {
        self.broadcaster.stats_handle()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Process commands until every sender is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<HubCommand>) {
        log::info!("Session hub started");
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        log::info!("Session hub stopped");
    }

    pub async fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connect { id, outbox } => self.connect(id, outbox),
            HubCommand::Event { id, event } => self.dispatch(id, event).await,
            HubCommand::Disconnect { id } => self.disconnect(id).await,
        }
        self.stats
            .active_rooms
            .store(self.registry.room_count() as u64, Ordering::Relaxed);
    }

    pub fn connect(&mut self, id: ConnectionId, outbox: mpsc::Sender<Frame>) {
        log::debug!("Connection {} registered", id);
        self.broadcaster.register(id, outbox);
    }

    /// Leave every room the connection is in, then drop its outbox.
    pub async fn disconnect(&mut self, id: ConnectionId) {
        let departures = self.registry.disconnect(id);
        self.broadcaster.unregister(id);
        log::debug!("Connection {} gone, left {} rooms", id, departures.len());
        for departure in departures {
            self.announce_departure(departure, false).await;
        }
    }

    /// Handle one client event. Rejected events are logged and dropped.
    pub async fn dispatch(&mut self, origin: ConnectionId, event: ClientEvent) {
        let name = event.name();
        match self.route(origin, event).await {
            Ok(()) => {
                self.stats.events_handled.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.events_rejected.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropping {} from {}: {}", name, origin, e);
            }
        }
    }

    async fn route(&mut self, origin: ConnectionId, event: ClientEvent) -> Result<(), DispatchError> {
        event.validate()?;
        log::trace!("{} from {} in {}", event.name(), origin, event.room_id());

        match event {
            ClientEvent::RoomJoin { room_id, user_name } => {
                self.join(origin, room_id, user_name).await;
            }
            ClientEvent::RoomLeave { room_id } => {
                self.gate(origin, &room_id, "room:leave")?;
                if let Some(departure) = self.registry.leave(origin, &room_id) {
                    self.announce_departure(departure, true).await;
                }
            }
            ClientEvent::CursorUpdate {
                room_id,
                position,
                file_path,
            } => {
                let participant = self
                    .registry
                    .update_cursor(&room_id, origin, position, file_path.as_deref())
                    .ok_or_else(|| not_member(origin, &room_id, "cursor:update"))?;
                let event = ServerEvent::CursorUpdate {
                    participant_id: origin,
                    position,
                    file_path,
                    color: participant.color.clone(),
                    name: participant.name.clone(),
                };
                self.publish(&room_id, origin, &event);
            }
            ClientEvent::SelectionUpdate {
                room_id,
                selection,
                file_path,
            } => {
                let participant = self
                    .registry
                    .update_selection(&room_id, origin, selection)
                    .ok_or_else(|| not_member(origin, &room_id, "selection:update"))?;
                let color = participant.color.clone();
                if let Some(path) = file_path.as_deref().filter(|p| !p.is_empty()) {
                    self.registry.set_current_file(&room_id, origin, path);
                }
                let event = ServerEvent::SelectionUpdate {
                    participant_id: origin,
                    selection,
                    file_path,
                    color,
                };
                self.publish(&room_id, origin, &event);
            }
            ClientEvent::ChatMessage {
                room_id,
                message,
                user_name,
            } => {
                let state = self.gate(origin, &room_id, "chat:message")?;
                let user_name = user_name
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| "Anonymous".to_string());
                let message = ChatMessage::new(origin, user_name, message, timestamp_millis());
                self.publish(&room_id, origin, &ServerEvent::ChatMessage(message.clone()));
                let persistence = self.history.append_chat(&room_id, &state, message).await;
                self.stats.record_write(persistence);
            }
            ClientEvent::ChatGetHistory { room_id } => {
                let state = self.gate(origin, &room_id, "chat:get-history")?;
                let messages = self.history.chat_history(&room_id, &state).await;
                self.broadcaster
                    .send_to(origin, &ServerEvent::ChatHistory(messages));
            }
            ClientEvent::ChatTyping {
                room_id,
                user_name,
                is_typing,
            } => {
                self.gate(origin, &room_id, "chat:typing")?;
                let user_name = user_name
                    .filter(|n| !n.trim().is_empty())
                    .or_else(|| self.registry.get(&room_id, origin).map(|p| p.name.clone()))
                    .unwrap_or_default();
                let event = ServerEvent::ChatTyping {
                    user_id: origin,
                    user_name,
                    is_typing,
                };
                self.publish(&room_id, origin, &event);
            }
            ClientEvent::WhiteboardDraw { room_id, stroke } => {
                let state = self.gate(origin, &room_id, "whiteboard:draw")?;
                let stroke = Stroke::from_input(stroke, origin, timestamp_millis());
                self.publish(&room_id, origin, &ServerEvent::WhiteboardDraw(stroke.clone()));
                let persistence = self.history.append_stroke(&room_id, &state, stroke).await;
                self.stats.record_write(persistence);
            }
            ClientEvent::WhiteboardClear { room_id } => {
                let state = self.gate(origin, &room_id, "whiteboard:clear")?;
                self.publish(&room_id, origin, &ServerEvent::WhiteboardClear);
                let persistence = self.history.clear_strokes(&room_id, &state).await;
                self.stats.record_write(persistence);
            }
            ClientEvent::WhiteboardGetHistory { room_id } => {
                let state = self.gate(origin, &room_id, "whiteboard:get-history")?;
                let strokes = self.history.stroke_history(&room_id, &state).await;
                self.broadcaster
                    .send_to(origin, &ServerEvent::WhiteboardHistory(strokes));
            }
            ClientEvent::WhiteboardUndo { room_id } => {
                let state = self.gate(origin, &room_id, "whiteboard:undo")?;
                self.publish(&room_id, origin, &ServerEvent::WhiteboardUndo);
                let persistence = self.history.undo_stroke(&room_id, &state).await;
                self.stats.record_write(persistence);
            }
            ClientEvent::WhiteboardCursor { room_id, x, y } => {
                self.gate(origin, &room_id, "whiteboard:cursor")?;
                let event = ServerEvent::WhiteboardCursor {
                    participant_id: origin,
                    x,
                    y,
                };
                self.publish(&room_id, origin, &event);
            }
            ClientEvent::CodeUpdate {
                room_id,
                file_path,
                content,
            } => {
                self.gate(origin, &room_id, "code:update")?;
                let event = ServerEvent::CodeUpdate {
                    file_path,
                    content,
                    user_id: origin,
                };
                self.publish(&room_id, origin, &event);
            }
            ClientEvent::FileChange {
                room_id,
                file_path,
                operation,
            } => {
                self.gate(origin, &room_id, "file:change")?;
                let event = ServerEvent::FileChange {
                    file_path,
                    operation,
                    user_id: origin,
                };
                self.publish(&room_id, origin, &event);
            }
            ClientEvent::ParticipantFileChange { room_id, file_path } => {
                self.registry
                    .set_current_file(&room_id, origin, &file_path)
                    .ok_or_else(|| not_member(origin, &room_id, "participant:file_change"))?;
                let event = ServerEvent::ParticipantFileChange {
                    participant_id: origin,
                    file_path,
                };
                self.publish(&room_id, origin, &event);
            }
            ClientEvent::ProjectSyncRequest { room_id } => {
                self.gate(origin, &room_id, "project:sync:request")?;
                let event = ServerEvent::ProjectSyncRequest {
                    requester_id: origin,
                };
                self.publish(&room_id, origin, &event);
            }
            ClientEvent::ProjectSyncData {
                room_id,
                target_id,
                files,
            } => {
                self.gate(origin, &room_id, "project:sync:data")?;
                if !self.registry.is_member(&room_id, target_id) {
                    return Err(DispatchError::UnknownTarget {
                        target: target_id,
                        room_id,
                    });
                }
                log::debug!(
                    "Routing {} snapshot files from {} to {}",
                    files.file_count(),
                    origin,
                    target_id
                );
                self.broadcaster
                    .send_to(target_id, &ServerEvent::ProjectSyncData { files });
            }
        }
        Ok(())
    }

    async fn join(&mut self, origin: ConnectionId, room_id: RoomId, user_name: Option<String>) {
        if self.registry.is_member(&room_id, origin) {
            self.send_participants(origin, &room_id);
            return;
        }

        let state = match self.registry.room_state(&room_id) {
            Some(state) => state.clone(),
            None => match self.resolve_room(&room_id).await {
                Ok(state) => state,
                Err(e) => return self.reject_join(origin, &room_id, e),
            },
        };

        match self
            .registry
            .join(&room_id, Identity::new(origin, user_name), state)
        {
            Ok(participant) => {
                self.send_participants(origin, &room_id);
                let event = ServerEvent::ParticipantJoined {
                    participant,
                    participant_count: self.registry.participant_count(&room_id),
                };
                self.publish(&room_id, origin, &event);
            }
            Err(e) => self.reject_join(origin, &room_id, e),
        }
    }

    /// Decide how a room that is not live yet is backed.
    async fn resolve_room(&self, room_id: &str) -> Result<RoomState, JoinError> {
        let Some(store) = self.store.clone() else {
            return Ok(RoomState::Ephemeral);
        };
        let code = room_id.to_uppercase();
        match store.find_room(&code).await {
            Ok(Some(record)) if record.active => Ok(RoomState::Persisted(RoomHandle {
                code,
                max_participants: record.max_participants,
            })),
            Ok(Some(_)) => {
                log::info!("Refusing join to inactive room {}", code);
                Err(JoinError::NotFound(room_id.to_string()))
            }
            Ok(None) if self.config.strict_rooms => Err(JoinError::NotFound(room_id.to_string())),
            Ok(None) => Ok(RoomState::Ephemeral),
            Err(e) => {
                log::warn!("Room lookup for {} failed, running ephemeral: {}", code, e);
                Ok(RoomState::Ephemeral)
            }
        }
    }

    fn reject_join(&self, origin: ConnectionId, room_id: &str, error: JoinError) {
        log::info!("Join to {} by {} rejected: {}", room_id, origin, error);
        let reason = match error {
            JoinError::CapacityExceeded { .. } => RejectReason::CapacityExceeded,
            JoinError::NotFound(_) => RejectReason::NotFound,
        };
        self.broadcaster.send_to(
            origin,
            &ServerEvent::RoomError {
                room_id: room_id.to_string(),
                reason,
                message: error.to_string(),
            },
        );
    }

    fn send_participants(&self, origin: ConnectionId, room_id: &str) {
        let event = ServerEvent::RoomParticipants {
            room_id: room_id.to_string(),
            participants: self.registry.list(room_id),
        };
        self.broadcaster.send_to(origin, &event);
    }

    /// Tell the room someone left. An explicit leave also reaches the
    /// leaver; a dropped transport has nobody to tell.
    async fn announce_departure(&mut self, departure: Departure, notify_leaver: bool) {
        let Departure {
            room_id,
            participant,
            remaining,
            closed,
        } = departure;
        let event = ServerEvent::ParticipantLeft {
            participant_id: participant.id,
            participant_count: remaining.len(),
        };
        let mut audience = remaining;
        if notify_leaver {
            audience.push(participant.id);
        }
        self.broadcaster.publish(&audience, participant.id, &event);

        match closed {
            Some(RoomState::Persisted(handle)) => self.deactivate(&handle.code).await,
            Some(RoomState::Ephemeral) => self.history.forget_room(&room_id),
            None => {}
        }
    }

    /// Mark a durable room inactive once its last participant is gone.
    async fn deactivate(&self, code: &str) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        match store.find_room(code).await {
            Ok(Some(mut record)) if record.active => {
                record.active = false;
                record.updated_at = timestamp_millis();
                match store.upsert_room(&record).await {
                    Ok(()) => log::info!("Room {} is empty, marked inactive", code),
                    Err(e) => log::warn!("Could not mark room {} inactive: {}", code, e),
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("Could not load room {} to deactivate: {}", code, e),
        }
    }

    fn gate(&self, origin: ConnectionId, room_id: &str, event: &'static str) -> Result<RoomState, DispatchError> {
        if !self.registry.is_member(room_id, origin) {
            return Err(not_member(origin, room_id, event));
        }
        self.registry
            .room_state(room_id)
            .cloned()
            .ok_or_else(|| not_member(origin, room_id, event))
    }

    fn publish(&self, room_id: &str, origin: ConnectionId, event: &ServerEvent) {
        let members = self.registry.members(room_id);
        let delivered = self.broadcaster.publish(&members, origin, event);
        log::trace!("{} delivered to {} in {}", event.name(), delivered, room_id);
    }
}

fn not_member(origin: ConnectionId, room_id: &str, event: &'static str) -> DispatchError {
    DispatchError::NotMember {
        origin,
        room_id: room_id.to_string(),
        event,
    }
}
