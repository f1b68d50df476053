//! Persistence integration tests.
//!
//! Verifies:
//! - Bounded chat/stroke history through the RocksDB store
//! - History survives closing and reopening the database
//! - Persisted rooms take their capacity from the durable record
//! - Emptied persisted rooms are closed and refuse later joins
//! - A store outage degrades to in-memory history without losing events

use cowork_session::history::{ChatMessage, HistoryLimits, HistoryStore, Persistence, StrokeInput};
use cowork_session::hub::{HubConfig, SessionHub};
use cowork_session::presence::{RoomHandle, RoomState};
use cowork_session::protocol::{ClientEvent, ConnectionId, RejectReason, ServerEvent};
use cowork_session::storage::{
    DurableStore, ListField, MemoryStore, RoomDirectory, RoomStore, StoreConfig,
};

use std::sync::Arc;
use tempfile::tempdir;
use tokio::sync::mpsc;

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Peer {
    id: ConnectionId,
    rx: mpsc::Receiver<Arc<str>>,
}

impl Peer {
    fn drain(&mut self) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            out.push(ServerEvent::decode(&frame).unwrap());
        }
        out
    }
}

fn connect(hub: &mut SessionHub) -> Peer {
    let id = ConnectionId::new();
    let (tx, rx) = mpsc::channel(1024);
    hub.connect(id, tx);
    Peer { id, rx }
}

async fn join(hub: &mut SessionHub, peer: &Peer, room: &str, name: &str) {
    hub.dispatch(
        peer.id,
        ClientEvent::RoomJoin {
            room_id: room.into(),
            user_name: Some(name.into()),
        },
    )
    .await;
}

async fn draw(hub: &mut SessionHub, peer: &Peer, room: &str, id: &str) {
    hub.dispatch(
        peer.id,
        ClientEvent::WhiteboardDraw {
            room_id: room.into(),
            stroke: StrokeInput {
                id: Some(id.into()),
                points: vec![[0.0, 0.0], [1.0, 1.0]],
                color: None,
                width: None,
                tool: None,
            },
        },
    )
    .await;
}

async fn chat(hub: &mut SessionHub, peer: &Peer, room: &str, text: &str) {
    hub.dispatch(
        peer.id,
        ClientEvent::ChatMessage {
            room_id: room.into(),
            message: text.into(),
            user_name: Some("Ada".into()),
        },
    )
    .await;
}

fn open_store(path: &std::path::Path) -> Arc<RoomStore> {
    Arc::new(RoomStore::open(StoreConfig::for_testing(path)).unwrap())
}

fn persisted(code: &str, max: usize) -> RoomState {
    RoomState::Persisted(RoomHandle {
        code: code.into(),
        max_participants: max,
    })
}

// ─── Bounded History ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chat_history_evicts_oldest_at_limit() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let directory = RoomDirectory::new(store.clone());
    let room = directory.create_room("Standup", "host", "Ada", None).await.unwrap();

    let mut history = HistoryStore::new(Some(store.clone() as Arc<dyn DurableStore>), HistoryLimits::default());
    let state = persisted(&room.code, room.max_participants);
    let author = ConnectionId::new();

    for n in 1..=501 {
        let msg = ChatMessage::new(author, "Ada".into(), format!("message {n}"), n);
        assert_eq!(
            history.append_chat(&room.code, &state, msg).await,
            Persistence::Durable
        );
    }

    let stored = history.chat_history(&room.code, &state).await;
    assert_eq!(stored.len(), 500);
    assert_eq!(stored[0].message, "message 2");
    assert_eq!(stored[499].message, "message 501");
    assert_eq!(store.len(&room.code, ListField::Chat).unwrap(), 500);
}

#[tokio::test]
async fn test_identical_chat_payloads_are_both_kept() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let directory = RoomDirectory::new(store.clone());
    let room = directory.create_room("Dupes", "host", "Ada", None).await.unwrap();

    let mut hub = SessionHub::new(HubConfig::default(), Some(store.clone() as Arc<dyn DurableStore>));
    let ada = connect(&mut hub);
    join(&mut hub, &ada, &room.code, "Ada").await;
    chat(&mut hub, &ada, &room.code, "same").await;
    chat(&mut hub, &ada, &room.code, "same").await;

    assert_eq!(store.len(&room.code, ListField::Chat).unwrap(), 2);
}

#[tokio::test]
async fn test_undo_and_clear_on_durable_whiteboard() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let directory = RoomDirectory::new(store.clone());
    let room = directory.create_room("Board", "host", "Ada", None).await.unwrap();

    let mut hub = SessionHub::new(HubConfig::default(), Some(store.clone() as Arc<dyn DurableStore>));
    let mut ada = connect(&mut hub);
    join(&mut hub, &ada, &room.code, "Ada").await;
    for id in ["s1", "s2", "s3"] {
        draw(&mut hub, &ada, &room.code, id).await;
    }

    hub.dispatch(ada.id, ClientEvent::WhiteboardUndo { room_id: room.code.clone() }).await;
    assert_eq!(store.len(&room.code, ListField::Strokes).unwrap(), 2);

    hub.dispatch(ada.id, ClientEvent::WhiteboardClear { room_id: room.code.clone() }).await;
    hub.dispatch(ada.id, ClientEvent::WhiteboardUndo { room_id: room.code.clone() }).await;
    assert_eq!(store.len(&room.code, ListField::Strokes).unwrap(), 0);

    ada.drain();
    hub.dispatch(ada.id, ClientEvent::WhiteboardGetHistory { room_id: room.code.clone() }).await;
    match ada.drain().as_slice() {
        [ServerEvent::WhiteboardHistory(strokes)] => assert!(strokes.is_empty()),
        other => panic!("unexpected {other:?}"),
    }
}

// ─── Crash Recovery ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_history_survives_reopen() {
    let dir = tempdir().unwrap();
    let code;
    {
        let store = open_store(dir.path());
        let directory = RoomDirectory::new(store.clone());
        code = directory.create_room("Durable", "host", "Ada", None).await.unwrap().code;

        let mut hub = SessionHub::new(HubConfig::default(), Some(store.clone() as Arc<dyn DurableStore>));
        let ada = connect(&mut hub);
        join(&mut hub, &ada, &code, "Ada").await;
        chat(&mut hub, &ada, &code, "before restart").await;
        hub.dispatch(
            ada.id,
            ClientEvent::WhiteboardDraw {
                room_id: code.clone(),
                stroke: serde_json::from_str(r#"{"points":[[1,2],[3,4]]}"#).unwrap(),
            },
        )
        .await;
        store.sync().unwrap();
    }

    let store = open_store(dir.path());
    let history = HistoryStore::new(Some(store.clone() as Arc<dyn DurableStore>), HistoryLimits::default());
    let state = persisted(&code, 10);

    let messages = history.chat_history(&code, &state).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message, "before restart");

    let strokes = history.stroke_history(&code, &state).await;
    assert_eq!(strokes.len(), 1);
    assert_eq!(strokes[0].points, vec![[1.0, 2.0], [3.0, 4.0]]);
}

// ─── Room Lifecycle ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_persisted_room_capacity_comes_from_record() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let directory = RoomDirectory::new(store.clone());
    let room = directory.create_room("Pair", "host", "Ada", Some(2)).await.unwrap();

    let mut hub = SessionHub::new(HubConfig::default(), Some(store.clone() as Arc<dyn DurableStore>));
    let a = connect(&mut hub);
    let b = connect(&mut hub);
    let mut c = connect(&mut hub);
    join(&mut hub, &a, &room.code, "A").await;
    join(&mut hub, &b, &room.code, "B").await;
    join(&mut hub, &c, &room.code, "C").await;

    assert_eq!(hub.registry().participant_count(&room.code), 2);
    match c.drain().as_slice() {
        [ServerEvent::RoomError { reason, .. }] => assert_eq!(*reason, RejectReason::CapacityExceeded),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_emptied_room_is_closed() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let directory = RoomDirectory::new(store.clone());
    let room = directory.create_room("Brief", "host", "Ada", None).await.unwrap();

    let mut hub = SessionHub::new(HubConfig::default(), Some(store.clone() as Arc<dyn DurableStore>));
    let ada = connect(&mut hub);
    join(&mut hub, &ada, &room.code, "Ada").await;
    hub.disconnect(ada.id).await;

    let record = store.find_room(&room.code).await.unwrap().unwrap();
    assert!(!record.active);

    let mut late = connect(&mut hub);
    join(&mut hub, &late, &room.code, "Late").await;
    match late.drain().as_slice() {
        [ServerEvent::RoomError { reason, .. }] => assert_eq!(*reason, RejectReason::NotFound),
        other => panic!("unexpected {other:?}"),
    }

    // The host can bring it back.
    directory.reopen_room(&room.code, "host").await.unwrap();
    join(&mut hub, &late, &room.code, "Late").await;
    assert!(matches!(late.drain()[0], ServerEvent::RoomParticipants { .. }));
}

#[tokio::test]
async fn test_strict_rooms_reject_unknown_codes() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let config = HubConfig {
        strict_rooms: true,
        ..HubConfig::default()
    };
    let mut hub = SessionHub::new(config, Some(store as Arc<dyn DurableStore>));
    let mut ada = connect(&mut hub);
    join(&mut hub, &ada, "NOPE99", "Ada").await;

    assert!(matches!(
        ada.drain().as_slice(),
        [ServerEvent::RoomError { reason: RejectReason::NotFound, .. }]
    ));
    assert_eq!(hub.registry().room_count(), 0);
}

// ─── Degraded Mode ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_store_outage_falls_back_to_memory() {
    let store = Arc::new(MemoryStore::new());
    let directory = RoomDirectory::new(store.clone());
    let room = directory.create_room("Flaky", "host", "Ada", None).await.unwrap();

    let mut hub = SessionHub::new(HubConfig::default(), Some(store.clone() as Arc<dyn DurableStore>));
    let mut ada = connect(&mut hub);
    let mut bob = connect(&mut hub);
    join(&mut hub, &ada, &room.code, "Ada").await;
    join(&mut hub, &bob, &room.code, "Bob").await;
    ada.drain();
    bob.drain();

    store.set_available(false);
    chat(&mut hub, &ada, &room.code, "still here").await;

    // The live path is unaffected.
    assert!(matches!(&bob.drain()[..], [ServerEvent::ChatMessage(m)] if m.message == "still here"));
    assert_eq!(store.list_len(&room.code, ListField::Chat), 0);

    // History is served from the fallback while the store is down.
    hub.dispatch(bob.id, ClientEvent::ChatGetHistory { room_id: room.code.clone() }).await;
    match bob.drain().as_slice() {
        [ServerEvent::ChatHistory(history)] => assert_eq!(history.len(), 1),
        other => panic!("unexpected {other:?}"),
    }
    assert!(hub.stats_handle().snapshot().fallback_writes >= 1);
}

#[tokio::test]
async fn test_undo_after_outage_matches_client_boards() {
    let store = Arc::new(MemoryStore::new());
    let directory = RoomDirectory::new(store.clone());
    let room = directory.create_room("Sketch", "host", "Ada", None).await.unwrap();

    let mut hub = SessionHub::new(HubConfig::default(), Some(store.clone() as Arc<dyn DurableStore>));
    let mut ada = connect(&mut hub);
    join(&mut hub, &ada, &room.code, "Ada").await;

    store.set_available(false);
    draw(&mut hub, &ada, &room.code, "s1").await;
    store.set_available(true);

    // Clients pop their last stroke on undo; the server history must agree.
    hub.dispatch(ada.id, ClientEvent::WhiteboardUndo { room_id: room.code.clone() }).await;
    ada.drain();
    hub.dispatch(ada.id, ClientEvent::WhiteboardGetHistory { room_id: room.code.clone() }).await;
    match ada.drain().as_slice() {
        [ServerEvent::WhiteboardHistory(strokes)] => assert!(strokes.is_empty()),
        other => panic!("unexpected {other:?}"),
    }
}
