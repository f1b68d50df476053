//! # cowork-session — Real-time collaboration session engine
//!
//! Rooms of live participants sharing presence, chat, a whiteboard and code
//! edits over WebSocket, with bounded durable history and a one-shot project
//! snapshot handoff for newly joined clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket     ┌───────────────┐
//! │ SessionClient │ ◄───────────────► │ SessionServer │
//! │ + ClientStore │    JSON events    │  (conn tasks) │
//! └───────────────┘                   └───────┬───────┘
//!                                             │ HubCommand
//!                                     ┌───────▼───────┐
//!                                     │  SessionHub   │
//!                                     ├───────────────┤
//!                                     │ Registry      │
//!                                     │ Broadcaster   │
//!                                     │ HistoryStore ─┼──► DurableStore
//!                                     └───────────────┘    (RocksDB | memory)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Closed client/server event catalog (JSON wire format)
//! - [`presence`] — Session registry: rooms, participants, capacity, colors
//! - [`broadcast`] — Fan-out to per-connection outboxes
//! - [`history`] — Bounded chat/stroke history with in-memory fallback
//! - [`hub`] — Single-owner event dispatch tying the above together
//! - [`snapshot`] — Project snapshot tree, workspaces, sync state machine
//! - [`storage`] — Durable store trait, RocksDB store, room directory
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket client with reconnect
//! - [`reconcile`] — Client-side state mirror with echo suppression

pub mod protocol;
pub mod presence;
pub mod broadcast;
pub mod history;
pub mod hub;
pub mod snapshot;
pub mod storage;
pub mod server;
pub mod client;
pub mod reconcile;

// Re-exports for convenience
pub use protocol::{
    ClientEvent, ConnectionId, CursorPosition, Delivery, ProtocolError, RejectReason, RoomId,
    SelectionRange, ServerEvent,
};
pub use presence::{Identity, JoinError, Participant, RoomHandle, RoomState, SessionRegistry};
pub use broadcast::{BroadcastStats, Broadcaster};
pub use history::{ChatMessage, HistoryLimits, HistoryStore, Persistence, Stroke, StrokeInput, StrokeTool};
pub use hub::{DispatchError, HubCommand, HubConfig, HubStats, SessionHub};
pub use snapshot::{
    DirWorkspace, MemoryWorkspace, SnapshotError, SnapshotNode, SnapshotSync, SnapshotTree,
    SyncPhase, Workspace,
};
pub use storage::{
    DirectoryError, DurableStore, ListField, MemoryStore, RoomDirectory, RoomRecord, RoomStore,
    StoreConfig, StoreError,
};
pub use server::{ServerConfig, ServerError, ServerStats, SessionServer, StatsHandle};
pub use client::{ClientConfig, ClientError, SessionClient, SessionEvent};
pub use reconcile::{ClientStore, ConnectionStatus};
