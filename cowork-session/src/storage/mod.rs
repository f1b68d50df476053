//! Durable storage for room records and their bounded history lists.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   bounded_append / pop_last   ┌──────────────────────────────┐
//! │ HistoryStore │ ────────────────────────────► │ dyn DurableStore             │
//! │ (fallback on │   read_list / clear_list      │  ├─ RoomStore  (RocksDB)     │
//! │  any error)  │                               │  └─ MemoryStore (in-process) │
//! └──────────────┘                               └──────────────────────────────┘
//! ┌──────────────┐   find_room / upsert_room
//! │ RoomDirectory│ ────────────────────────────► (same store)
//! └──────────────┘
//! ```
//!
//! List items are opaque byte strings; callers choose the encoding. Every
//! append carries its own length bound and the store trims the oldest items
//! in the same atomic write.

pub mod directory;
pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use directory::{DirectoryError, RoomDirectory, ROOM_CODE_ALPHABET, ROOM_CODE_LEN};
pub use memory::MemoryStore;
pub use rocks::{RoomStore, StoreConfig};

/// Which bounded list of a room an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListField {
    Chat,
    Strokes,
}

impl ListField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Strokes => "strokes",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Self::Chat => 1,
            Self::Strokes => 2,
        }
    }
}

/// A participant entry on a durable room record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub user_id: String,
    pub name: String,
    pub color: String,
    pub joined_at: u64,
}

/// Durable room record, keyed by its uppercase code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub code: String,
    pub name: String,
    pub host: String,
    pub active: bool,
    pub max_participants: usize,
    pub roster: Vec<RosterEntry>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl RoomRecord {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Room not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Document-store operations the session layer relies on.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Look up a room record by its uppercase code.
    async fn find_room(&self, code: &str) -> Result<Option<RoomRecord>, StoreError>;

    /// Insert or replace a room record.
    async fn upsert_room(&self, record: &RoomRecord) -> Result<(), StoreError>;

    /// Append `item` and drop the oldest items beyond `max_len`, atomically.
    /// Fails with [`StoreError::NotFound`] when no record exists for `code`.
    async fn bounded_append(
        &self,
        code: &str,
        field: ListField,
        item: Vec<u8>,
        max_len: usize,
    ) -> Result<(), StoreError>;

    /// Remove and return the newest item. `Ok(None)` when the list is empty.
    async fn pop_last(&self, code: &str, field: ListField) -> Result<Option<Vec<u8>>, StoreError>;

    /// Empty a list in one atomic write.
    async fn clear_list(&self, code: &str, field: ListField) -> Result<(), StoreError>;

    /// All items oldest first. Empty when the room or list does not exist.
    async fn read_list(&self, code: &str, field: ListField) -> Result<Vec<Vec<u8>>, StoreError>;
}
