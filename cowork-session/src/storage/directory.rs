//! Durable room directory: create, join, leave, close and reopen room records.
//!
//! Live sessions only need `find_room`; the directory is the management
//! surface that creates the records those sessions bind to.

use rand::Rng;
use std::sync::Arc;

use super::{DurableStore, RoomRecord, RosterEntry, StoreError};
use crate::presence::{DEFAULT_MAX_PARTICIPANTS, PALETTE};
use crate::protocol::timestamp_millis;

/// Symbols used in room codes. Excludes I, O, 0 and 1.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub const ROOM_CODE_LEN: usize = 6;

/// Allowed range for a room's participant cap.
pub const MIN_PARTICIPANTS: usize = 2;
pub const MAX_PARTICIPANTS: usize = 20;

const MAX_NAME_LEN: usize = 100;
const MAX_CODE_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("Room {0} not found")]
    NotFound(String),
    #[error("Room {0} is closed")]
    Inactive(String),
    #[error("Room {code} is full ({max} participants)")]
    CapacityExceeded { code: String, max: usize },
    #[error("Only the host may do that in room {0}")]
    NotHost(String),
    #[error("Room name must be 1..=100 characters")]
    InvalidName,
    #[error("Participant cap {0} outside 2..=20")]
    InvalidCapacity(usize),
    #[error("Could not find a free room code")]
    CodeSpaceExhausted,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Generate a random room code.
pub fn generate_room_code<R: Rng>(rng: &mut R) -> String {
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Room record management on top of a [`DurableStore`].
#[derive(Clone)]
pub struct RoomDirectory {
    store: Arc<dyn DurableStore>,
}

impl RoomDirectory {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// Create an active room hosted by `host_id`, who becomes its first member.
    pub async fn create_room(
        &self,
        name: &str,
        host_id: &str,
        host_name: &str,
        max_participants: Option<usize>,
    ) -> Result<RoomRecord, DirectoryError> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
            return Err(DirectoryError::InvalidName);
        }
        let max = max_participants.unwrap_or(DEFAULT_MAX_PARTICIPANTS);
        if !(MIN_PARTICIPANTS..=MAX_PARTICIPANTS).contains(&max) {
            return Err(DirectoryError::InvalidCapacity(max));
        }

        let code = self.free_code().await?;
        let now = timestamp_millis();
        let record = RoomRecord {
            code,
            name: name.to_string(),
            host: host_id.to_string(),
            active: true,
            max_participants: max,
            roster: vec![RosterEntry {
                user_id: host_id.to_string(),
                name: host_name.to_string(),
                color: PALETTE[0].to_string(),
                joined_at: now,
            }],
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_room(&record).await?;
        log::info!("Created room {} ({}) for {}", record.code, record.name, host_id);
        Ok(record)
    }

    /// Look up an active room. Codes are case-insensitive.
    pub async fn get_room(&self, code: &str) -> Result<RoomRecord, DirectoryError> {
        let record = self.load(code).await?;
        if !record.active {
            return Err(DirectoryError::Inactive(record.code));
        }
        Ok(record)
    }

    /// Add a user to a room's roster. Joining twice is a no-op.
    pub async fn join_room(
        &self,
        code: &str,
        user_id: &str,
        name: &str,
    ) -> Result<RoomRecord, DirectoryError> {
        let mut record = self.get_room(code).await?;
        if record.roster.iter().any(|e| e.user_id == user_id) {
            return Ok(record);
        }
        if record.roster.len() >= record.max_participants {
            return Err(DirectoryError::CapacityExceeded {
                code: record.code,
                max: record.max_participants,
            });
        }

        let color = PALETTE
            .iter()
            .find(|c| !record.roster.iter().any(|e| e.color == **c))
            .copied()
            .unwrap_or(PALETTE[record.roster.len() % PALETTE.len()]);
        let now = timestamp_millis();
        record.roster.push(RosterEntry {
            user_id: user_id.to_string(),
            name: name.to_string(),
            color: color.to_string(),
            joined_at: now,
        });
        record.updated_at = now;
        self.store.upsert_room(&record).await?;
        Ok(record)
    }

    /// Remove a user from the roster. The room closes once nobody is left.
    pub async fn leave_room(&self, code: &str, user_id: &str) -> Result<RoomRecord, DirectoryError> {
        let mut record = self.load(code).await?;
        record.roster.retain(|e| e.user_id != user_id);
        if record.roster.is_empty() {
            record.active = false;
        }
        record.updated_at = timestamp_millis();
        self.store.upsert_room(&record).await?;
        Ok(record)
    }

    pub async fn close_room(&self, code: &str, user_id: &str) -> Result<RoomRecord, DirectoryError> {
        self.set_active(code, user_id, false).await
    }

    pub async fn reopen_room(&self, code: &str, user_id: &str) -> Result<RoomRecord, DirectoryError> {
        self.set_active(code, user_id, true).await
    }

    async fn set_active(
        &self,
        code: &str,
        user_id: &str,
        active: bool,
    ) -> Result<RoomRecord, DirectoryError> {
        let mut record = self.load(code).await?;
        if record.host != user_id {
            return Err(DirectoryError::NotHost(record.code));
        }
        record.active = active;
        record.updated_at = timestamp_millis();
        self.store.upsert_room(&record).await?;
        log::info!("Room {} marked {}", record.code, if active { "active" } else { "closed" });
        Ok(record)
    }

    async fn load(&self, code: &str) -> Result<RoomRecord, DirectoryError> {
        let code = code.trim().to_uppercase();
        self.store
            .find_room(&code)
            .await?
            .ok_or(DirectoryError::NotFound(code))
    }

    async fn free_code(&self) -> Result<String, DirectoryError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_room_code(&mut rand::thread_rng());
            if self.store.find_room(&code).await?.is_none() {
                return Ok(code);
            }
            log::debug!("Room code {} taken, retrying", code);
        }
        Err(DirectoryError::CodeSpaceExhausted)
    }
}
