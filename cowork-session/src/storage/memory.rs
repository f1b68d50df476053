//! In-process [`DurableStore`] with switchable availability.
//!
//! Behaves like the RocksDB store but keeps everything in a mutex-guarded
//! map. `set_available(false)` makes every call fail with
//! [`StoreError::Unavailable`], which is how the fallback paths get exercised.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{DurableStore, ListField, RoomRecord, StoreError};

#[derive(Debug, Default)]
struct State {
    rooms: HashMap<String, RoomRecord>,
    lists: HashMap<(String, ListField), VecDeque<Vec<u8>>>,
}

#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    available: AtomicBool,
    calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
            calls: AtomicU64::new(0),
        }
    }

    /// Toggle simulated outage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of store calls made so far, including failed ones.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn list_len(&self, code: &str, field: ListField) -> usize {
        self.state
            .lock()
            .map(|state| {
                state
                    .lists
                    .get(&(code.to_string(), field))
                    .map_or(0, VecDeque::len)
            })
            .unwrap_or(0)
    }

    fn enter(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("state lock poisoned".into()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn find_room(&self, code: &str) -> Result<Option<RoomRecord>, StoreError> {
        Ok(self.enter()?.rooms.get(code).cloned())
    }

    async fn upsert_room(&self, record: &RoomRecord) -> Result<(), StoreError> {
        self.enter()?
            .rooms
            .insert(record.code.clone(), record.clone());
        Ok(())
    }

    async fn bounded_append(
        &self,
        code: &str,
        field: ListField,
        item: Vec<u8>,
        max_len: usize,
    ) -> Result<(), StoreError> {
        let mut state = self.enter()?;
        if !state.rooms.contains_key(code) {
            return Err(StoreError::NotFound(code.to_string()));
        }
        let list = state.lists.entry((code.to_string(), field)).or_default();
        list.push_back(item);
        while list.len() > max_len {
            list.pop_front();
        }
        Ok(())
    }

    async fn pop_last(&self, code: &str, field: ListField) -> Result<Option<Vec<u8>>, StoreError> {
        let mut state = self.enter()?;
        Ok(state
            .lists
            .get_mut(&(code.to_string(), field))
            .and_then(VecDeque::pop_back))
    }

    async fn clear_list(&self, code: &str, field: ListField) -> Result<(), StoreError> {
        self.enter()?.lists.remove(&(code.to_string(), field));
        Ok(())
    }

    async fn read_list(&self, code: &str, field: ListField) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self
            .enter()?
            .lists
            .get(&(code.to_string(), field))
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(code: &str) -> RoomRecord {
        RoomRecord {
            code: code.to_string(),
            name: "Room".into(),
            host: "h".into(),
            active: true,
            max_participants: 10,
            roster: Vec::new(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn test_bounded_append_trims() {
        let store = MemoryStore::new();
        store.upsert_room(&record("ROOM01")).await.unwrap();
        for i in 0..5u8 {
            store
                .bounded_append("ROOM01", ListField::Chat, vec![i], 3)
                .await
                .unwrap();
        }
        let items = store.read_list("ROOM01", ListField::Chat).await.unwrap();
        assert_eq!(items, vec![vec![2], vec![3], vec![4]]);
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.find_room("ROOM01").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_available(true);
        assert_eq!(store.find_room("ROOM01").await.unwrap(), None);
        assert_eq!(store.call_count(), 2);
    }

    #[tokio::test]
    async fn test_append_to_missing_room() {
        let store = MemoryStore::new();
        let err = store
            .bounded_append("GHOST1", ListField::Strokes, vec![1], 10)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound("GHOST1".into()));
    }
}
