//! RocksDB-backed room store.
//!
//! Column families:
//! - `rooms`     — Room records (bincode), keyed by uppercase code
//! - `lists`     — History list items (LZ4 compressed), keyed by list prefix + seq
//! - `list_meta` — Per-list head/tail sequence numbers (bincode)
//!
//! A list occupies the half-open sequence range `[head, tail)`. Appends write
//! at `tail` and trim from `head` inside one `WriteBatch`, so readers never see
//! a list longer than its bound.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{DurableStore, ListField, RoomRecord, StoreError};

const CF_ROOMS: &str = "rooms";
const CF_LISTS: &str = "lists";
const CF_LIST_META: &str = "list_meta";

const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_LISTS, CF_LIST_META];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cowork_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config with small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ListMeta {
    head: u64,
    tail: u64,
}

impl ListMeta {
    fn len(&self) -> u64 {
        self.tail - self.head
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed [`DurableStore`].
pub struct RoomStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write of list metadata.
    write_lock: Mutex<()>,
}

impl RoomStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened room store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ROOMS | CF_LIST_META => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_LISTS => {
                // Values are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Rooms ────────────────────────────────────────────────────────

    pub fn load_room(&self, code: &str) -> Result<Option<RoomRecord>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(&cf, code.as_bytes())? {
            Some(bytes) => RoomRecord::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn save_room(&self, record: &RoomRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        self.db
            .put_cf_opt(&cf, record.code.as_bytes(), record.encode()?, &self.write_opts())?;
        Ok(())
    }

    pub fn room_exists(&self, code: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        Ok(self.db.get_cf(&cf, code.as_bytes())?.is_some())
    }

    // ─── Lists ────────────────────────────────────────────────────────

    pub fn append(
        &self,
        code: &str,
        field: ListField,
        item: &[u8],
        max_len: usize,
    ) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        if !self.room_exists(code)? {
            return Err(StoreError::NotFound(code.to_string()));
        }

        let cf_lists = self.cf(CF_LISTS)?;
        let cf_meta = self.cf(CF_LIST_META)?;
        let prefix = list_prefix(code, field);
        let mut meta = self.load_meta(&prefix)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_lists, item_key(&prefix, meta.tail), lz4_flex::compress_prepend_size(item));
        meta.tail += 1;

        let max_len = max_len as u64;
        if meta.len() > max_len {
            let new_head = meta.tail - max_len;
            batch.delete_range_cf(
                &cf_lists,
                item_key(&prefix, meta.head),
                item_key(&prefix, new_head),
            );
            log::trace!("Trimming {} {} items from {}", field.as_str(), new_head - meta.head, code);
            meta.head = new_head;
        }

        batch.put_cf(&cf_meta, &prefix, encode_meta(&meta)?);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    pub fn pop(&self, code: &str, field: ListField) -> Result<Option<Vec<u8>>, StoreError> {
        let _guard = self.lock()?;
        let cf_lists = self.cf(CF_LISTS)?;
        let cf_meta = self.cf(CF_LIST_META)?;
        let prefix = list_prefix(code, field);
        let mut meta = self.load_meta(&prefix)?;
        if meta.len() == 0 {
            return Ok(None);
        }

        let key = item_key(&prefix, meta.tail - 1);
        let value = self.db.get_cf(&cf_lists, &key)?;
        meta.tail -= 1;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_lists, &key);
        batch.put_cf(&cf_meta, &prefix, encode_meta(&meta)?);
        self.db.write_opt(batch, &self.write_opts())?;

        value.map(|v| decompress(&v)).transpose()
    }

    pub fn clear(&self, code: &str, field: ListField) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        let cf_lists = self.cf(CF_LISTS)?;
        let cf_meta = self.cf(CF_LIST_META)?;
        let prefix = list_prefix(code, field);
        let mut meta = self.load_meta(&prefix)?;
        if meta.len() == 0 {
            return Ok(());
        }

        let mut batch = WriteBatch::default();
        batch.delete_range_cf(
            &cf_lists,
            item_key(&prefix, meta.head),
            item_key(&prefix, meta.tail),
        );
        // Sequence numbers stay monotonic across clears.
        meta.head = meta.tail;
        batch.put_cf(&cf_meta, &prefix, encode_meta(&meta)?);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    pub fn read(&self, code: &str, field: ListField) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_LISTS)?;
        let prefix = list_prefix(code, field);
        let meta = self.load_meta(&prefix)?;
        let start = item_key(&prefix, meta.head);

        let mut items = Vec::with_capacity(meta.len() as usize);
        let iter = self.db.iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            items.push(decompress(&value)?);
        }
        Ok(items)
    }

    pub fn len(&self, code: &str, field: ListField) -> Result<u64, StoreError> {
        Ok(self.load_meta(&list_prefix(code, field))?.len())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("write lock poisoned".into()))
    }

    fn load_meta(&self, prefix: &[u8]) -> Result<ListMeta, StoreError> {
        let cf = self.cf(CF_LIST_META)?;
        match self.db.get_cf(&cf, prefix)? {
            Some(bytes) => {
                let (meta, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                Ok(meta)
            }
            None => Ok(ListMeta::default()),
        }
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

#[async_trait]
impl DurableStore for RoomStore {
    async fn find_room(&self, code: &str) -> Result<Option<RoomRecord>, StoreError> {
        self.load_room(code)
    }

    async fn upsert_room(&self, record: &RoomRecord) -> Result<(), StoreError> {
        self.save_room(record)
    }

    async fn bounded_append(
        &self,
        code: &str,
        field: ListField,
        item: Vec<u8>,
        max_len: usize,
    ) -> Result<(), StoreError> {
        self.append(code, field, &item, max_len)
    }

    async fn pop_last(&self, code: &str, field: ListField) -> Result<Option<Vec<u8>>, StoreError> {
        self.pop(code, field)
    }

    async fn clear_list(&self, code: &str, field: ListField) -> Result<(), StoreError> {
        self.clear(code, field)
    }

    async fn read_list(&self, code: &str, field: ListField) -> Result<Vec<Vec<u8>>, StoreError> {
        self.read(code, field)
    }
}

/// List prefix: code length (2 bytes BE) + code + field tag.
fn list_prefix(code: &str, field: ListField) -> Vec<u8> {
    let bytes = code.as_bytes();
    let mut prefix = Vec::with_capacity(bytes.len() + 3);
    prefix.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    prefix.extend_from_slice(bytes);
    prefix.push(field.tag());
    prefix
}

/// Item key: list prefix + sequence number (8 bytes BE).
fn item_key(prefix: &[u8], seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 8);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn encode_meta(meta: &ListMeta) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(meta, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decompress(value: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(value).map_err(|e| StoreError::Compression(e.to_string()))
}
