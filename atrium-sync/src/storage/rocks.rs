//! RocksDB-backed operation store (cargo feature `rocksdb`).
//!
//! Column families:
//! - `operations`: sealed storage operations, keyed by room + seq
//! - `snapshots`: sealed room snapshots, keyed by room
//! - `rooms`: room index (room → highest persisted seq)
//! - `reservations`: sequence reservation per room (room → seq)
//!
//! Operation key layout keeps one room's operations contiguous and in
//! sequence order:
//! ```text
//! ┌──────────────┬─────────────────┬──────────────┐
//! │ room len u16 │ room key bytes  │ seq u64 (BE) │
//! └──────────────┴─────────────────┴──────────────┘
//! ```
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::record::{self, RecordKind};
use super::{OpStore, RoomSnapshot, StoreError};
use crate::protocol::{Operation, RoomKey, Seq};

const CF_OPERATIONS: &str = "operations";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_ROOMS: &str = "rooms";
const CF_RESERVATIONS: &str = "reservations";

const COLUMN_FAMILIES: &[&str] = &[CF_OPERATIONS, CF_SNAPSHOTS, CF_ROOMS, CF_RESERVATIONS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every append (default: true, appends must be durable)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("atrium_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed [`OpStore`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened operation store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OPERATIONS => {
                // Records are already LZ4 compressed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_SNAPSHOTS | CF_ROOMS | CF_RESERVATIONS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    /// Iterate `(seq, value)` over one room's operation keys starting at `from`.
    fn scan_ops(
        &self,
        room: &RoomKey,
        from: Seq,
        mut visit: impl FnMut(Seq, &[u8], &[u8]) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let prefix = room_prefix(room)?;
        let start = op_key(room, from)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() != prefix.len() + 8 || !key.starts_with(&prefix) {
                break;
            }
            let mut seq_buf = [0u8; 8];
            seq_buf.copy_from_slice(&key[prefix.len()..]);
            visit(u64::from_be_bytes(seq_buf), &key, &value)?;
        }
        Ok(())
    }
}

impl OpStore for RocksStore {
    fn append(&self, room: &RoomKey, op: &Operation) -> Result<(), StoreError> {
        let sealed = record::seal(RecordKind::Operation, op.seq, op)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_OPERATIONS)?, op_key(room, op.seq)?, &sealed);
        batch.put_cf(self.cf(CF_ROOMS)?, room.as_str().as_bytes(), op.seq.to_be_bytes());
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn ops_since(&self, room: &RoomKey, after: Seq) -> Result<Vec<Operation>, StoreError> {
        let mut ops = Vec::new();
        self.scan_ops(room, after.saturating_add(1), |_, _, value| {
            let (_, op) = record::open(RecordKind::Operation, value)?;
            ops.push(op);
            Ok(())
        })?;
        Ok(ops)
    }

    fn save_snapshot(&self, room: &RoomKey, snapshot: &RoomSnapshot) -> Result<(), StoreError> {
        let sealed = record::seal(RecordKind::Snapshot, snapshot.seq, snapshot)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_SNAPSHOTS)?, room.as_str().as_bytes(), &sealed);
        batch.put_cf(
            self.cf(CF_ROOMS)?,
            room.as_str().as_bytes(),
            snapshot.seq.to_be_bytes(),
        );
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn load_snapshot(&self, room: &RoomKey) -> Result<Option<RoomSnapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, room.as_str().as_bytes())? {
            Some(bytes) => {
                let (_, snapshot) = record::open(RecordKind::Snapshot, &bytes)?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    fn compact(&self, room: &RoomKey, through: Seq) -> Result<usize, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let mut batch = WriteBatch::default();
        let mut count = 0usize;
        self.scan_ops(room, 0, |seq, key, _| {
            if seq <= through {
                batch.delete_cf(cf, key);
                count += 1;
            }
            Ok(())
        })?;
        if count > 0 {
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(count)
    }

    fn reserve_sequences(&self, room: &RoomKey, through: Seq) -> Result<(), StoreError> {
        self.db.put_cf_opt(
            self.cf(CF_RESERVATIONS)?,
            room.as_str().as_bytes(),
            through.to_be_bytes(),
            &self.write_options(),
        )?;
        Ok(())
    }

    fn reserved_sequences(&self, room: &RoomKey) -> Result<Seq, StoreError> {
        match self.db.get_cf(self.cf(CF_RESERVATIONS)?, room.as_str().as_bytes())? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::Deserialization(format!("bad reservation for room {room}"))
                })?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    fn rooms(&self) -> Result<Vec<RoomKey>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|_| StoreError::Deserialization("room key is not UTF-8".into()))?;
            rooms.push(RoomKey::from(name));
        }
        Ok(rooms)
    }
}

fn room_prefix(room: &RoomKey) -> Result<Vec<u8>, StoreError> {
    let bytes = room.as_str().as_bytes();
    let len = u16::try_from(bytes.len())
        .map_err(|_| StoreError::Serialization(format!("room key too long: {} bytes", bytes.len())))?;
    let mut prefix = Vec::with_capacity(2 + bytes.len() + 8);
    prefix.extend_from_slice(&len.to_be_bytes());
    prefix.extend_from_slice(bytes);
    Ok(prefix)
}

fn op_key(room: &RoomKey, seq: Seq) -> Result<Vec<u8>, StoreError> {
    let mut key = room_prefix(room)?;
    key.extend_from_slice(&seq.to_be_bytes());
    Ok(key)
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
