//! Persistence layer for room storage.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  append(op)        ┌──────────────────────────────┐
//! │ OperationLog │ ─────────────────► │ OpStore                      │
//! │ (per room)   │                    │  ├── MemoryStore (default)   │
//! └──────┬───────┘                    │  └── RocksStore  (rocksdb)   │
//!        │ room teardown              └──────────────┬───────────────┘
//!        │ save_snapshot + compact                   │ sealed records
//!        ▼                                           ▼
//! ┌──────────────┐                    ┌──────────────────────────────┐
//! │ RoomSnapshot │                    │ kind | seq | checksum | LZ4  │
//! │ {seq, tree,  │                    └──────────────────────────────┘
//! │  acked}      │
//! └──────────────┘
//! ```
//!
//! Only storage operations are persisted. Recovery is the latest snapshot
//! plus every persisted operation after it. Presence, events and
//! announcements still consume sequence numbers, so the log reserves blocks
//! of numbers in the store ([`OpStore::reserve_sequences`]) before handing
//! them out; a recovered room resumes above the reservation and never
//! reuses a number a client may already have seen.
//!
//! ## Performance Targets
//!
//! | Metric                 | Target  |
//! |------------------------|---------|
//! | Operation append (1KB) | <50μs   |
//! | Snapshot load (1MB)    | <1ms    |
//! | Compression ratio      | 4:1+    |

pub mod memory;
pub mod record;
#[cfg(feature = "rocksdb")]
pub mod rocks;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::protocol::{ClientId, ClientOpId, Operation, RoomKey, Seq};
use crate::tree::StorageTree;

pub use memory::MemoryStore;
pub use record::RecordKind;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("corrupted record at sequence {seq}")]
    Corrupted { seq: Seq },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Full storage tree of a room as of `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub seq: Seq,
    pub tree: StorageTree,
    /// Highest sequenced submission per client, for deduplicating
    /// resubmissions after the log has been compacted.
    pub acked: BTreeMap<ClientId, ClientOpId>,
}

impl RoomSnapshot {
    pub fn new(seq: Seq, tree: StorageTree) -> Self {
        Self {
            seq,
            tree,
            acked: BTreeMap::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(0, StorageTree::new())
    }
}

/// Durable backend for sequenced storage operations and room snapshots.
///
/// Calls happen inside a room's critical section, so implementations should
/// return quickly; a failed `append` aborts sequencing of that operation.
pub trait OpStore: Send + Sync {
    /// Persist a storage operation. Must be durable when this returns `Ok`.
    fn append(&self, room: &RoomKey, op: &Operation) -> Result<(), StoreError>;

    /// Persisted operations with `seq > after`, in sequence order.
    fn ops_since(&self, room: &RoomKey, after: Seq) -> Result<Vec<Operation>, StoreError>;

    /// Replace the room's snapshot.
    fn save_snapshot(&self, room: &RoomKey, snapshot: &RoomSnapshot) -> Result<(), StoreError>;

    fn load_snapshot(&self, room: &RoomKey) -> Result<Option<RoomSnapshot>, StoreError>;

    /// Drop persisted operations with `seq <= through`.
    fn compact(&self, room: &RoomKey, through: Seq) -> Result<usize, StoreError>;

    /// Record that sequence numbers up to `through` may be handed out.
    /// Replaces any earlier reservation. Must be durable when this returns `Ok`.
    fn reserve_sequences(&self, room: &RoomKey, through: Seq) -> Result<(), StoreError>;

    /// Current reservation of the room (0 if none).
    fn reserved_sequences(&self, room: &RoomKey) -> Result<Seq, StoreError>;

    /// Rooms with persisted operations or a snapshot.
    fn rooms(&self) -> Result<Vec<RoomKey>, StoreError>;
}

/// Latest snapshot plus the persisted operations after it.
pub fn load_room(store: &dyn OpStore, room: &RoomKey) -> Result<(RoomSnapshot, Vec<Operation>), StoreError> {
    let snapshot = store.load_snapshot(room)?.unwrap_or_else(RoomSnapshot::empty);
    let ops = store.ops_since(room, snapshot.seq)?;
    Ok((snapshot, ops))
}
