//! In-process store. Records are sealed exactly as the RocksDB store seals
//! them, so both backends exercise the same encoding path.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::record::{self, RecordKind};
use super::{OpStore, RoomSnapshot, StoreError};
use crate::protocol::{Operation, RoomKey, Seq};

#[derive(Default)]
struct RoomRecords {
    ops: BTreeMap<Seq, Vec<u8>>,
    snapshot: Option<Vec<u8>>,
    reserved: Seq,
}

/// Store kept in memory for the lifetime of the process.
#[derive(Default)]
pub struct MemoryStore {
    rooms: Mutex<HashMap<RoomKey, RoomRecords>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted operations for a room.
    pub fn operation_count(&self, room: &RoomKey) -> usize {
        self.rooms
            .lock()
            .map(|rooms| rooms.get(room).map_or(0, |r| r.ops.len()))
            .unwrap_or(0)
    }

    fn with_rooms<R>(
        &self,
        f: impl FnOnce(&mut HashMap<RoomKey, RoomRecords>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut rooms = self
            .rooms
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        f(&mut rooms)
    }
}

impl OpStore for MemoryStore {
    fn append(&self, room: &RoomKey, op: &Operation) -> Result<(), StoreError> {
        let sealed = record::seal(RecordKind::Operation, op.seq, op)?;
        self.with_rooms(|rooms| {
            rooms.entry(room.clone()).or_default().ops.insert(op.seq, sealed);
            Ok(())
        })
    }

    fn ops_since(&self, room: &RoomKey, after: Seq) -> Result<Vec<Operation>, StoreError> {
        self.with_rooms(|rooms| {
            let Some(records) = rooms.get(room) else {
                return Ok(Vec::new());
            };
            records
                .ops
                .range(after.saturating_add(1)..)
                .map(|(_, bytes)| record::open(RecordKind::Operation, bytes).map(|(_, op)| op))
                .collect()
        })
    }

    fn save_snapshot(&self, room: &RoomKey, snapshot: &RoomSnapshot) -> Result<(), StoreError> {
        let sealed = record::seal(RecordKind::Snapshot, snapshot.seq, snapshot)?;
        self.with_rooms(|rooms| {
            rooms.entry(room.clone()).or_default().snapshot = Some(sealed);
            Ok(())
        })
    }

    fn load_snapshot(&self, room: &RoomKey) -> Result<Option<RoomSnapshot>, StoreError> {
        self.with_rooms(|rooms| match rooms.get(room).and_then(|r| r.snapshot.as_ref()) {
            Some(bytes) => record::open(RecordKind::Snapshot, bytes).map(|(_, s)| Some(s)),
            None => Ok(None),
        })
    }

    fn compact(&self, room: &RoomKey, through: Seq) -> Result<usize, StoreError> {
        self.with_rooms(|rooms| {
            let Some(records) = rooms.get_mut(room) else {
                return Ok(0);
            };
            let kept = records.ops.split_off(&through.saturating_add(1));
            let dropped = records.ops.len();
            records.ops = kept;
            Ok(dropped)
        })
    }

    fn reserve_sequences(&self, room: &RoomKey, through: Seq) -> Result<(), StoreError> {
        self.with_rooms(|rooms| {
            rooms.entry(room.clone()).or_default().reserved = through;
            Ok(())
        })
    }

    fn reserved_sequences(&self, room: &RoomKey) -> Result<Seq, StoreError> {
        self.with_rooms(|rooms| Ok(rooms.get(room).map_or(0, |r| r.reserved)))
    }

    fn rooms(&self) -> Result<Vec<RoomKey>, StoreError> {
        self.with_rooms(|rooms| {
            let mut keys: Vec<RoomKey> = rooms
                .iter()
                .filter(|(_, r)| r.snapshot.is_some() || !r.ops.is_empty())
                .map(|(key, _)| key.clone())
                .collect();
            keys.sort();
            Ok(keys)
        })
    }
}
