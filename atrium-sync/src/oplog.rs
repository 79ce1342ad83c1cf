//! Per-room operation log: sequencing, fail-closed persistence and the
//! replay window used by reconnecting clients.
//!
//! ```text
//!   horizon              retained storage ops                head
//!      │  ┌────┬────┬────┬────┬────┬────┐                    │
//!      ▼  │ 14 │ 15 │ 17 │ 18 │ 21 │ 22 │  (gaps: presence,  ▼
//!     13  └────┴────┴────┴────┴────┴────┘   events, joins)   24
//!
//!   replay_since(s): horizon <= s <= head  → ops with seq > s
//!                    otherwise             → StaleSequence
//! ```
//!
//! Every operation consumes a sequence number. Only storage operations are
//! persisted and retained; a failed append leaves the counter untouched.
//! Numbers are handed out from a block reserved in the store first, so a
//! room recovered after a crash resumes above every number it may have
//! used.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::error::SyncError;
use crate::protocol::{ClientId, ClientOpId, ConnectionId, OpPayload, Operation, RoomKey, Seq};
use crate::storage::{self, OpStore, RoomSnapshot, StoreError};
use crate::tree::StorageTree;

/// How many storage operations are kept for reconnection replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Keep everything since the room was loaded.
    Unbounded,
    /// Keep the most recent `n` storage operations.
    Operations(usize),
}

/// Origin of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub connection: ConnectionId,
    pub client: ClientId,
    pub client_op: ClientOpId,
    pub base_seq: Seq,
}

/// Highest sequenced submission per client.
pub type AckedOps = BTreeMap<ClientId, ClientOpId>;

/// A room rebuilt from its store.
pub struct Recovered {
    pub log: OperationLog,
    pub tree: StorageTree,
    pub acked: AckedOps,
}

pub struct OperationLog {
    room: RoomKey,
    store: Arc<dyn OpStore>,
    retention: Retention,
    head: Seq,
    /// Replay is complete for any `last_seq >= horizon`.
    horizon: Seq,
    /// Numbers up to here are reserved in the store.
    reserved: Seq,
    /// Size of each reservation.
    block: Seq,
    retained: VecDeque<Operation>,
}

impl OperationLog {
    /// Recover a room from its store: latest snapshot plus the persisted
    /// suffix. Sequencing resumes above the stored reservation.
    pub fn recover(
        room: RoomKey,
        store: Arc<dyn OpStore>,
        retention: Retention,
        block: Seq,
    ) -> Result<Recovered, StoreError> {
        let (snapshot, suffix) = storage::load_room(store.as_ref(), &room)?;
        let reserved = store.reserved_sequences(&room)?;
        let RoomSnapshot {
            seq,
            mut tree,
            mut acked,
        } = snapshot;

        let mut last = seq;
        let mut retained = VecDeque::with_capacity(suffix.len());
        for op in suffix {
            if let OpPayload::Storage(storage_op) = &op.payload {
                tree.apply(storage_op, op.stamp());
            }
            record_ack(&mut acked, op.client, op.client_op);
            last = last.max(op.seq);
            retained.push_back(op);
        }
        let head = last.max(reserved);
        if head > seq || seq > 0 {
            log::info!(
                "Recovered room {room}: snapshot at {seq}, {} operations replayed, head {head}",
                retained.len()
            );
        }

        let mut log = Self {
            room,
            store,
            retention,
            head,
            horizon: seq,
            reserved: head,
            block: block.max(1),
            retained,
        };
        log.trim();
        Ok(Recovered { log, tree, acked })
    }

    /// Last assigned sequence number.
    pub fn head(&self) -> Seq {
        self.head
    }

    pub fn horizon(&self) -> Seq {
        self.horizon
    }

    pub fn retained_len(&self) -> usize {
        self.retained.len()
    }

    /// Assign the next sequence number to `payload`.
    ///
    /// Storage operations are appended to the store first; if that (or
    /// reserving a new block) fails the operation does not exist and the
    /// counter is unchanged.
    pub fn sequence(&mut self, origin: Origin, payload: OpPayload) -> Result<Operation, SyncError> {
        let seq = self.head + 1;
        if seq > self.reserved {
            let through = self.head + self.block;
            if let Err(e) = self.store.reserve_sequences(&self.room, through) {
                log::error!("Room {}: failed to reserve sequences through {through}: {e}", self.room);
                return Err(SyncError::PersistenceFailure(e.to_string()));
            }
            self.reserved = through;
        }
        let op = Operation {
            room: self.room.clone(),
            origin: origin.connection,
            client: origin.client,
            client_op: origin.client_op,
            seq,
            base_seq: origin.base_seq,
            payload,
        };

        if op.payload.is_storage() {
            if let Err(e) = self.store.append(&self.room, &op) {
                log::error!("Room {}: failed to persist operation {seq}: {e}", self.room);
                return Err(SyncError::PersistenceFailure(e.to_string()));
            }
            self.retained.push_back(op.clone());
            self.trim();
        }

        self.head = seq;
        log::debug!(
            "Room {}: sequenced {} #{seq} from {} (base {})",
            self.room,
            op.payload.kind(),
            origin.connection,
            origin.base_seq
        );
        Ok(op)
    }

    /// Storage operations after `since`, if the window still covers it.
    pub fn replay_since(&self, since: Seq) -> Result<Vec<Operation>, SyncError> {
        if since < self.horizon || since > self.head {
            return Err(SyncError::StaleSequence {
                requested: since,
                horizon: self.horizon,
            });
        }
        Ok(self
            .retained
            .iter()
            .filter(|op| op.seq > since)
            .cloned()
            .collect())
    }

    /// Write `tree` as the room snapshot at the current head, drop the
    /// persisted operations it covers and shrink the reservation to the head.
    pub fn persist_snapshot(&mut self, tree: &StorageTree, acked: &AckedOps) -> Result<(), StoreError> {
        let snapshot = RoomSnapshot {
            seq: self.head,
            tree: tree.clone(),
            acked: acked.clone(),
        };
        self.store.save_snapshot(&self.room, &snapshot)?;
        let dropped = self.store.compact(&self.room, self.head)?;
        self.store.reserve_sequences(&self.room, self.head)?;
        self.reserved = self.head;
        log::info!(
            "Room {}: snapshot at {} persisted, {dropped} operations compacted",
            self.room,
            self.head
        );
        Ok(())
    }

    fn trim(&mut self) {
        if let Retention::Operations(limit) = self.retention {
            while self.retained.len() > limit {
                if let Some(op) = self.retained.pop_front() {
                    self.horizon = self.horizon.max(op.seq);
                }
            }
        }
    }
}

/// Raise the recorded high-water mark of `client`.
pub(crate) fn record_ack(acked: &mut AckedOps, client: ClientId, client_op: ClientOpId) {
    if client == ClientId::SERVER || client_op == 0 {
        return;
    }
    let max = acked.entry(client).or_insert(client_op);
    *max = (*max).max(client_op);
}
