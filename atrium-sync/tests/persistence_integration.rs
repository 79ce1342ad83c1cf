//! Persistence integration tests.
//!
//! Verifies:
//! - Room state survives teardown and reload (snapshot + compaction)
//! - Crash recovery from the operation log alone
//! - Recovery never hands out a sequence number twice
//! - Duplicate suppression survives a reload
//! - A failing store refuses operations instead of losing them
//! - Registry teardown writes the room before it is dropped
//! - RocksDB-backed rooms survive a store reopen (`rocksdb` feature)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use atrium_sync::broadcast::{Inbox, InboxPoll};
use atrium_sync::config::EngineConfig;
use atrium_sync::error::SyncError;
use atrium_sync::protocol::{
    ClientId, ClientMessage, ConnectionId, EventPayload, Operation, PresenceRecord, RoomKey, Seq,
};
use atrium_sync::registry::RoomRegistry;
use atrium_sync::replica::{Replica, ReplicaEvent};
use atrium_sync::room::{Room, Submitted};
use atrium_sync::storage::{MemoryStore, OpStore, RoomSnapshot, StoreError};
use atrium_sync::tree::Value;

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// In-memory store whose writes can be switched off.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("disk full".into()))
        } else {
            Ok(())
        }
    }
}

impl OpStore for FlakyStore {
    fn append(&self, room: &RoomKey, op: &Operation) -> Result<(), StoreError> {
        self.check()?;
        self.inner.append(room, op)
    }
    fn ops_since(&self, room: &RoomKey, after: Seq) -> Result<Vec<Operation>, StoreError> {
        self.inner.ops_since(room, after)
    }
    fn save_snapshot(&self, room: &RoomKey, snapshot: &RoomSnapshot) -> Result<(), StoreError> {
        self.check()?;
        self.inner.save_snapshot(room, snapshot)
    }
    fn load_snapshot(&self, room: &RoomKey) -> Result<Option<RoomSnapshot>, StoreError> {
        self.inner.load_snapshot(room)
    }
    fn compact(&self, room: &RoomKey, through: Seq) -> Result<usize, StoreError> {
        self.check()?;
        self.inner.compact(room, through)
    }
    fn reserve_sequences(&self, room: &RoomKey, through: Seq) -> Result<(), StoreError> {
        self.check()?;
        self.inner.reserve_sequences(room, through)
    }
    fn reserved_sequences(&self, room: &RoomKey) -> Result<Seq, StoreError> {
        self.inner.reserved_sequences(room)
    }
    fn rooms(&self) -> Result<Vec<RoomKey>, StoreError> {
        self.inner.rooms()
    }
}

struct Writer {
    replica: Replica,
    connection: ConnectionId,
    inbox: Inbox,
}

impl Writer {
    async fn join(room: &Room) -> Self {
        let replica = Replica::new(ClientId::new());
        let attached = room
            .join(replica.client(), PresenceRecord::new(), None, Instant::now())
            .await
            .unwrap();
        let mut writer = Self {
            replica,
            connection: attached.connection,
            inbox: attached.inbox,
        };
        writer.sync(room).await;
        writer
    }

    /// Push queued submissions, then apply the responses.
    async fn sync(&mut self, room: &Room) -> (Vec<Submitted>, Vec<ReplicaEvent>) {
        let mut submitted = Vec::new();
        for msg in self.replica.take_outgoing() {
            if let ClientMessage::Submit {
                client_op,
                base_seq,
                payload,
            } = msg
            {
                submitted.push(
                    room.submit(self.connection, client_op, base_seq, payload, Instant::now())
                        .await
                        .unwrap(),
                );
            }
        }
        let mut events = Vec::new();
        while let InboxPoll::Message(msg) = self.inbox.try_recv() {
            events.extend(self.replica.receive(&msg));
        }
        (submitted, events)
    }

    /// Push queued submissions but drop every reply, as if the socket died
    /// right after sending.
    async fn submit_and_lose_replies(&mut self, room: &Room) {
        for msg in self.replica.take_outgoing() {
            if let ClientMessage::Submit {
                client_op,
                base_seq,
                payload,
            } = msg
            {
                room.submit(self.connection, client_op, base_seq, payload, Instant::now())
                    .await
                    .unwrap();
            }
        }
        while let InboxPoll::Message(_) = self.inbox.try_recv() {}
    }

    /// Reconnect the same replica with its last known position.
    async fn rejoin(mut self, room: &Room) -> Self {
        self.replica.disconnected();
        let ClientMessage::Join {
            presence, last_seq, ..
        } = self.replica.join_message(room.key().clone(), None)
        else {
            unreachable!("join_message always builds a Join");
        };
        let attached = room
            .join(self.replica.client(), presence, last_seq, Instant::now())
            .await
            .unwrap();
        self.connection = attached.connection;
        self.inbox = attached.inbox;
        // Welcome, then the resubmitted pending work.
        self.sync(room).await;
        self.sync(room).await;
        self
    }
}

fn config() -> EngineConfig {
    EngineConfig::for_testing()
}

async fn write_board(room: &Room) -> Value {
    let mut w = Writer::join(room).await;
    w.replica
        .root()
        .set("title", "Roadmap")
        .unwrap();
    w.replica.root().set("cards", Value::empty_list()).unwrap();
    w.sync(room).await;
    {
        let mut cards = w.replica.list("cards").unwrap();
        cards.push("design").unwrap();
        cards.push("build").unwrap();
    }
    w.replica
        .root()
        .set("owners", Value::map([("design", Value::from("ana"))]))
        .unwrap();
    w.sync(room).await;
    w.replica.list("cards").unwrap().move_item(1, 0).unwrap();
    w.replica.map("owners").unwrap().delete("design").unwrap();
    w.sync(room).await;
    room.leave(w.connection).await;
    room.export().await
}

// ─── Recovery ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_teardown_and_reload() {
    let store = Arc::new(MemoryStore::new());
    let key = RoomKey::from("roadmap");

    let room = Room::load(key.clone(), store.clone(), config()).unwrap();
    let before = write_board(&room).await;
    let head = room.head().await;
    room.teardown().await.unwrap();

    // The snapshot covers everything; the log was compacted.
    assert_eq!(store.operation_count(&key), 0);
    let snapshot = store.load_snapshot(&key).unwrap().unwrap();
    assert_eq!(snapshot.seq, head);

    let reloaded = Room::load(key, store, config()).unwrap();
    assert_eq!(reloaded.export().await, before);
    assert_eq!(reloaded.head().await, head);
    assert_eq!(
        before,
        Value::object([
            ("title", Value::from("Roadmap")),
            ("cards", Value::list(["build", "design"].map(Value::from))),
            ("owners", Value::empty_map()),
        ])
    );
}

#[tokio::test]
async fn test_crash_recovery_from_log() {
    let store = Arc::new(MemoryStore::new());
    let key = RoomKey::from("roadmap");

    let room = Room::load(key.clone(), store.clone(), config()).unwrap();
    let before = write_board(&room).await;
    // No teardown: the room is simply dropped.
    drop(room);
    assert!(store.operation_count(&key) > 0);
    assert!(store.load_snapshot(&key).unwrap().is_none());

    let reloaded = Room::load(key.clone(), store.clone(), config()).unwrap();
    assert_eq!(reloaded.export().await, before);

    // Sequencing continues after the last persisted operation.
    let head = reloaded.head().await;
    let mut w = Writer::join(&reloaded).await;
    w.replica.root().set("title", "Roadmap v2").unwrap();
    let (submitted, _) = w.sync(&reloaded).await;
    assert!(matches!(submitted.as_slice(), [Submitted::Sequenced(seq)] if *seq > head));
}

#[tokio::test]
async fn test_crash_does_not_reuse_sequence_numbers() {
    let store = Arc::new(MemoryStore::new());
    let key = RoomKey::from("roadmap");

    let room = Room::load(key.clone(), store.clone(), config()).unwrap();
    let mut ana = Writer::join(&room).await;
    ana.replica.root().set("x", 1).unwrap();
    ana.sync(&room).await;
    // Events are sequenced but never written to the log.
    for _ in 0..4 {
        room.broadcast_event(None, EventPayload::new("tick", Value::Null))
            .await
            .unwrap();
    }
    ana.sync(&room).await;
    let seen = ana.replica.last_seq();
    drop(room);

    let room = Room::load(key, store, config()).unwrap();
    assert!(room.head().await >= seen);

    let mut cy = Writer::join(&room).await;
    cy.replica.root().set("y", 5).unwrap();
    let (submitted, _) = cy.sync(&room).await;
    assert!(matches!(submitted.as_slice(), [Submitted::Sequenced(seq)] if *seq > seen));
    for _ in 0..2 {
        room.broadcast_event(None, EventPayload::new("tick", Value::Null))
            .await
            .unwrap();
    }

    let ana = ana.rejoin(&room).await;
    let expected = Value::object([("x", Value::from(1)), ("y", Value::from(5))]);
    assert_eq!(room.export().await, expected);
    assert_eq!(ana.replica.export(), expected);
}

/// Ana's write is sequenced but she never hears about it; Bo overwrites it.
/// After a reload Ana reconnects and must not resurrect her stale write.
async fn lose_ack_then_reload(teardown: bool) {
    let store = Arc::new(MemoryStore::new());
    let key = RoomKey::from("roadmap");

    let room = Room::load(key.clone(), store.clone(), config()).unwrap();
    let mut ana = Writer::join(&room).await;
    let mut bo = Writer::join(&room).await;
    ana.sync(&room).await;
    ana.replica.root().set("x", 1).unwrap();
    ana.submit_and_lose_replies(&room).await;
    assert_eq!(ana.replica.pending().len(), 1);

    bo.sync(&room).await;
    bo.replica.root().set("x", 2).unwrap();
    bo.sync(&room).await;
    room.leave(ana.connection).await;
    room.leave(bo.connection).await;
    if teardown {
        room.teardown().await.unwrap();
    }
    drop(room);

    let room = Room::load(key, store, config()).unwrap();
    let ana = ana.rejoin(&room).await;
    assert_eq!(room.export().await, Value::object([("x", Value::from(2))]));
    assert_eq!(ana.replica.export(), room.export().await);
    assert!(ana.replica.pending().is_empty());
}

#[tokio::test]
async fn test_sequenced_submission_is_not_replayed_after_teardown() {
    lose_ack_then_reload(true).await;
}

#[tokio::test]
async fn test_sequenced_submission_is_not_replayed_after_crash() {
    lose_ack_then_reload(false).await;
}

#[tokio::test]
async fn test_rejoin_after_reload_falls_back_to_snapshot() {
    let store = Arc::new(MemoryStore::new());
    let key = RoomKey::from("roadmap");

    let room = Room::load(key.clone(), store.clone(), config()).unwrap();
    let mut w = Writer::join(&room).await;
    w.replica.root().set("n", 1).unwrap();
    w.sync(&room).await;
    room.leave(w.connection).await;
    room.teardown().await.unwrap();

    // The log was compacted, so the old position can no longer be replayed.
    let reloaded = Room::load(key, store, config()).unwrap();
    let mut replica = w.replica;
    replica.disconnected();
    let ClientMessage::Join { last_seq, .. } = replica.join_message("roadmap".into(), None) else {
        unreachable!("join_message always builds a Join");
    };
    let mut attached = reloaded
        .join(replica.client(), PresenceRecord::new(), last_seq, Instant::now())
        .await
        .unwrap();
    let InboxPoll::Message(welcome) = attached.inbox.try_recv() else {
        panic!("expected a welcome");
    };
    replica.receive(&welcome);
    assert_eq!(replica.export(), Value::object([("n", Value::from(1))]));
}

// ─── Failure handling ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_store_failure_rejects_operation() {
    let store = Arc::new(FlakyStore::default());
    let room = Room::load("r".into(), store.clone(), config()).unwrap();
    let mut w = Writer::join(&room).await;
    w.replica.root().set("kept", true).unwrap();
    w.sync(&room).await;
    let head = room.head().await;

    store.set_failing(true);
    let client_op = w.replica.root().set("lost", true).unwrap();
    let (submitted, events) = w.sync(&room).await;

    assert!(matches!(
        submitted.as_slice(),
        [Submitted::Rejected(SyncError::PersistenceFailure(_))]
    ));
    assert!(matches!(
        events.as_slice(),
        [ReplicaEvent::Rejected { client_op: id, error }] if *id == client_op && error.is_retryable()
    ));
    assert_eq!(room.head().await, head);
    assert_eq!(room.export().await, Value::object([("kept", Value::from(true))]));
    // The optimistic write was rolled back.
    assert_eq!(w.replica.export(), room.export().await);

    // Teardown fails loudly too.
    assert!(matches!(room.teardown().await, Err(SyncError::PersistenceFailure(_))));

    store.set_failing(false);
    w.replica.root().set("lost", true).unwrap();
    let (submitted, _) = w.sync(&room).await;
    assert!(matches!(submitted.as_slice(), [Submitted::Sequenced(_)]));
    assert_eq!(w.replica.export(), room.export().await);
}

#[tokio::test]
async fn test_registry_persists_on_last_release() {
    let store = Arc::new(MemoryStore::new());
    let registry = RoomRegistry::new(store.clone(), config());
    let key = RoomKey::from("shared");

    let room = registry.get_or_create(&key).await.unwrap();
    let before = write_board(&room).await;
    registry.release(&key, Instant::now()).await;
    assert!(registry.is_empty().await);
    assert_eq!(store.rooms().unwrap(), vec![key.clone()]);

    let room = registry.get_or_create(&key).await.unwrap();
    assert_eq!(room.export().await, before);
}

// ─── RocksDB ─────────────────────────────────────────────────────────────────

#[cfg(feature = "rocksdb")]
mod rocks {
    use super::*;
    use atrium_sync::storage::{RocksStore, StoreConfig};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_room_survives_store_reopen() {
        let dir = tempdir().unwrap();
        let key = RoomKey::from("roadmap");

        let (before, head) = {
            let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap());
            let room = Room::load(key.clone(), store.clone(), config()).unwrap();
            let before = write_board(&room).await;
            store.sync().unwrap();
            (before, room.head().await)
        };

        let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        let room = Room::load(key.clone(), store.clone(), config()).unwrap();
        assert_eq!(room.export().await, before);
        // Resumes above every number the first process may have used.
        assert!(room.head().await >= head);

        room.teardown().await.unwrap();
        drop(room);
        let reloaded = Room::load(key.clone(), store.clone(), config()).unwrap();
        assert_eq!(reloaded.export().await, before);
        assert_eq!(store.rooms().unwrap(), vec![key]);
    }
}
