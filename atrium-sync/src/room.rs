//! A room: one critical section owning the presence table, storage tree,
//! operation log and outboxes of one shared document.
//!
//! ```text
//!             submit ──►┌──────────────── Room (Mutex) ────────────────┐
//!                       │ dedupe ─► validate ─► sequence ─► persist    │
//!                       │                          │                   │
//!                       │              ┌───────────┼────────────┐      │
//!                       │              ▼           ▼            ▼      │
//!                       │         StorageTree  PresenceChannel  events │
//!                       │              └───────────┬────────────┘      │
//!                       │                          ▼                   │
//!                       │                   BroadcastGroup             │
//!                       └──────────────────────────┬───────────────────┘
//!                                                  ▼
//!                                   per-connection outboxes (in seq order)
//! ```
//!
//! Sequencing, persistence, tree application and fan-out happen under one
//! lock, so every connection observes operations in sequence order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::broadcast::{BroadcastGroup, BroadcastStats, Inbox};
use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::events;
use crate::oplog::{self, AckedOps, OperationLog, Origin, Recovered};
use crate::presence::{PresenceChannel, PresenceUpdate};
use crate::protocol::{
    ClientId, ClientOpId, ConnectionId, EventPayload, OpPayload, PresenceRecord, RoomKey, Seq,
    ServerMessage, SyncState, Welcome,
};
use crate::storage::OpStore;
use crate::tree::{StorageOp, StorageTree, Value};

/// What happened to a submission. Responses travel through the outbox.
#[derive(Debug, Clone, PartialEq)]
pub enum Submitted {
    /// Sequenced under this number.
    Sequenced(Seq),
    /// Presence folded into a trailing update.
    Deferred,
    /// Already sequenced earlier; acknowledged again.
    Duplicate,
    /// Refused; the origin was sent `Rejected`.
    Rejected(SyncError),
}

/// A freshly attached connection.
#[derive(Debug)]
pub struct Attached {
    pub connection: ConnectionId,
    pub inbox: Inbox,
}

/// Room statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomStats {
    pub connections: usize,
    pub head: Seq,
    pub horizon: Seq,
    pub retained_ops: usize,
    pub broadcast: BroadcastStats,
}

#[derive(Debug, Clone, Copy)]
struct Member {
    client: ClientId,
    last_seen: Instant,
}

struct RoomState {
    tree: StorageTree,
    presence: PresenceChannel,
    log: OperationLog,
    outboxes: BroadcastGroup,
    members: HashMap<ConnectionId, Member>,
    next_connection: u64,
    /// Highest sequenced submission per client, persisted with snapshots.
    acked: AckedOps,
}

pub struct Room {
    key: RoomKey,
    config: EngineConfig,
    state: Mutex<RoomState>,
}

impl Room {
    /// Load a room from the store. A store failure makes the room unavailable.
    pub fn load(key: RoomKey, store: Arc<dyn OpStore>, config: EngineConfig) -> Result<Self, SyncError> {
        let Recovered { log, tree, acked } =
            OperationLog::recover(key.clone(), store, config.retention, config.sequence_block)
                .map_err(|e| {
                    log::error!("Failed to load room {key}: {e}");
                    SyncError::RoomUnavailable(format!("room {key} could not be loaded: {e}"))
                })?;

        let state = RoomState {
            tree,
            presence: PresenceChannel::new(config.presence_window),
            log,
            outboxes: BroadcastGroup::new(config.outbox_capacity),
            members: HashMap::new(),
            next_connection: 1,
            acked,
        };
        Ok(Self {
            key,
            config,
            state: Mutex::new(state),
        })
    }

    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    /// Attach a connection.
    ///
    /// The new connection's first message is its `Welcome`; the others
    /// receive a `ConnectionJoined` operation.
    pub async fn join(
        &self,
        client: ClientId,
        presence: PresenceRecord,
        last_seq: Option<Seq>,
        now: Instant,
    ) -> Result<Attached, SyncError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if state.members.len() >= self.config.max_connections_per_room {
            log::warn!(
                "Room {} is at capacity ({} connections); refusing {client}",
                self.key,
                state.members.len()
            );
            return Err(SyncError::RoomUnavailable(format!("room {} is full", self.key)));
        }

        let connection = ConnectionId(state.next_connection);
        state.next_connection += 1;
        let inbox = state.outboxes.attach(connection);

        let sync = match last_seq {
            Some(since) => match state.log.replay_since(since) {
                Ok(ops) => SyncState::Replay(ops),
                Err(e) => {
                    log::debug!("Room {}: {connection} gets a snapshot: {e}", self.key);
                    SyncState::Snapshot(state.tree.clone())
                }
            },
            None => SyncState::Snapshot(state.tree.clone()),
        };
        let welcome = state.welcome(connection, client, sync);
        state
            .outboxes
            .send_to(connection, Arc::new(ServerMessage::Welcome(welcome)));

        state.presence.insert(connection, presence, now);
        state.members.insert(connection, Member { client, last_seen: now });
        let record = state.presence.get(connection).cloned().unwrap_or_default();
        let origin = state.origin(connection, client);
        state.announce(origin, OpPayload::ConnectionJoined { presence: record });

        log::info!(
            "{connection} ({client}) joined room {} ({} attached)",
            self.key,
            state.members.len()
        );
        Ok(Attached { connection, inbox })
    }

    /// Handle one client submission.
    ///
    /// Errors only when the connection is not attached; refusals are
    /// reported as [`Submitted::Rejected`] and sent to the origin.
    pub async fn submit(
        &self,
        connection: ConnectionId,
        client_op: ClientOpId,
        base_seq: Seq,
        payload: OpPayload,
        now: Instant,
    ) -> Result<Submitted, SyncError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(member) = state.members.get_mut(&connection) else {
            return Err(SyncError::TransientDisconnect(format!(
                "{connection} is not attached to room {}",
                self.key
            )));
        };
        member.last_seen = now;
        let client = member.client;
        let head = state.log.head();

        if state.acked.get(&client).is_some_and(|max| client_op <= *max) {
            log::debug!("Room {}: duplicate submission #{client_op} from {client}", self.key);
            state
                .outboxes
                .send_to(connection, Arc::new(ServerMessage::Ack { client_op, seq: head }));
            return Ok(Submitted::Duplicate);
        }

        let origin = Origin {
            connection,
            client,
            client_op,
            base_seq,
        };
        let outcome = if base_seq > head {
            Err(SyncError::OperationRejected(format!(
                "base sequence {base_seq} is ahead of the room head {head}"
            )))
        } else {
            match payload {
                OpPayload::Storage(op) => op
                    .validate()
                    .map_err(SyncError::from)
                    .and_then(|()| state.sequence_storage(origin, op)),
                OpPayload::Presence(partial) => Ok(state.update_presence(origin, partial, now)),
                OpPayload::Event(event) => {
                    events::validate(&event).and_then(|()| state.sequence_event(origin, event))
                }
                OpPayload::ConnectionJoined { .. } | OpPayload::ConnectionLeft => Err(
                    SyncError::OperationRejected("connection announcements are server-generated".into()),
                ),
            }
        };

        match outcome {
            Ok(submitted) => {
                oplog::record_ack(&mut state.acked, client, client_op);
                Ok(submitted)
            }
            Err(error) => {
                log::warn!(
                    "Room {}: rejected submission #{client_op} from {connection}: {error}",
                    self.key
                );
                state.outboxes.send_to(
                    connection,
                    Arc::new(ServerMessage::Rejected {
                        client_op,
                        error: error.clone(),
                    }),
                );
                Ok(Submitted::Rejected(error))
            }
        }
    }

    /// Broadcast an event on behalf of the server (or of `origin`, which is
    /// then skipped). Returns its sequence number.
    pub async fn broadcast_event(
        &self,
        origin: Option<ConnectionId>,
        event: EventPayload,
    ) -> Result<Seq, SyncError> {
        events::validate(&event)?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let connection = origin.unwrap_or(ConnectionId::SERVER);
        let client = state
            .members
            .get(&connection)
            .map_or(ClientId::SERVER, |m| m.client);
        let stamped = state.origin(connection, client);
        let op = state.log.sequence(stamped, OpPayload::Event(event))?;
        let seq = op.seq;
        let delivery = events::deliver(&state.outboxes, op, origin);
        log::debug!(
            "Room {}: event #{seq} delivered to {} connections",
            self.key,
            delivery.delivered
        );
        Ok(seq)
    }

    /// Detach a connection and drop its presence. Returns `false` when it
    /// was already detached.
    pub async fn leave(&self, connection: ConnectionId) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.outboxes.detach(connection) {
            return false;
        }
        state.presence.remove(connection);
        let client = state
            .members
            .remove(&connection)
            .map_or(ClientId::SERVER, |m| m.client);
        let origin = state.origin(connection, client);
        state.announce(origin, OpPayload::ConnectionLeft);
        log::info!(
            "{connection} left room {} ({} attached)",
            self.key,
            state.members.len()
        );
        true
    }

    /// Record a heartbeat and answer it. `false` if not attached.
    pub async fn heartbeat(&self, connection: ConnectionId, now: Instant) -> bool {
        let mut state = self.state.lock().await;
        let Some(member) = state.members.get_mut(&connection) else {
            return false;
        };
        member.last_seen = now;
        state.outboxes.send_to(connection, Arc::new(ServerMessage::Pong));
        true
    }

    /// Connections silent for longer than the heartbeat timeout.
    pub async fn expired(&self, now: Instant) -> Vec<ConnectionId> {
        let state = self.state.lock().await;
        let timeout = self.config.heartbeat_timeout;
        let mut silent: Vec<ConnectionId> = state
            .members
            .iter()
            .filter(|(_, m)| now.saturating_duration_since(m.last_seen) > timeout)
            .map(|(conn, _)| *conn)
            .collect();
        silent.sort();
        silent
    }

    /// Emit trailing presence updates whose window has closed.
    pub async fn flush_presence(&self, now: Instant) -> usize {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let due = state.presence.due(now);
        for conn in &due {
            let client = state.members.get(conn).map_or(ClientId::SERVER, |m| m.client);
            let origin = state.origin(*conn, client);
            state.emit_presence(origin);
        }
        due.len()
    }

    /// Send a lagging connection a fresh snapshot and reopen its outbox.
    pub async fn resync(&self, connection: ConnectionId) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(member) = state.members.get(&connection).copied() else {
            return false;
        };
        state.outboxes.clear_lag(connection);
        let welcome = state.welcome(
            connection,
            member.client,
            SyncState::Snapshot(state.tree.clone()),
        );
        state
            .outboxes
            .send_to(connection, Arc::new(ServerMessage::Welcome(welcome)));
        log::info!(
            "Room {}: resynced lagging {connection} at {}",
            self.key,
            state.log.head()
        );
        true
    }

    /// Write the snapshot and compact the log before the room is dropped.
    pub async fn teardown(&self) -> Result<(), SyncError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.log.persist_snapshot(&state.tree, &state.acked)?;
        log::info!("Room {} torn down at {}", self.key, state.log.head());
        Ok(())
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    pub async fn head(&self) -> Seq {
        self.state.lock().await.log.head()
    }

    /// Plain form of the authoritative document.
    pub async fn export(&self) -> Value {
        self.state.lock().await.tree.export()
    }

    pub async fn snapshot(&self) -> StorageTree {
        self.state.lock().await.tree.clone()
    }

    pub async fn presence(&self, connection: ConnectionId) -> Option<PresenceRecord> {
        self.state.lock().await.presence.get(connection).cloned()
    }

    pub async fn presence_list(&self) -> Vec<(ConnectionId, PresenceRecord)> {
        self.state.lock().await.presence.list()
    }

    pub async fn stats(&self) -> RoomStats {
        let state = self.state.lock().await;
        RoomStats {
            connections: state.members.len(),
            head: state.log.head(),
            horizon: state.log.horizon(),
            retained_ops: state.log.retained_len(),
            broadcast: state.outboxes.stats(),
        }
    }
}

impl RoomState {
    fn origin(&self, connection: ConnectionId, client: ClientId) -> Origin {
        Origin {
            connection,
            client,
            client_op: 0,
            base_seq: self.log.head(),
        }
    }

    fn welcome(&self, connection: ConnectionId, client: ClientId, sync: SyncState) -> Welcome {
        Welcome {
            connection,
            seq: self.log.head(),
            sync,
            presence: self
                .presence
                .list()
                .into_iter()
                .filter(|(conn, _)| *conn != connection)
                .collect(),
            acked_client_op: self.acked.get(&client).copied(),
        }
    }

    /// Sequence a server-generated operation and send it to everyone but
    /// its subject.
    fn announce(&mut self, origin: Origin, payload: OpPayload) {
        match self.log.sequence(origin, payload) {
            Ok(op) => {
                self.outboxes
                    .broadcast(Arc::new(ServerMessage::Op(op)), Some(origin.connection));
            }
            Err(e) => log::error!("Failed to sequence announcement for {}: {e}", origin.connection),
        }
    }

    fn sequence_storage(&mut self, origin: Origin, op: StorageOp) -> Result<Submitted, SyncError> {
        let op = self.log.sequence(origin, OpPayload::Storage(op))?;
        if let OpPayload::Storage(storage_op) = &op.payload {
            let outcome = self.tree.apply(storage_op, op.stamp());
            log::debug!("Storage op #{} ({}) -> {outcome:?}", op.seq, storage_op.kind());
        }
        let seq = op.seq;
        // The origin's copy is its acknowledgment.
        self.outboxes.broadcast(Arc::new(ServerMessage::Op(op)), None);
        Ok(Submitted::Sequenced(seq))
    }

    fn update_presence(&mut self, origin: Origin, partial: PresenceRecord, now: Instant) -> Submitted {
        match self
            .presence
            .set(origin.connection, partial, Some(origin.client_op), now)
        {
            Some(PresenceUpdate::Emit) => self
                .emit_presence(origin)
                .map_or(Submitted::Deferred, Submitted::Sequenced),
            Some(PresenceUpdate::Deferred) | None => Submitted::Deferred,
        }
    }

    /// Broadcast the full record of `origin.connection` and acknowledge the
    /// submissions folded into it.
    fn emit_presence(&mut self, origin: Origin) -> Option<Seq> {
        let conn = origin.connection;
        let record = self.presence.get(conn)?.clone();
        let acked = self.presence.take_ack(conn);
        let origin = Origin {
            client_op: acked.unwrap_or(0),
            ..origin
        };
        let op = match self.log.sequence(origin, OpPayload::Presence(record)) {
            Ok(op) => op,
            Err(e) => {
                log::error!("Failed to sequence presence of {conn}: {e}");
                return None;
            }
        };
        let seq = op.seq;
        self.outboxes.broadcast(Arc::new(ServerMessage::Op(op)), Some(conn));
        if let Some(client_op) = acked {
            self.outboxes
                .send_to(conn, Arc::new(ServerMessage::Ack { client_op, seq }));
        }
        log::trace!("presence of {conn} emitted as #{seq}");
        Some(seq)
    }

    fn sequence_event(&mut self, origin: Origin, event: EventPayload) -> Result<Submitted, SyncError> {
        let op = self.log.sequence(origin, OpPayload::Event(event))?;
        let seq = op.seq;
        events::deliver(&self.outboxes, op, Some(origin.connection));
        self.outboxes.send_to(
            origin.connection,
            Arc::new(ServerMessage::Ack {
                client_op: origin.client_op,
                seq,
            }),
        );
        Ok(Submitted::Sequenced(seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::InboxPoll;
    use crate::storage::MemoryStore;
    use crate::tree::{NodeRef, Seed};
    use std::time::Duration;

    fn room() -> Room {
        Room::load("board".into(), Arc::new(MemoryStore::new()), EngineConfig::for_testing()).unwrap()
    }

    fn drain(inbox: &mut Inbox) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let InboxPoll::Message(msg) = inbox.try_recv() {
            out.push((*msg).clone());
        }
        out
    }

    fn set_root(key: &str, v: i64) -> OpPayload {
        OpPayload::Storage(StorageOp::Set {
            target: NodeRef::root(),
            key: key.into(),
            value: Seed::from_value(&Value::from(v)),
        })
    }

    fn named(name: &str) -> PresenceRecord {
        [("name".to_string(), Value::from(name))].into_iter().collect()
    }

    #[tokio::test]
    async fn test_join_welcome_and_announcement() {
        let room = room();
        let now = Instant::now();
        let mut a = room.join(ClientId::new(), named("ana"), None, now).await.unwrap();
        let mut b = room.join(ClientId::new(), named("bo"), None, now).await.unwrap();

        let a_msgs = drain(&mut a.inbox);
        assert!(matches!(&a_msgs[0], ServerMessage::Welcome(w) if w.presence.is_empty()));
        assert!(matches!(
            &a_msgs[1],
            ServerMessage::Op(op) if op.origin == b.connection
                && matches!(op.payload, OpPayload::ConnectionJoined { .. })
        ));

        match &drain(&mut b.inbox)[0] {
            ServerMessage::Welcome(w) => {
                assert_eq!(w.connection, b.connection);
                assert_eq!(w.seq, 1);
                assert_eq!(w.presence, vec![(a.connection, named("ana"))]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_storage_op_reaches_everyone() {
        let room = room();
        let now = Instant::now();
        let mut a = room.join(ClientId::new(), PresenceRecord::new(), None, now).await.unwrap();
        let mut b = room.join(ClientId::new(), PresenceRecord::new(), None, now).await.unwrap();
        drain(&mut a.inbox);
        drain(&mut b.inbox);

        let submitted = room.submit(a.connection, 1, 2, set_root("x", 5), now).await.unwrap();
        assert_eq!(submitted, Submitted::Sequenced(3));
        assert_eq!(room.export().await, Value::object([("x", Value::from(5))]));

        for inbox in [&mut a.inbox, &mut b.inbox] {
            let msgs = drain(inbox);
            assert!(matches!(&msgs[..], [ServerMessage::Op(op)] if op.seq == 3 && op.client_op == 1));
        }
    }

    #[tokio::test]
    async fn test_rejections_and_duplicates() {
        let room = room();
        let now = Instant::now();
        let mut a = room.join(ClientId::new(), PresenceRecord::new(), None, now).await.unwrap();
        drain(&mut a.inbox);

        let ahead = room.submit(a.connection, 1, 99, set_root("x", 1), now).await.unwrap();
        assert!(matches!(ahead, Submitted::Rejected(SyncError::OperationRejected(_))));
        let forged = room
            .submit(a.connection, 2, 0, OpPayload::ConnectionLeft, now)
            .await
            .unwrap();
        assert!(matches!(forged, Submitted::Rejected(_)));
        assert_eq!(drain(&mut a.inbox).len(), 2);

        assert!(matches!(
            room.submit(a.connection, 3, 1, set_root("x", 1), now).await.unwrap(),
            Submitted::Sequenced(_)
        ));
        assert_eq!(
            room.submit(a.connection, 3, 1, set_root("x", 1), now).await.unwrap(),
            Submitted::Duplicate
        );
        let msgs = drain(&mut a.inbox);
        assert!(matches!(msgs.last(), Some(ServerMessage::Ack { client_op: 3, seq: 2 })));
        assert_eq!(room.head().await, 2);
    }

    #[tokio::test]
    async fn test_capacity_makes_room_unavailable() {
        let room = room();
        let now = Instant::now();
        let mut attached = Vec::new();
        for _ in 0..EngineConfig::for_testing().max_connections_per_room {
            attached.push(room.join(ClientId::new(), PresenceRecord::new(), None, now).await.unwrap());
        }
        let err = room.join(ClientId::new(), PresenceRecord::new(), None, now).await.unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_leave_is_idempotent_and_announced() {
        let room = room();
        let now = Instant::now();
        let mut a = room.join(ClientId::new(), named("ana"), None, now).await.unwrap();
        let b = room.join(ClientId::new(), named("bo"), None, now).await.unwrap();
        drain(&mut a.inbox);

        assert!(room.leave(b.connection).await);
        assert!(!room.leave(b.connection).await);
        assert!(room.presence(b.connection).await.is_none());
        let msgs = drain(&mut a.inbox);
        assert!(matches!(
            &msgs[..],
            [ServerMessage::Op(op)] if op.payload == OpPayload::ConnectionLeft
        ));
        assert!(room.submit(b.connection, 1, 0, set_root("x", 1), now).await.is_err());
    }

    #[tokio::test]
    async fn test_presence_coalescing_acks_latest() {
        let room = room();
        let t0 = Instant::now();
        let mut a = room.join(ClientId::new(), PresenceRecord::new(), None, t0).await.unwrap();
        let mut b = room.join(ClientId::new(), PresenceRecord::new(), None, t0).await.unwrap();
        drain(&mut a.inbox);
        drain(&mut b.inbox);

        let t1 = t0 + Duration::from_millis(50);
        let cursor = |x: i64| OpPayload::Presence([("x".to_string(), Value::from(x))].into_iter().collect());
        assert!(matches!(room.submit(a.connection, 1, 2, cursor(1), t1).await.unwrap(), Submitted::Sequenced(_)));
        assert_eq!(room.submit(a.connection, 2, 2, cursor(2), t1).await.unwrap(), Submitted::Deferred);
        assert_eq!(room.submit(a.connection, 3, 2, cursor(3), t1).await.unwrap(), Submitted::Deferred);
        assert_eq!(room.flush_presence(t1 + Duration::from_millis(50)).await, 1);

        let seen = drain(&mut b.inbox);
        assert_eq!(seen.len(), 2);
        assert!(matches!(
            &seen[1],
            ServerMessage::Op(op) if op.payload == cursor(3)
        ));
        let acks = drain(&mut a.inbox);
        assert!(matches!(&acks[..], [ServerMessage::Ack { client_op: 1, .. }, ServerMessage::Ack { client_op: 3, .. }]));
    }

    #[tokio::test]
    async fn test_event_not_seen_by_late_joiner() {
        let room = room();
        let now = Instant::now();
        let mut a = room.join(ClientId::new(), PresenceRecord::new(), None, now).await.unwrap();
        drain(&mut a.inbox);
        room.broadcast_event(None, EventPayload::new("confetti", Value::Null)).await.unwrap();
        assert!(matches!(&drain(&mut a.inbox)[..], [ServerMessage::Op(_)]));

        let mut late = room.join(ClientId::new(), PresenceRecord::new(), Some(0), now).await.unwrap();
        match &drain(&mut late.inbox)[0] {
            ServerMessage::Welcome(w) => assert_eq!(w.sync, SyncState::Replay(Vec::new())),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lagging_connection_gets_snapshot() {
        let mut config = EngineConfig::for_testing();
        config.outbox_capacity = 2;
        let room = Room::load("r".into(), Arc::new(MemoryStore::new()), config).unwrap();
        let now = Instant::now();
        let mut a = room.join(ClientId::new(), PresenceRecord::new(), None, now).await.unwrap();
        let b = room.join(ClientId::new(), PresenceRecord::new(), None, now).await.unwrap();

        for i in 0..4 {
            room.submit(b.connection, i + 1, 0, set_root("k", i as i64), now).await.unwrap();
        }
        assert!(a.inbox.is_lagged());
        drain(&mut a.inbox);
        assert!(matches!(a.inbox.try_recv(), InboxPoll::Lagged));

        assert!(room.resync(a.connection).await);
        match &drain(&mut a.inbox)[..] {
            [ServerMessage::Welcome(w)] => match &w.sync {
                SyncState::Snapshot(tree) => {
                    assert_eq!(tree.export(), Value::object([("k", Value::from(3))]))
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expired_connections() {
        let room = room();
        let t0 = Instant::now();
        let a = room.join(ClientId::new(), PresenceRecord::new(), None, t0).await.unwrap();
        let b = room.join(ClientId::new(), PresenceRecord::new(), None, t0).await.unwrap();
        let later = t0 + Duration::from_secs(4);
        assert!(room.heartbeat(b.connection, later).await);
        assert_eq!(room.expired(later + Duration::from_secs(2)).await, vec![a.connection]);
    }
}
