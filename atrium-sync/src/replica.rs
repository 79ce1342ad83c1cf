//! Client-side replica with optimistic writes.
//!
//! ```text
//!   local mutation ──► pending log ──► outgoing Submit ──► server
//!          │                                                  │
//!          ▼                                                  ▼
//!        view  ◄── reconcile(confirmed, pending) ◄── confirmed ◄── Op (seq order)
//! ```
//!
//! `confirmed` holds exactly the sequenced prefix. `view` is always
//! `reconcile(confirmed, pending)`: every unacknowledged local operation
//! replayed on top, stamped as if sequenced after everything confirmed.
//! An acknowledged or rejected operation leaves the pending log and the
//! view is recomputed, so a rejected write rolls back on its own.
//!
//! Reference: Shapiro et al., "Conflict-free Replicated Data Types" (2011)

use std::collections::{BTreeMap, VecDeque};

use crate::error::SyncError;
use crate::events;
use crate::protocol::{
    ClientId, ClientMessage, ClientOpId, ConnectionId, EventPayload, OpPayload, PresenceRecord,
    RoomKey, Seq, ServerMessage, SyncState, Welcome,
};
use crate::tree::{
    ElementId, ListNode, MapNode, Node, NodePath, NodeRef, ObjectNode, Seed, Stamp, StorageOp,
    StorageTree, Value,
};

/// A local storage operation not yet sequenced.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOp {
    pub client_op: ClientOpId,
    pub base_seq: Seq,
    pub op: StorageOp,
}

/// What a server message changed, for the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaEvent {
    /// A `Welcome` was applied.
    Synced { connection: ConnectionId, seq: Seq },
    /// The confirmed tree advanced.
    StorageChanged { seq: Seq },
    /// Another connection's presence changed; `None` when it left.
    PresenceChanged {
        connection: ConnectionId,
        record: Option<PresenceRecord>,
    },
    Event {
        from: ConnectionId,
        event: EventPayload,
    },
    /// A local submission was refused and rolled back.
    Rejected {
        client_op: ClientOpId,
        error: SyncError,
    },
    /// The server refused the session.
    Unavailable(SyncError),
}

/// The optimistic view: `pending` replayed on top of `confirmed`.
///
/// Pending operation `i` is stamped `confirmed_seq + 1 + i` with its own
/// base sequence, so it wins every last-write-wins comparison against the
/// confirmed state but still yields to deletions it had not observed.
pub fn reconcile(confirmed: &StorageTree, pending: &[PendingOp], confirmed_seq: Seq) -> StorageTree {
    let mut view = confirmed.clone();
    for (i, p) in pending.iter().enumerate() {
        view.apply(&p.op, speculative_stamp(confirmed_seq, i, p.base_seq));
    }
    view
}

fn speculative_stamp(confirmed_seq: Seq, index: usize, base_seq: Seq) -> Stamp {
    Stamp::new(confirmed_seq + 1 + index as Seq, base_seq)
}

pub struct Replica {
    client: ClientId,
    connection: Option<ConnectionId>,
    synced: bool,
    last_seq: Seq,
    confirmed: StorageTree,
    view: StorageTree,
    pending: Vec<PendingOp>,
    outgoing: VecDeque<ClientMessage>,
    next_client_op: ClientOpId,
    presence: PresenceRecord,
    others: BTreeMap<ConnectionId, PresenceRecord>,
}

impl Replica {
    pub fn new(client: ClientId) -> Self {
        Self {
            client,
            connection: None,
            synced: false,
            last_seq: 0,
            confirmed: StorageTree::new(),
            view: StorageTree::new(),
            pending: Vec::new(),
            outgoing: VecDeque::new(),
            next_client_op: 1,
            presence: PresenceRecord::new(),
            others: BTreeMap::new(),
        }
    }

    pub fn with_presence(mut self, presence: PresenceRecord) -> Self {
        self.presence = presence;
        self.presence.retain(|_, v| *v != Value::Null);
        self
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Connection id of the current session, if any.
    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// Highest sequence observed.
    pub fn last_seq(&self) -> Seq {
        self.last_seq
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// The optimistic document.
    pub fn view(&self) -> &StorageTree {
        &self.view
    }

    /// The sequenced prefix only.
    pub fn confirmed(&self) -> &StorageTree {
        &self.confirmed
    }

    pub fn pending(&self) -> &[PendingOp] {
        &self.pending
    }

    /// Plain form of the optimistic document.
    pub fn export(&self) -> Value {
        self.view.export()
    }

    pub fn get(&self, path: &NodePath) -> Option<Value> {
        self.view.get(path).map(Node::to_value)
    }

    // ─── Mutation handles ────────────────────────────────────────────

    pub fn root(&mut self) -> ObjectHandle<'_> {
        ObjectHandle {
            replica: self,
            path: NodePath::root(),
        }
    }

    pub fn object(&mut self, path: impl Into<NodePath>) -> Option<ObjectHandle<'_>> {
        let path = path.into();
        if !path.is_root() {
            self.view.get(&path)?.as_object()?;
        }
        Some(ObjectHandle { replica: self, path })
    }

    pub fn map(&mut self, path: impl Into<NodePath>) -> Option<MapHandle<'_>> {
        let path = path.into();
        self.view.get(&path)?.as_map()?;
        Some(MapHandle { replica: self, path })
    }

    pub fn list(&mut self, path: impl Into<NodePath>) -> Option<ListHandle<'_>> {
        let path = path.into();
        self.view.get(&path)?.as_list()?;
        Some(ListHandle { replica: self, path })
    }

    /// Apply a storage operation locally and queue it for the server.
    pub fn submit_storage(&mut self, op: StorageOp) -> Result<ClientOpId, SyncError> {
        op.validate()?;
        let client_op = self.next_op();
        let base_seq = self.last_seq;
        let stamp = speculative_stamp(self.last_seq, self.pending.len(), base_seq);
        self.view.apply(&op, stamp);
        self.outgoing.push_back(ClientMessage::Submit {
            client_op,
            base_seq,
            payload: OpPayload::Storage(op.clone()),
        });
        self.pending.push(PendingOp {
            client_op,
            base_seq,
            op,
        });
        Ok(client_op)
    }

    fn target(&self, path: &NodePath) -> Result<NodeRef, SyncError> {
        self.view
            .node_ref(path)
            .ok_or_else(|| SyncError::OperationRejected(format!("no node at {path}")))
    }

    fn next_op(&mut self) -> ClientOpId {
        let id = self.next_client_op;
        self.next_client_op += 1;
        id
    }

    // ─── Presence and events ─────────────────────────────────────────

    /// Merge into this connection's presence; `Null` removes a key.
    pub fn set_presence(&mut self, partial: PresenceRecord) -> ClientOpId {
        for (key, value) in &partial {
            if *value == Value::Null {
                self.presence.remove(key);
            } else {
                self.presence.insert(key.clone(), value.clone());
            }
        }
        let client_op = self.next_op();
        self.outgoing.push_back(ClientMessage::Submit {
            client_op,
            base_seq: self.last_seq,
            payload: OpPayload::Presence(partial),
        });
        client_op
    }

    pub fn presence(&self) -> &PresenceRecord {
        &self.presence
    }

    /// Presence of the other attached connections.
    pub fn others(&self) -> &BTreeMap<ConnectionId, PresenceRecord> {
        &self.others
    }

    /// Queue a one-shot event.
    pub fn emit(&mut self, kind: impl Into<String>, data: Value) -> Result<ClientOpId, SyncError> {
        let event = EventPayload::new(kind, data);
        events::validate(&event)?;
        let client_op = self.next_op();
        self.outgoing.push_back(ClientMessage::Submit {
            client_op,
            base_seq: self.last_seq,
            payload: OpPayload::Event(event),
        });
        Ok(client_op)
    }

    // ─── Session ─────────────────────────────────────────────────────

    pub fn join_message(&self, room: RoomKey, token: Option<String>) -> ClientMessage {
        ClientMessage::Join {
            room,
            client: self.client,
            token,
            presence: self.presence.clone(),
            last_seq: self.synced.then_some(self.last_seq),
        }
    }

    /// Messages waiting to be sent, in submission order.
    pub fn take_outgoing(&mut self) -> Vec<ClientMessage> {
        self.outgoing.drain(..).collect()
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// The session ended. Queued presence is carried by the next `Join`;
    /// queued events are dropped; pending storage is resubmitted on `Welcome`.
    pub fn disconnected(&mut self) {
        let dropped = self
            .outgoing
            .iter()
            .filter(|m| matches!(m, ClientMessage::Submit { payload: OpPayload::Event(_), .. }))
            .count();
        if dropped > 0 {
            log::debug!("Dropping {dropped} unsent events after disconnect");
        }
        self.outgoing.clear();
        self.connection = None;
        self.others.clear();
    }

    /// Apply one server message.
    pub fn receive(&mut self, msg: &ServerMessage) -> Vec<ReplicaEvent> {
        match msg {
            ServerMessage::Welcome(welcome) => self.welcome(welcome),
            ServerMessage::Op(op) => {
                if self.synced && op.seq <= self.last_seq {
                    return Vec::new();
                }
                self.last_seq = op.seq;
                let event = match &op.payload {
                    OpPayload::Storage(storage_op) => {
                        self.confirmed.apply(storage_op, op.stamp());
                        if op.client == self.client {
                            self.pending.retain(|p| p.client_op != op.client_op);
                        }
                        self.rebuild_view();
                        ReplicaEvent::StorageChanged { seq: op.seq }
                    }
                    OpPayload::Presence(record) | OpPayload::ConnectionJoined { presence: record } => {
                        self.others.insert(op.origin, record.clone());
                        ReplicaEvent::PresenceChanged {
                            connection: op.origin,
                            record: Some(record.clone()),
                        }
                    }
                    OpPayload::ConnectionLeft => {
                        self.others.remove(&op.origin);
                        ReplicaEvent::PresenceChanged {
                            connection: op.origin,
                            record: None,
                        }
                    }
                    OpPayload::Event(event) => ReplicaEvent::Event {
                        from: op.origin,
                        event: event.clone(),
                    },
                };
                vec![event]
            }
            ServerMessage::Ack { client_op, seq } => {
                self.last_seq = self.last_seq.max(*seq);
                if self.drop_pending(|p| p.client_op == *client_op) {
                    self.rebuild_view();
                }
                Vec::new()
            }
            ServerMessage::Rejected { client_op, error } => {
                log::warn!("Submission #{client_op} rejected: {error}");
                if self.drop_pending(|p| p.client_op == *client_op) {
                    self.rebuild_view();
                }
                vec![ReplicaEvent::Rejected {
                    client_op: *client_op,
                    error: error.clone(),
                }]
            }
            ServerMessage::Unavailable { error } => vec![ReplicaEvent::Unavailable(error.clone())],
            ServerMessage::Pong => Vec::new(),
        }
    }

    fn welcome(&mut self, welcome: &Welcome) -> Vec<ReplicaEvent> {
        match &welcome.sync {
            SyncState::Snapshot(tree) => self.confirmed = tree.clone(),
            SyncState::Replay(ops) => {
                for op in ops.iter().filter(|op| op.seq > self.last_seq) {
                    if let OpPayload::Storage(storage_op) = &op.payload {
                        self.confirmed.apply(storage_op, op.stamp());
                    }
                }
            }
        }
        self.synced = true;
        self.last_seq = welcome.seq;
        self.connection = Some(welcome.connection);
        self.others = welcome.presence.iter().cloned().collect();

        if let Some(acked) = welcome.acked_client_op {
            self.drop_pending(|p| p.client_op <= acked);
        }

        // Resubmit what is still pending, keeping submission order so the
        // server's per-client dedupe sees increasing ids.
        let mut queue: Vec<ClientMessage> = self
            .outgoing
            .drain(..)
            .filter(|m| !matches!(m, ClientMessage::Submit { payload: OpPayload::Storage(_), .. }))
            .collect();
        queue.extend(self.pending.iter().map(|p| ClientMessage::Submit {
            client_op: p.client_op,
            base_seq: p.base_seq,
            payload: OpPayload::Storage(p.op.clone()),
        }));
        queue.sort_by_key(|m| match m {
            ClientMessage::Submit { client_op, .. } => *client_op,
            _ => 0,
        });
        if !self.pending.is_empty() {
            log::info!("Resubmitting {} pending operations", self.pending.len());
        }
        self.outgoing = queue.into();
        self.rebuild_view();

        vec![
            ReplicaEvent::Synced {
                connection: welcome.connection,
                seq: welcome.seq,
            },
            ReplicaEvent::StorageChanged { seq: welcome.seq },
        ]
    }

    fn drop_pending(&mut self, pred: impl Fn(&PendingOp) -> bool) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| !pred(p));
        self.pending.len() != before
    }

    fn rebuild_view(&mut self) {
        self.view = reconcile(&self.confirmed, &self.pending, self.last_seq);
    }
}

// ─── Handles ─────────────────────────────────────────────────────────

fn out_of_bounds(index: usize, len: usize) -> SyncError {
    SyncError::OperationRejected(format!("index {index} out of bounds (length {len})"))
}

/// Mutable handle on an object node of a [`Replica`].
pub struct ObjectHandle<'a> {
    replica: &'a mut Replica,
    path: NodePath,
}

impl<'a> ObjectHandle<'a> {
    fn node(&self) -> Option<&ObjectNode> {
        if self.path.is_root() {
            Some(self.replica.view.root())
        } else {
            self.replica.view.get(&self.path)?.as_object()
        }
    }

    pub fn path(&self) -> &NodePath {
        &self.path
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.node()?.get(field).map(Node::to_value)
    }

    pub fn keys(&self) -> Vec<String> {
        self.node()
            .map(|o| o.iter().map(|(k, _)| k.to_string()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.node().map_or(0, ObjectNode::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<ClientOpId, SyncError> {
        let target = self.replica.target(&self.path)?;
        self.replica.submit_storage(StorageOp::Set {
            target,
            key: field.to_string(),
            value: Seed::from_value(&value.into()),
        })
    }

    /// Write several fields as one operation.
    pub fn update<K: Into<String>>(
        &mut self,
        fields: impl IntoIterator<Item = (K, Value)>,
    ) -> Result<ClientOpId, SyncError> {
        let target = self.replica.target(&self.path)?;
        let fields = fields
            .into_iter()
            .map(|(k, v)| (k.into(), Seed::from_value(&v)))
            .collect();
        self.replica.submit_storage(StorageOp::Update { target, fields })
    }

    pub fn object(self, field: &str) -> Option<ObjectHandle<'a>> {
        let path = self.path.clone().key(field);
        self.replica.view.get(&path)?.as_object()?;
        Some(ObjectHandle {
            replica: self.replica,
            path,
        })
    }

    pub fn map(self, field: &str) -> Option<MapHandle<'a>> {
        let path = self.path.clone().key(field);
        self.replica.view.get(&path)?.as_map()?;
        Some(MapHandle {
            replica: self.replica,
            path,
        })
    }

    pub fn list(self, field: &str) -> Option<ListHandle<'a>> {
        let path = self.path.clone().key(field);
        self.replica.view.get(&path)?.as_list()?;
        Some(ListHandle {
            replica: self.replica,
            path,
        })
    }
}

/// Mutable handle on a map node of a [`Replica`].
pub struct MapHandle<'a> {
    replica: &'a mut Replica,
    path: NodePath,
}

impl<'a> MapHandle<'a> {
    fn node(&self) -> Option<&MapNode> {
        self.replica.view.get(&self.path)?.as_map()
    }

    pub fn path(&self) -> &NodePath {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.node()?.get(key).map(Node::to_value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.node().is_some_and(|m| m.contains(key))
    }

    pub fn len(&self) -> usize {
        self.node().map_or(0, MapNode::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.node()
            .map(|m| m.keys().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        self.node()
            .map(|m| m.iter().map(|(k, n)| (k.to_string(), n.to_value())).collect())
            .unwrap_or_default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<ClientOpId, SyncError> {
        let target = self.replica.target(&self.path)?;
        self.replica.submit_storage(StorageOp::Set {
            target,
            key: key.to_string(),
            value: Seed::from_value(&value.into()),
        })
    }

    pub fn delete(&mut self, key: &str) -> Result<ClientOpId, SyncError> {
        let target = self.replica.target(&self.path)?;
        self.replica.submit_storage(StorageOp::Delete {
            target,
            key: key.to_string(),
        })
    }

    pub fn object(self, key: &str) -> Option<ObjectHandle<'a>> {
        let path = self.path.clone().key(key);
        self.replica.view.get(&path)?.as_object()?;
        Some(ObjectHandle {
            replica: self.replica,
            path,
        })
    }

    pub fn list(self, key: &str) -> Option<ListHandle<'a>> {
        let path = self.path.clone().key(key);
        self.replica.view.get(&path)?.as_list()?;
        Some(ListHandle {
            replica: self.replica,
            path,
        })
    }
}

/// Mutable handle on a list node of a [`Replica`].
pub struct ListHandle<'a> {
    replica: &'a mut Replica,
    path: NodePath,
}

impl<'a> ListHandle<'a> {
    fn node(&self) -> Option<&ListNode> {
        self.replica.view.get(&self.path)?.as_list()
    }

    fn require(&self) -> Result<(&ListNode, NodeRef), SyncError> {
        let target = self.replica.target(&self.path)?;
        let list = self
            .node()
            .ok_or_else(|| SyncError::OperationRejected(format!("no list at {}", self.path)))?;
        Ok((list, target))
    }

    pub fn path(&self) -> &NodePath {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.node().map_or(0, ListNode::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.node()?.get(index).map(Node::to_value)
    }

    pub fn element_at(&self, index: usize) -> Option<ElementId> {
        self.node()?.element_at(index)
    }

    /// Value of an element wherever it currently sits.
    pub fn get_by_element(&self, element: &ElementId) -> Option<Value> {
        self.node()?.get_by_element(element).map(Node::to_value)
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.node()
            .map(|l| l.iter().map(Node::to_value).collect())
            .unwrap_or_default()
    }

    /// Insert so the new element lands at `index`.
    pub fn insert(&mut self, index: usize, value: impl Into<Value>) -> Result<ClientOpId, SyncError> {
        let (list, target) = self.require()?;
        if index > list.len() {
            return Err(out_of_bounds(index, list.len()));
        }
        let element = ElementId::new();
        let key = list.key_for_insert(index, &element);
        self.replica.submit_storage(StorageOp::Insert {
            target,
            element,
            key,
            value: Seed::from_value(&value.into()),
        })
    }

    pub fn push(&mut self, value: impl Into<Value>) -> Result<ClientOpId, SyncError> {
        let len = self.len();
        self.insert(len, value)
    }

    pub fn delete(&mut self, index: usize) -> Result<ClientOpId, SyncError> {
        let (list, target) = self.require()?;
        let element = list
            .element_at(index)
            .ok_or_else(|| out_of_bounds(index, list.len()))?;
        self.replica
            .submit_storage(StorageOp::Remove { target, element })
    }

    /// Move the element at `from` so it ends up at index `to`.
    pub fn move_item(&mut self, from: usize, to: usize) -> Result<ClientOpId, SyncError> {
        let (list, target) = self.require()?;
        let element = list
            .element_at(from)
            .ok_or_else(|| out_of_bounds(from, list.len()))?;
        if to >= list.len() {
            return Err(out_of_bounds(to, list.len()));
        }
        let key = list.key_for_move(from, to);
        self.replica
            .submit_storage(StorageOp::Move { target, element, key })
    }

    /// Replace the value of the element at `index`.
    pub fn set(&mut self, index: usize, value: impl Into<Value>) -> Result<ClientOpId, SyncError> {
        let (list, target) = self.require()?;
        let element = list
            .element_at(index)
            .ok_or_else(|| out_of_bounds(index, list.len()))?;
        self.replica.submit_storage(StorageOp::SetItem {
            target,
            element,
            value: Seed::from_value(&value.into()),
        })
    }

    pub fn object_at(self, index: usize) -> Option<ObjectHandle<'a>> {
        let element = self.element_at(index)?;
        let path = self.path.clone().element(element);
        self.replica.view.get(&path)?.as_object()?;
        Some(ObjectHandle {
            replica: self.replica,
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Operation;

    /// Turn the replica's next outgoing submission into the operation the
    /// server would sequence.
    fn sequence(replica: &mut Replica, origin: ConnectionId, seq: Seq) -> Operation {
        match replica.take_outgoing().remove(0) {
            ClientMessage::Submit {
                client_op,
                base_seq,
                payload,
            } => Operation {
                room: "r".into(),
                origin,
                client: replica.client(),
                client_op,
                seq,
                base_seq,
                payload,
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    fn welcome(seq: Seq, sync: SyncState, acked: Option<ClientOpId>) -> ServerMessage {
        ServerMessage::Welcome(Welcome {
            connection: ConnectionId(1),
            seq,
            sync,
            presence: Vec::new(),
            acked_client_op: acked,
        })
    }

    fn synced() -> Replica {
        let mut replica = Replica::new(ClientId::new());
        replica.receive(&welcome(0, SyncState::Snapshot(StorageTree::new()), None));
        replica
    }

    #[test]
    fn test_local_write_is_visible_before_ack() {
        let mut replica = synced();
        replica.root().set("title", "draft").unwrap();
        assert_eq!(replica.get(&"title".into()), Some(Value::from("draft")));
        assert!(replica.confirmed().root().is_empty());
        assert_eq!(replica.pending().len(), 1);

        let op = sequence(&mut replica, ConnectionId(1), 1);
        replica.receive(&ServerMessage::Op(op));
        assert!(replica.pending().is_empty());
        assert_eq!(replica.view(), replica.confirmed());
    }

    #[test]
    fn test_pending_write_stays_on_top_of_remote_write() {
        let mut local = synced();
        let mut remote = synced();
        remote.root().set("x", 1).unwrap();
        local.root().set("x", 2).unwrap();

        let remote_op = sequence(&mut remote, ConnectionId(2), 1);
        local.receive(&ServerMessage::Op(remote_op));
        // Ours will be sequenced later and win.
        assert_eq!(local.get(&"x".into()), Some(Value::from(2)));
        assert_eq!(local.confirmed().export(), Value::object([("x", Value::from(1))]));
    }

    #[test]
    fn test_rejected_write_rolls_back() {
        let mut replica = synced();
        let id = replica.root().set("x", 1).unwrap();
        let events = replica.receive(&ServerMessage::Rejected {
            client_op: id,
            error: SyncError::PersistenceFailure("disk".into()),
        });
        assert!(matches!(&events[..], [ReplicaEvent::Rejected { .. }]));
        assert_eq!(replica.get(&"x".into()), None);
    }

    #[test]
    fn test_reconnect_resubmits_unacknowledged() {
        let mut replica = synced();
        replica.root().set("a", 1).unwrap();
        replica.root().set("b", 2).unwrap();
        replica.set_presence([("cursor".to_string(), Value::from(4))].into_iter().collect());
        replica.emit("ping", Value::Null).unwrap();
        replica.disconnected();
        assert!(!replica.has_outgoing());

        match replica.join_message("r".into(), None) {
            ClientMessage::Join { last_seq, presence, .. } => {
                assert_eq!(last_seq, Some(0));
                assert_eq!(presence["cursor"], Value::from(4));
            }
            other => panic!("unexpected {other:?}"),
        }

        // The server had sequenced the first write before the drop.
        let mut tree = StorageTree::new();
        tree.apply(&replica.pending()[0].op, Stamp::new(1, 0));
        replica.receive(&welcome(1, SyncState::Snapshot(tree), Some(1)));

        let resent = replica.take_outgoing();
        assert!(matches!(&resent[..], [ClientMessage::Submit { client_op: 2, .. }]));
        assert_eq!(
            replica.export(),
            Value::object([("a", Value::from(1)), ("b", Value::from(2))])
        );
    }

    #[test]
    fn test_replay_welcome_applies_gap() {
        let mut writer = synced();
        writer.root().set("k", "v").unwrap();
        let op = sequence(&mut writer, ConnectionId(2), 1);

        let mut reader = synced();
        reader.disconnected();
        reader.receive(&welcome(1, SyncState::Replay(vec![op.clone()]), None));
        assert_eq!(reader.get(&"k".into()), Some(Value::from("v")));
        // Already applied; a late copy is ignored.
        assert!(reader.receive(&ServerMessage::Op(op)).is_empty());
    }

    #[test]
    fn test_list_handle_operations() {
        let mut replica = synced();
        replica.root().set("todo", Value::empty_list()).unwrap();
        {
            let mut list = replica.list("todo").unwrap();
            list.push("a").unwrap();
            list.push("c").unwrap();
            list.insert(1, "b").unwrap();
            let a = list.element_at(0).unwrap();
            list.move_item(0, 2).unwrap();
            assert_eq!(list.get_by_element(&a), Some(Value::from("a")));
            list.set(0, "B").unwrap();
            assert!(list.delete(9).is_err());
        }
        let list = replica.list("todo").unwrap();
        assert_eq!(list.to_vec(), vec![Value::from("B"), Value::from("c"), Value::from("a")]);
    }

    #[test]
    fn test_map_and_nested_object_handles() {
        let mut replica = synced();
        replica.root().set("meta", Value::empty_map()).unwrap();
        replica
            .root()
            .set("shape", Value::object([("x", Value::from(0)), ("y", Value::from(0))]))
            .unwrap();

        let mut meta = replica.map("meta").unwrap();
        meta.set("owner", "ana").unwrap();
        meta.set("tmp", true).unwrap();
        meta.delete("tmp").unwrap();
        assert_eq!(meta.keys(), vec!["owner".to_string()]);

        let mut shape = replica.root().object("shape").unwrap();
        shape.update([("x", Value::from(3)), ("y", Value::from(4))]).unwrap();
        assert_eq!(shape.get("x"), Some(Value::from(3)));
        assert!(replica.root().list("shape").is_none());
    }

    #[test]
    fn test_presence_tracking() {
        let mut replica = synced();
        let peer = ConnectionId(7);
        let joined = Operation {
            room: "r".into(),
            origin: peer,
            client: ClientId::new(),
            client_op: 0,
            seq: 1,
            base_seq: 0,
            payload: OpPayload::ConnectionJoined {
                presence: [("name".to_string(), Value::from("bo"))].into_iter().collect(),
            },
        };
        replica.receive(&ServerMessage::Op(joined));
        assert_eq!(replica.others()[&peer]["name"], Value::from("bo"));

        let left = Operation {
            room: "r".into(),
            origin: peer,
            client: ClientId::new(),
            client_op: 0,
            seq: 2,
            base_seq: 1,
            payload: OpPayload::ConnectionLeft,
        };
        let events = replica.receive(&ServerMessage::Op(left));
        assert_eq!(
            events,
            vec![ReplicaEvent::PresenceChanged {
                connection: peer,
                record: None
            }]
        );
        assert!(replica.others().is_empty());
    }
}
