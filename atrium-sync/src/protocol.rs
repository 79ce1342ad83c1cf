//! Wire protocol: identifiers, sequenced operations, client/server messages.
//!
//! Frames are bincode-encoded (serde mode, standard config) and carried as
//! WebSocket binary messages:
//! ```text
//!   client                                  server
//!     │ ── Join{room, client, token, …} ──►   │
//!     │ ◄── Welcome{connection, seq, sync} ── │
//!     │ ── Submit{client_op, base_seq, …} ──► │  sequence + persist
//!     │ ◄──────── Op / Ack / Rejected ─────── │  fan-out to the room
//!     │ ── Heartbeat ──► / ◄── Pong           │
//! ```
//!
//! Performance target: encode/decode < 1µs for a typical presence update.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::SyncError;
use crate::tree::{Stamp, StorageOp, StorageTree, Value};

/// Server-assigned sequence number, strictly increasing per room.
pub type Seq = u64;

/// Client-assigned id of a submission, increasing per client.
pub type ClientOpId = u64;

/// Per-connection ephemeral awareness record.
pub type PresenceRecord = BTreeMap<String, Value>;

/// Process-local connection id, never reused while its room is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Origin of operations generated by the server itself.
    pub const SERVER: ConnectionId = ConnectionId(0);
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Opaque room address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoomKey(String);

impl RoomKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for RoomKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a client process, stable across its reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Identity used for server-generated operations.
    pub const SERVER: ClientId = ClientId(Uuid::nil());

    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One-shot broadcast message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub kind: String,
    pub data: Value,
}

impl EventPayload {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpPayload {
    /// Submitted: partial record to merge. Broadcast: the full merged record.
    Presence(PresenceRecord),
    Storage(StorageOp),
    Event(EventPayload),
    ConnectionJoined { presence: PresenceRecord },
    ConnectionLeft,
}

impl OpPayload {
    pub fn is_storage(&self) -> bool {
        matches!(self, OpPayload::Storage(_))
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            OpPayload::Presence(_) => "presence",
            OpPayload::Storage(op) => op.kind(),
            OpPayload::Event(_) => "event",
            OpPayload::ConnectionJoined { .. } => "joined",
            OpPayload::ConnectionLeft => "left",
        }
    }
}

/// Immutable, server-sequenced record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub room: RoomKey,
    pub origin: ConnectionId,
    pub client: ClientId,
    pub client_op: ClientOpId,
    pub seq: Seq,
    /// Last seq the origin had observed when it generated the operation.
    pub base_seq: Seq,
    pub payload: OpPayload,
}

impl Operation {
    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.seq, self.base_seq)
    }
}

/// How a joining connection catches up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncState {
    /// Full storage tree as of `Welcome::seq`.
    Snapshot(StorageTree),
    /// Storage operations after the client's `last_seq`, up to `Welcome::seq`.
    Replay(Vec<Operation>),
}

/// First message of every session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub connection: ConnectionId,
    pub seq: Seq,
    pub sync: SyncState,
    /// Presence of every other attached connection.
    pub presence: Vec<(ConnectionId, PresenceRecord)>,
    /// Highest submission of this client already sequenced, if any.
    pub acked_client_op: Option<ClientOpId>,
}

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Join {
        room: RoomKey,
        client: ClientId,
        token: Option<String>,
        presence: PresenceRecord,
        last_seq: Option<Seq>,
    },
    Submit {
        client_op: ClientOpId,
        base_seq: Seq,
        payload: OpPayload,
    },
    Heartbeat,
    Leave,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Welcome(Welcome),
    /// A sequenced operation. For storage operations the origin receives it
    /// too, as its acknowledgment.
    Op(Operation),
    /// Acknowledgment of a presence or event submission.
    Ack { client_op: ClientOpId, seq: Seq },
    Rejected { client_op: ClientOpId, error: SyncError },
    /// Join refused or session ended by the server.
    Unavailable { error: SyncError },
    Pong,
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Serialize any protocol value to a wire frame.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Deserialize a wire frame.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    UnexpectedMessage(&'static str),
    ConnectionClosed,
    Timeout,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::UnexpectedMessage(what) => write!(f, "unexpected message: {what}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Timeout => write!(f, "connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
