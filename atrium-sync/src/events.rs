//! One-shot room events.
//!
//! Events are sequenced for total order but never persisted or retained.
//! They reach only the connections attached when they are sequenced; a
//! connection that joins later, or whose outbox is full, never sees them.

use std::sync::Arc;

use crate::broadcast::BroadcastGroup;
use crate::error::SyncError;
use crate::protocol::{ConnectionId, EventPayload, OpPayload, Operation, ServerMessage};

/// Longest accepted event kind, in bytes.
pub const MAX_KIND_LEN: usize = 128;

/// Result of one event fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDelivery {
    /// Connections the event was queued for.
    pub delivered: usize,
    /// Attached connections that could not take it.
    pub dropped: usize,
}

/// Check an event before it is sequenced.
pub fn validate(payload: &EventPayload) -> Result<(), SyncError> {
    if payload.kind.is_empty() {
        return Err(SyncError::OperationRejected("event kind is empty".into()));
    }
    if payload.kind.len() > MAX_KIND_LEN {
        return Err(SyncError::OperationRejected(format!(
            "event kind is longer than {MAX_KIND_LEN} bytes"
        )));
    }
    Ok(())
}

/// Queue a sequenced event for every attached connection except `origin`.
/// Failures are logged and dropped.
pub fn deliver(group: &BroadcastGroup, op: Operation, origin: Option<ConnectionId>) -> EventDelivery {
    debug_assert!(matches!(op.payload, OpPayload::Event(_)));
    let seq = op.seq;
    let recipients = group
        .connection_ids()
        .into_iter()
        .filter(|conn| Some(*conn) != origin)
        .count();

    let delivered = group.broadcast(Arc::new(ServerMessage::Op(op)), origin);
    let dropped = recipients - delivered;
    if dropped > 0 {
        log::warn!("Event #{seq} dropped for {dropped} of {recipients} connections");
    }
    EventDelivery { delivered, dropped }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::InboxPoll;
    use crate::protocol::ClientId;
    use crate::tree::Value;

    fn event_op(seq: u64) -> Operation {
        Operation {
            room: "r".into(),
            origin: ConnectionId(1),
            client: ClientId::new(),
            client_op: 1,
            seq,
            base_seq: seq - 1,
            payload: OpPayload::Event(EventPayload::new("reaction", Value::from("👍"))),
        }
    }

    #[test]
    fn test_validate_kind() {
        assert!(validate(&EventPayload::new("ping", Value::Null)).is_ok());
        assert!(validate(&EventPayload::new("", Value::Null)).is_err());
        let long = "x".repeat(MAX_KIND_LEN + 1);
        assert!(validate(&EventPayload::new(long, Value::Null)).is_err());
    }

    #[test]
    fn test_deliver_skips_origin_and_counts_drops() {
        let mut group = BroadcastGroup::new(1);
        let mut origin = group.attach(ConnectionId(1));
        let mut other = group.attach(ConnectionId(2));
        let _full = group.attach(ConnectionId(3));
        group.send_to(ConnectionId(3), Arc::new(ServerMessage::Pong));

        let delivery = deliver(&group, event_op(5), Some(ConnectionId(1)));
        assert_eq!(delivery, EventDelivery { delivered: 1, dropped: 1 });
        assert!(matches!(origin.try_recv(), InboxPoll::Empty));
        assert!(matches!(other.try_recv(), InboxPoll::Message(_)));
    }
}
