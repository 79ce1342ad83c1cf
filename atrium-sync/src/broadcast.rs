//! Per-connection outboxes and room fan-out with backpressure.
//!
//! Every attached connection owns one bounded queue. The room pushes into
//! the queues while holding its critical section, so each connection sees
//! messages in sequence order. Delivery is pull-based: the connection drains
//! its [`Inbox`] at its own pace.
//!
//! ```text
//!  Room ──push──► Outbox(conn 1) ══ bounded ══► Inbox ──► socket / test
//!        ├──────► Outbox(conn 2) ══ bounded ══► Inbox
//!        └──────► Outbox(conn 3) ══ FULL ═════► lagged: stop, then resync
//! ```
//!
//! A queue that overflows is marked lagged and receives nothing more. Once
//! its reader has drained what is queued, it asks the room for a fresh
//! snapshot and the flag is cleared.
//!
//! Performance target: 1,000 messages to 100 connections < 10ms
//! Reference: Patterson & Hennessy, Section 6.4, Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use crate::protocol::{ConnectionId, ServerMessage};

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub lag_events: u64,
    pub active_connections: usize,
}

/// Counters shared with readers outside the room lock.
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    lag_events: AtomicU64,
}

/// Sending half of a connection queue, owned by the room.
#[derive(Debug)]
struct Outbox {
    tx: mpsc::Sender<Arc<ServerMessage>>,
    lagged: Arc<AtomicBool>,
}

/// Receiving half of a connection queue, owned by the connection.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<Arc<ServerMessage>>,
    lagged: Arc<AtomicBool>,
}

/// Result of a non-blocking [`Inbox::try_recv`].
#[derive(Debug)]
pub enum InboxPoll {
    Message(Arc<ServerMessage>),
    /// Nothing queued.
    Empty,
    /// Nothing queued and messages were dropped; a resync is needed.
    Lagged,
    /// The room dropped this connection.
    Closed,
}

impl Inbox {
    /// Wait for the next queued message. `None` once the room has dropped
    /// this connection and the queue is drained.
    pub async fn recv(&mut self) -> Option<Arc<ServerMessage>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> InboxPoll {
        match self.rx.try_recv() {
            Ok(msg) => InboxPoll::Message(msg),
            Err(TryRecvError::Empty) if self.is_lagged() => InboxPoll::Lagged,
            Err(TryRecvError::Empty) => InboxPoll::Empty,
            Err(TryRecvError::Disconnected) => InboxPoll::Closed,
        }
    }

    pub fn is_lagged(&self) -> bool {
        self.lagged.load(Ordering::Acquire)
    }
}

/// Outboxes of every connection attached to one room.
#[derive(Debug)]
pub struct BroadcastGroup {
    outboxes: HashMap<ConnectionId, Outbox>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is the per-connection queue bound.
    pub fn new(capacity: usize) -> Self {
        Self {
            outboxes: HashMap::new(),
            capacity: capacity.max(1),
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Create the queue for a new connection.
    pub fn attach(&mut self, conn: ConnectionId) -> Inbox {
        let (tx, rx) = mpsc::channel(self.capacity);
        let lagged = Arc::new(AtomicBool::new(false));
        self.outboxes.insert(
            conn,
            Outbox {
                tx,
                lagged: lagged.clone(),
            },
        );
        Inbox { rx, lagged }
    }

    /// Drop a connection's queue. Its reader sees the end of stream after
    /// draining.
    pub fn detach(&mut self, conn: ConnectionId) -> bool {
        self.outboxes.remove(&conn).is_some()
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.outboxes.contains_key(&conn)
    }

    /// Queue a message for one connection. Returns whether it was queued.
    pub fn send_to(&self, conn: ConnectionId, msg: Arc<ServerMessage>) -> bool {
        match self.outboxes.get(&conn) {
            Some(outbox) => self.push(conn, outbox, msg),
            None => false,
        }
    }

    /// Queue a message for every connection except `except`.
    /// Returns the number of connections it was queued for.
    pub fn broadcast(&self, msg: Arc<ServerMessage>, except: Option<ConnectionId>) -> usize {
        self.outboxes
            .iter()
            .filter(|(conn, _)| Some(**conn) != except)
            .filter(|(conn, outbox)| self.push(**conn, outbox, msg.clone()))
            .count()
    }

    fn push(&self, conn: ConnectionId, outbox: &Outbox, msg: Arc<ServerMessage>) -> bool {
        if outbox.lagged.load(Ordering::Acquire) {
            self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        match outbox.tx.try_send(msg) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                outbox.lagged.store(true, Ordering::Release);
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                self.stats.lag_events.fetch_add(1, Ordering::Relaxed);
                log::warn!("Outbox of {conn} is full ({} messages); marked lagged", self.capacity);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Outbox of {conn} is closed; dropping message");
                false
            }
        }
    }

    /// Clear the lagged flag before queueing a resync snapshot.
    pub fn clear_lag(&self, conn: ConnectionId) {
        if let Some(outbox) = self.outboxes.get(&conn) {
            outbox.lagged.store(false, Ordering::Release);
        }
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.outboxes.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.outboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outboxes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock-free statistics snapshot.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            lag_events: self.stats.lag_events.load(Ordering::Relaxed),
            active_connections: self.outboxes.len(),
        }
    }
}
