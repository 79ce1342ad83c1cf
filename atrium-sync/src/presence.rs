//! Per-room presence: one ephemeral record per attached connection.
//!
//! ## Coalescing
//!
//! ```text
//!  set ─┐        set  set        set
//!       ▼         │    │          │
//!  ─────●─────────┼────┼────●─────┼──────────●────────►  time
//!     emit        └fold┘   emit   └──fold──► emit (due)
//!       │◄── window ──►│     │◄── window ──►│
//! ```
//!
//! The first update in a quiet period is emitted immediately (leading
//! edge). Updates inside the window are merged into the record and emitted
//! once when the window closes (trailing edge), so the latest value is never
//! lost. Every emission carries the whole merged record; receivers replace
//! their copy (whole-record last-write-wins).
//!
//! ## Performance Targets
//!
//! | Metric              | Target  |
//! |---------------------|---------|
//! | set (10 keys)       | <1µs    |
//! | Memory per record   | <1KB    |
//!
//! Reference: Kleppmann, Chapter 8, Broadcast Protocols

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{ClientOpId, ConnectionId, PresenceRecord};
use crate::tree::Value;

/// What the caller should do after a [`PresenceChannel::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceUpdate {
    /// Broadcast the merged record now.
    Emit,
    /// Folded into a trailing update; see [`PresenceChannel::due`].
    Deferred,
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    record: PresenceRecord,
    last_emit: Option<Instant>,
    dirty: bool,
    /// Highest submission folded into the record but not acknowledged yet.
    unacked: Option<ClientOpId>,
}

/// Presence table of one room.
#[derive(Debug)]
pub struct PresenceChannel {
    window: Duration,
    entries: HashMap<ConnectionId, PresenceEntry>,
}

impl PresenceChannel {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Register a connection with its initial record.
    ///
    /// The join itself is announced separately, so the coalescing window
    /// starts at `now`.
    pub fn insert(&mut self, conn: ConnectionId, mut record: PresenceRecord, now: Instant) {
        record.retain(|_, v| *v != Value::Null);
        self.entries.insert(
            conn,
            PresenceEntry {
                record,
                last_emit: Some(now),
                dirty: false,
                unacked: None,
            },
        );
    }

    /// Shallow-merge `partial` into the connection's record.
    ///
    /// Keys set to [`Value::Null`] are removed. Returns `None` when the
    /// connection has no record.
    pub fn set(
        &mut self,
        conn: ConnectionId,
        partial: PresenceRecord,
        client_op: Option<ClientOpId>,
        now: Instant,
    ) -> Option<PresenceUpdate> {
        let entry = self.entries.get_mut(&conn)?;
        for (key, value) in partial {
            if value == Value::Null {
                entry.record.remove(&key);
            } else {
                entry.record.insert(key, value);
            }
        }
        if client_op.is_some() {
            entry.unacked = entry.unacked.max(client_op);
        }

        let quiet = entry
            .last_emit
            .map_or(true, |at| now.saturating_duration_since(at) >= self.window);
        if quiet {
            entry.last_emit = Some(now);
            entry.dirty = false;
            log::trace!("presence {conn}: leading-edge emit");
            Some(PresenceUpdate::Emit)
        } else {
            entry.dirty = true;
            log::trace!("presence {conn}: folded into trailing update");
            Some(PresenceUpdate::Deferred)
        }
    }

    /// Connections whose trailing update is due at `now`; marks them emitted.
    pub fn due(&mut self, now: Instant) -> Vec<ConnectionId> {
        let window = self.window;
        let mut ready: Vec<ConnectionId> = self
            .entries
            .iter_mut()
            .filter(|(_, e)| {
                e.dirty
                    && e.last_emit
                        .map_or(true, |at| now.saturating_duration_since(at) >= window)
            })
            .map(|(conn, e)| {
                e.dirty = false;
                e.last_emit = Some(now);
                *conn
            })
            .collect();
        ready.sort();
        if !ready.is_empty() {
            log::debug!("presence: flushing {} trailing updates", ready.len());
        }
        ready
    }

    /// Earliest instant at which [`due`](Self::due) will return something.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter(|e| e.dirty)
            .filter_map(|e| e.last_emit.map(|at| at + self.window))
            .min()
    }

    /// Take the pending acknowledgment for a connection.
    pub fn take_ack(&mut self, conn: ConnectionId) -> Option<ClientOpId> {
        self.entries.get_mut(&conn).and_then(|e| e.unacked.take())
    }

    pub fn get(&self, conn: ConnectionId) -> Option<&PresenceRecord> {
        self.entries.get(&conn).map(|e| &e.record)
    }

    /// All records, ordered by connection id.
    pub fn list(&self) -> Vec<(ConnectionId, PresenceRecord)> {
        let mut all: Vec<(ConnectionId, PresenceRecord)> = self
            .entries
            .iter()
            .map(|(conn, e)| (*conn, e.record.clone()))
            .collect();
        all.sort_by_key(|(conn, _)| *conn);
        all
    }

    /// Drop a connection's record. Nothing is kept afterwards.
    pub fn remove(&mut self, conn: ConnectionId) -> Option<PresenceRecord> {
        self.entries.remove(&conn).map(|e| e.record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
