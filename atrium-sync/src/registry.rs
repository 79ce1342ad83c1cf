//! Arena of live rooms with an explicit lifecycle.
//!
//! ```text
//!   get_or_create ──► Active{refs} ──release (refs = 0)──► Draining{since}
//!                        ▲                                   │       │
//!                        └──────── get_or_create ────────────┘       │
//!                                                    reap (grace over)
//!                                                                    ▼
//!                                              teardown: snapshot + compact
//! ```
//!
//! Lifecycle changes are serialized behind the registry lock; each room is
//! synchronized internally.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::protocol::{ConnectionId, EventPayload, RoomKey, Seq};
use crate::room::Room;
use crate::storage::OpStore;

/// Lifecycle state of a registered room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomLifecycle {
    /// Referenced by `refs` connections.
    Active { refs: usize },
    /// No connections since `since`; destroyed once the grace period ends.
    Draining { since: Instant },
}

struct RoomEntry {
    room: Arc<Room>,
    lifecycle: RoomLifecycle,
}

pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<RoomKey, RoomEntry>>>,
    store: Arc<dyn OpStore>,
    config: EngineConfig,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn OpStore>, config: EngineConfig) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            store,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Take a reference on a room, loading it from the store if needed.
    /// A draining room is reused with its state intact.
    pub async fn get_or_create(&self, key: &RoomKey) -> Result<Arc<Room>, SyncError> {
        let mut rooms = self.rooms.write().await;
        if let Some(entry) = rooms.get_mut(key) {
            entry.lifecycle = match entry.lifecycle {
                RoomLifecycle::Active { refs } => RoomLifecycle::Active { refs: refs + 1 },
                RoomLifecycle::Draining { .. } => {
                    log::info!("Room {key} reactivated during its grace period");
                    RoomLifecycle::Active { refs: 1 }
                }
            };
            return Ok(entry.room.clone());
        }

        let room = Arc::new(Room::load(key.clone(), self.store.clone(), self.config.clone())?);
        rooms.insert(
            key.clone(),
            RoomEntry {
                room: room.clone(),
                lifecycle: RoomLifecycle::Active { refs: 1 },
            },
        );
        log::info!("Room {key} created ({} live rooms)", rooms.len());
        Ok(room)
    }

    /// Drop a reference. At zero the room drains, or is torn down at once
    /// when there is no grace period.
    pub async fn release(&self, key: &RoomKey, now: Instant) {
        let mut rooms = self.rooms.write().await;
        let Some(entry) = rooms.get_mut(key) else {
            log::warn!("Release of unknown room {key}");
            return;
        };
        let lifecycle = entry.lifecycle;
        match lifecycle {
            RoomLifecycle::Active { refs } if refs > 1 => {
                entry.lifecycle = RoomLifecycle::Active { refs: refs - 1 };
            }
            RoomLifecycle::Active { .. } if self.config.grace_period.is_zero() => {
                if let Some(entry) = rooms.remove(key) {
                    Self::destroy(key, &entry.room).await;
                }
            }
            RoomLifecycle::Active { .. } => {
                log::debug!("Room {key} draining for {:?}", self.config.grace_period);
                entry.lifecycle = RoomLifecycle::Draining { since: now };
            }
            RoomLifecycle::Draining { .. } => {
                log::warn!("Release of draining room {key}");
            }
        }
    }

    /// Tear down rooms whose grace period has elapsed. Returns how many.
    pub async fn reap(&self, now: Instant) -> usize {
        let mut rooms = self.rooms.write().await;
        let grace = self.config.grace_period;
        let expired: Vec<RoomKey> = rooms
            .iter()
            .filter(|(_, entry)| match entry.lifecycle {
                RoomLifecycle::Draining { since } => now.saturating_duration_since(since) >= grace,
                RoomLifecycle::Active { .. } => false,
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = rooms.remove(key) {
                Self::destroy(key, &entry.room).await;
            }
        }
        expired.len()
    }

    async fn destroy(key: &RoomKey, room: &Room) {
        if let Err(e) = room.teardown().await {
            log::error!("Failed to persist room {key} on teardown: {e}");
        }
        log::info!("Room {key} destroyed");
    }

    /// Broadcast an event to the connections attached to a room.
    pub async fn broadcast(
        &self,
        key: &RoomKey,
        origin: Option<ConnectionId>,
        payload: EventPayload,
    ) -> Result<Seq, SyncError> {
        let room = self
            .get(key)
            .await
            .ok_or_else(|| SyncError::RoomUnavailable(format!("room {key} is not live")))?;
        room.broadcast_event(origin, payload).await
    }

    /// A live room, without taking a reference.
    pub async fn get(&self, key: &RoomKey) -> Option<Arc<Room>> {
        self.rooms.read().await.get(key).map(|e| e.room.clone())
    }

    pub async fn lifecycle(&self, key: &RoomKey) -> Option<RoomLifecycle> {
        self.rooms.read().await.get(key).map(|e| e.lifecycle)
    }

    /// Rooms currently referenced by at least one connection.
    pub async fn active_rooms(&self) -> Vec<Arc<Room>> {
        self.rooms
            .read()
            .await
            .values()
            .filter(|e| matches!(e.lifecycle, RoomLifecycle::Active { .. }))
            .map(|e| e.room.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }

    /// Tear down every room, e.g. on shutdown.
    pub async fn shutdown(&self) {
        let mut rooms = self.rooms.write().await;
        for (key, entry) in rooms.drain() {
            Self::destroy(&key, &entry.room).await;
        }
    }
}
