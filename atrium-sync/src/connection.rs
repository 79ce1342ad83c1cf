//! Connection lifecycle: authorization, join, heartbeat, close and the
//! periodic maintenance sweep.
//!
//! ```text
//!   open ──► authorize ──► registry.get_or_create ──► room.join ──► handle
//!                │                 │                     │
//!                ▼                 ▼                     ▼
//!         RoomUnavailable   RoomUnavailable       RoomUnavailable (full)
//!
//!   close / heartbeat timeout ──► room.leave ──► registry.release
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

use crate::broadcast::{Inbox, InboxPoll};
use crate::error::SyncError;
use crate::protocol::{
    ClientId, ClientOpId, ConnectionId, OpPayload, PresenceRecord, RoomKey, Seq, ServerMessage,
};
use crate::registry::RoomRegistry;
use crate::room::{Room, Submitted};

/// Decides whether a client may join a room.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, room: &RoomKey, client: ClientId, token: Option<&str>) -> Result<(), String>;
}

/// Admits everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _room: &RoomKey, _client: ClientId, _token: Option<&str>) -> Result<(), String> {
        Ok(())
    }
}

/// Admits clients presenting one of a fixed set of tokens.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashSet<String>,
}

impl StaticTokens {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

impl Authorizer for StaticTokens {
    fn authorize(&self, _room: &RoomKey, _client: ClientId, token: Option<&str>) -> Result<(), String> {
        match token {
            Some(t) if self.tokens.contains(t) => Ok(()),
            Some(_) => Err("invalid token".into()),
            None => Err("missing token".into()),
        }
    }
}

/// Parameters of a join.
#[derive(Debug, Clone, Default)]
pub struct JoinRequest {
    pub client: ClientId,
    pub token: Option<String>,
    pub presence: PresenceRecord,
    /// Last sequence the client observed in an earlier session.
    pub last_seq: Option<Seq>,
}

impl JoinRequest {
    pub fn new(client: ClientId) -> Self {
        Self {
            client,
            ..Self::default()
        }
    }
}

/// Outcome of one maintenance sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_connections: usize,
    pub presence_flushed: usize,
    pub rooms_reaped: usize,
}

/// One client's attachment to one room.
///
/// Delivery is pull-based: messages wait in a bounded queue until
/// [`recv`](Self::recv) or [`try_recv`](Self::try_recv) takes them.
pub struct ConnectionHandle {
    room: Arc<Room>,
    connection: ConnectionId,
    client: ClientId,
    inbox: Inbox,
}

impl ConnectionHandle {
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn room_key(&self) -> &RoomKey {
        self.room.key()
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    /// Next message for this connection. A lagging queue is answered with a
    /// fresh snapshot once drained. `None` after the connection was closed.
    pub async fn recv(&mut self) -> Option<Arc<ServerMessage>> {
        loop {
            match self.inbox.try_recv() {
                InboxPoll::Message(msg) => return Some(msg),
                InboxPoll::Closed => return None,
                InboxPoll::Lagged => {
                    if !self.room.resync(self.connection).await {
                        return None;
                    }
                }
                InboxPoll::Empty => return self.inbox.recv().await,
            }
        }
    }

    /// Non-blocking receive. On [`InboxPoll::Lagged`] call
    /// [`resync`](Self::resync).
    pub fn try_recv(&mut self) -> InboxPoll {
        self.inbox.try_recv()
    }

    pub async fn resync(&self) -> bool {
        self.room.resync(self.connection).await
    }

    pub async fn submit(
        &self,
        client_op: ClientOpId,
        base_seq: Seq,
        payload: OpPayload,
    ) -> Result<Submitted, SyncError> {
        self.room
            .submit(self.connection, client_op, base_seq, payload, Instant::now())
            .await
    }
}

/// Opens and closes connections against a [`RoomRegistry`].
pub struct ConnectionManager {
    registry: Arc<RoomRegistry>,
    authorizer: Arc<dyn Authorizer>,
}

impl ConnectionManager {
    pub fn new(registry: Arc<RoomRegistry>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            registry,
            authorizer,
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Attach a client to a room.
    pub async fn open(&self, room: &RoomKey, request: JoinRequest) -> Result<ConnectionHandle, SyncError> {
        if let Err(reason) = self
            .authorizer
            .authorize(room, request.client, request.token.as_deref())
        {
            log::warn!("Join of {} to room {room} denied: {reason}", request.client);
            return Err(SyncError::RoomUnavailable(format!("not authorized: {reason}")));
        }

        let shared = self.registry.get_or_create(room).await?;
        let now = Instant::now();
        match shared
            .join(request.client, request.presence, request.last_seq, now)
            .await
        {
            Ok(attached) => Ok(ConnectionHandle {
                room: shared,
                connection: attached.connection,
                client: request.client,
                inbox: attached.inbox,
            }),
            Err(e) => {
                self.registry.release(room, now).await;
                Err(e)
            }
        }
    }

    /// Detach a connection. Returns `false` if it was already detached.
    pub async fn close(&self, handle: &ConnectionHandle) -> bool {
        self.detach(&handle.room, handle.connection, Instant::now()).await
    }

    pub async fn heartbeat(&self, handle: &ConnectionHandle) -> bool {
        handle.room.heartbeat(handle.connection, Instant::now()).await
    }

    async fn detach(&self, room: &Room, connection: ConnectionId, now: Instant) -> bool {
        if !room.leave(connection).await {
            return false;
        }
        self.registry.release(room.key(), now).await;
        true
    }

    /// Detach silent connections, emit due presence updates and tear down
    /// rooms whose grace period is over.
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        for room in self.registry.active_rooms().await {
            report.presence_flushed += room.flush_presence(now).await;
            for connection in room.expired(now).await {
                log::info!(
                    "{connection} in room {} missed its heartbeat; detaching",
                    room.key()
                );
                if self.detach(&room, connection, now).await {
                    report.expired_connections += 1;
                }
            }
        }
        report.rooms_reaped = self.registry.reap(now).await;
        report
    }

    /// Run [`sweep`](Self::sweep) on the configured maintenance interval.
    pub fn spawn_maintenance(self: Arc<Self>) -> JoinHandle<()> {
        let manager = self;
        let period = manager.registry.config().maintenance_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let report = manager.sweep(Instant::now()).await;
                if report.expired_connections > 0 || report.rooms_reaped > 0 {
                    log::debug!("Maintenance sweep: {report:?}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::MemoryStore;
    use crate::tree::Value;
    use std::time::Duration;

    fn manager(authorizer: Arc<dyn Authorizer>) -> ConnectionManager {
        let registry = RoomRegistry::new(Arc::new(MemoryStore::new()), EngineConfig::for_testing());
        ConnectionManager::new(Arc::new(registry), authorizer)
    }

    fn named(name: &str) -> JoinRequest {
        JoinRequest {
            presence: [("name".to_string(), Value::from(name))].into_iter().collect(),
            ..JoinRequest::new(ClientId::new())
        }
    }

    #[tokio::test]
    async fn test_static_tokens() {
        let manager = manager(Arc::new(StaticTokens::new(["s3cret"])));
        let room = RoomKey::from("r");

        let denied = manager.open(&room, JoinRequest::new(ClientId::new())).await;
        assert!(matches!(denied, Err(SyncError::RoomUnavailable(_))));

        let request = JoinRequest {
            token: Some("s3cret".into()),
            ..JoinRequest::new(ClientId::new())
        };
        let mut handle = manager.open(&room, request).await.unwrap();
        assert!(matches!(*handle.recv().await.unwrap(), ServerMessage::Welcome(_)));
    }

    #[tokio::test]
    async fn test_close_removes_presence_and_is_idempotent() {
        let manager = manager(Arc::new(AllowAll));
        let room = RoomKey::from("r");
        let mut a = manager.open(&room, named("ana")).await.unwrap();
        let b = manager.open(&room, named("bo")).await.unwrap();
        a.recv().await.unwrap();
        a.recv().await.unwrap();

        assert!(manager.close(&b).await);
        assert!(!manager.close(&b).await);

        let left = a.recv().await.unwrap();
        assert!(matches!(&*left, ServerMessage::Op(op)
            if op.origin == b.connection() && op.payload == OpPayload::ConnectionLeft));
        assert_eq!(a.room().presence_list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_last_close_destroys_room() {
        let manager = manager(Arc::new(AllowAll));
        let room = RoomKey::from("r");
        let handle = manager.open(&room, named("ana")).await.unwrap();
        manager.close(&handle).await;
        assert!(manager.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_sweep_detaches_silent_connections() {
        let manager = manager(Arc::new(AllowAll));
        let room = RoomKey::from("r");
        let a = manager.open(&room, named("ana")).await.unwrap();
        let b = manager.open(&room, named("bo")).await.unwrap();
        assert!(manager.heartbeat(&b).await);

        let later = Instant::now() + Duration::from_secs(6);
        b.room().heartbeat(b.connection(), later).await;
        let report = manager.sweep(later).await;
        assert_eq!(report.expired_connections, 1);
        assert!(a.room().presence(a.connection()).await.is_none());
        assert!(!manager.close(&a).await);
        assert!(manager.close(&b).await);
        assert_eq!(manager.sweep(later).await.rooms_reaped, 0);
        assert!(manager.registry().is_empty().await);
    }
}
