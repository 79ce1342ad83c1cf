//! WebSocket sync client with automatic reconnection.
//!
//! Provides:
//! - Connection lifecycle (connect, reconnect with exponential backoff, close)
//! - Optimistic storage writes through a local [`Replica`]
//! - Presence updates and one-shot events
//! - Offline editing: pending storage operations survive disconnects and are
//!   resubmitted after the next `Welcome`
//!
//! ```text
//!   Connecting ──Welcome──► Open ──drop──► Reconnecting{n} ──backoff──► Open
//!        │                                        │
//!        └────── RoomUnavailable / close ─────────┴──────────────► Closed
//! ```
//!
//! Reference: Kleppmann, Chapter 5, Replication

use std::sync::Arc;
use std::time::Duration;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::ClientConfig;
use crate::error::SyncError;
use crate::protocol::{ClientId, ClientMessage, ClientOpId, PresenceRecord, ServerMessage};
use crate::replica::{Replica, ReplicaEvent};
use crate::tree::Value;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Connectivity as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    /// Waiting before reconnect attempt `attempt` (1-based).
    Reconnecting { attempt: u32 },
    Closed,
}

/// The sync client.
///
/// All storage reads and writes go through the local replica, so they work
/// whether or not the connection is open.
pub struct SyncClient {
    replica: Arc<Mutex<Replica>>,
    flush: Arc<Notify>,
    state: watch::Receiver<ConnectionState>,
    events: mpsc::Receiver<ReplicaEvent>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncClient {
    /// Start connecting in the background.
    pub fn connect(config: ClientConfig, presence: PresenceRecord) -> Self {
        let replica = Arc::new(Mutex::new(Replica::new(ClientId::new()).with_presence(presence)));
        let flush = Arc::new(Notify::new());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (event_tx, event_rx) = mpsc::channel(config.send_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = Driver {
            config,
            replica: replica.clone(),
            flush: flush.clone(),
            state: state_tx,
            events: event_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(driver.run());

        Self {
            replica,
            flush,
            state: state_rx,
            events: event_rx,
            shutdown: shutdown_tx,
            task,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to connectivity changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the session is open.
    pub async fn wait_until_open(&mut self, timeout: Duration) -> Result<(), SyncError> {
        let waited = tokio::time::timeout(
            timeout,
            self.state
                .wait_for(|s| matches!(s, ConnectionState::Open | ConnectionState::Closed)),
        )
        .await;
        match waited {
            Ok(Ok(state)) if *state == ConnectionState::Open => Ok(()),
            Ok(_) => Err(SyncError::RoomUnavailable("client is closed".into())),
            Err(_) => Err(SyncError::TransientDisconnect(
                "timed out waiting for the connection".into(),
            )),
        }
    }

    /// Run a mutation against the replica and schedule the resulting
    /// submissions.
    pub async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Replica) -> Result<R, SyncError>,
    ) -> Result<R, SyncError> {
        let result = f(&mut *self.replica.lock().await);
        self.flush.notify_one();
        result
    }

    pub async fn read<R>(&self, f: impl FnOnce(&Replica) -> R) -> R {
        f(&*self.replica.lock().await)
    }

    /// Plain form of the optimistic document.
    pub async fn export(&self) -> Value {
        self.replica.lock().await.export()
    }

    pub async fn set_presence(&self, partial: PresenceRecord) -> ClientOpId {
        let id = self.replica.lock().await.set_presence(partial);
        self.flush.notify_one();
        id
    }

    /// Broadcast a one-shot event. Events are not queued while offline.
    pub async fn emit(&self, kind: impl Into<String>, data: Value) -> Result<ClientOpId, SyncError> {
        if self.state() != ConnectionState::Open {
            return Err(SyncError::TransientDisconnect("offline; event not sent".into()));
        }
        let id = self.replica.lock().await.emit(kind, data)?;
        self.flush.notify_one();
        Ok(id)
    }

    /// Next change reported by the server.
    pub async fn next_event(&mut self) -> Option<ReplicaEvent> {
        self.events.recv().await
    }

    /// Leave the room and stop reconnecting.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            log::warn!("Client task ended abnormally: {e}");
        }
    }
}

enum SessionEnd {
    Shutdown,
    /// The server refused or ended the session.
    Refused(SyncError),
    /// The link dropped; `opened` if a `Welcome` had been applied.
    Dropped { opened: bool, reason: SyncError },
}

/// Background task owning the socket.
struct Driver {
    config: ClientConfig,
    replica: Arc<Mutex<Replica>>,
    flush: Arc<Notify>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::Sender<ReplicaEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        loop {
            let end = self.session().await;
            self.replica.lock().await.disconnected();
            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Refused(error) if error.is_terminal() => {
                    log::error!("Room {} refused the session: {error}", self.config.room);
                    self.publish(ReplicaEvent::Unavailable(error));
                    break;
                }
                SessionEnd::Refused(reason) => {
                    log::warn!("Session with room {} ended: {reason}", self.config.room);
                    failures = 0;
                }
                SessionEnd::Dropped { opened, reason } => {
                    log::warn!("Connection to {} lost: {reason}", self.config.url);
                    failures = if opened { 0 } else { failures + 1 };
                }
            }

            self.state
                .send_replace(ConnectionState::Reconnecting { attempt: failures + 1 });
            let delay = self.config.backoff(failures);
            log::debug!("Reconnecting to {} in {delay:?}", self.config.url);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }
        self.state.send_replace(ConnectionState::Closed);
        log::info!("Client for room {} closed", self.config.room);
    }

    async fn session(&mut self) -> SessionEnd {
        let ws = match tokio_tungstenite::connect_async(self.config.url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                return SessionEnd::Dropped {
                    opened: false,
                    reason: SyncError::TransientDisconnect(e.to_string()),
                }
            }
        };
        let (mut sink, mut stream) = ws.split();

        let join = self
            .replica
            .lock()
            .await
            .join_message(self.config.room.clone(), self.config.token.clone());
        if let Err(reason) = send(&mut sink, &join).await {
            return SessionEnd::Dropped { opened: false, reason };
        }

        let mut opened = false;
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Binary(data))) => {
                            let msg = match ServerMessage::decode(&data) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("Undecodable frame from server: {e}");
                                    continue;
                                }
                            };
                            let events = self.replica.lock().await.receive(&msg);
                            for event in events {
                                match event {
                                    ReplicaEvent::Unavailable(error) => return SessionEnd::Refused(error),
                                    ReplicaEvent::Synced { connection, seq } => {
                                        if !opened {
                                            opened = true;
                                            self.state.send_replace(ConnectionState::Open);
                                            log::info!(
                                                "Joined room {} as {connection} at {seq}",
                                                self.config.room
                                            );
                                        }
                                        self.publish(ReplicaEvent::Synced { connection, seq });
                                    }
                                    other => self.publish(other),
                                }
                            }
                            if opened {
                                if let Err(reason) = self.flush_outgoing(&mut sink).await {
                                    return SessionEnd::Dropped { opened, reason };
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return SessionEnd::Dropped {
                                opened,
                                reason: SyncError::TransientDisconnect("server closed the connection".into()),
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return SessionEnd::Dropped {
                                opened,
                                reason: SyncError::TransientDisconnect(e.to_string()),
                            };
                        }
                    }
                }

                _ = self.flush.notified(), if opened => {
                    if let Err(reason) = self.flush_outgoing(&mut sink).await {
                        return SessionEnd::Dropped { opened, reason };
                    }
                }

                _ = heartbeat.tick(), if opened => {
                    if let Err(reason) = send(&mut sink, &ClientMessage::Heartbeat).await {
                        return SessionEnd::Dropped { opened, reason };
                    }
                }

                _ = self.shutdown.changed() => {
                    let _ = send(&mut sink, &ClientMessage::Leave).await;
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    async fn flush_outgoing(&self, sink: &mut WsSink) -> Result<(), SyncError> {
        let outgoing = self.replica.lock().await.take_outgoing();
        for msg in &outgoing {
            send(sink, msg).await?;
        }
        Ok(())
    }

    fn publish(&self, event: ReplicaEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::warn!("Dropping client event: {e}");
        }
    }
}

async fn send(sink: &mut WsSink, msg: &ClientMessage) -> Result<(), SyncError> {
    let frame = msg.encode()?;
    sink.send(Message::Binary(frame.into()))
        .await
        .map_err(|e| SyncError::TransientDisconnect(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> ClientConfig {
        let mut config = ClientConfig::new("ws://127.0.0.1:1", "r");
        config.initial_backoff = Duration::from_millis(10);
        config.max_backoff = Duration::from_millis(20);
        config
    }

    #[tokio::test]
    async fn test_offline_client_keeps_editing() {
        let client = SyncClient::connect(unreachable_config(), PresenceRecord::new());
        let mut states = client.watch_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. })),
        )
        .await
        .unwrap()
        .unwrap();

        client.mutate(|r| r.root().set("draft", true)).await.unwrap();
        assert_eq!(client.export().await, Value::object([("draft", Value::from(true))]));
        assert_eq!(client.read(|r| r.pending().len()).await, 1);

        let err = client.emit("ping", Value::Null).await.unwrap_err();
        assert!(err.is_retryable());

        let mut states = client.watch_state();
        client.close().await;
        assert_eq!(*states.borrow_and_update(), ConnectionState::Closed);
    }
}
