//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                   ┌── Room "board-1" ── OpStore
//!             ├── ConnectionManager ── Registry ──┤        │
//! Client B ──┘        │                           └── Room "board-2"
//!                     │                                    │
//!                maintenance sweep              per-connection outboxes
//!              (heartbeats, presence,                      │
//!               room teardown)                 ┌───────────┼───────────┐
//!                                              ▼           ▼           ▼
//!                                           Client A    Client B    Client C
//! ```
//!
//! Every socket starts with a `Join` frame. After the `Welcome`, one task
//! per socket forwards client frames into the room and drains the
//! connection's outbox back onto the socket.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapters 5 & 9

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::config::ServerConfig;
use crate::connection::{AllowAll, Authorizer, ConnectionManager, JoinRequest, StaticTokens};
use crate::error::SyncError;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::registry::RoomRegistry;
use crate::storage::{MemoryStore, OpStore};

/// How long a new socket may take to send its `Join`.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_joins: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    manager: Arc<ConnectionManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, store: Arc<dyn OpStore>, authorizer: Arc<dyn Authorizer>) -> Self {
        let registry = Arc::new(RoomRegistry::new(store, config.engine.clone()));
        Self {
            config,
            manager: Arc::new(ConnectionManager::new(registry, authorizer)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Server over the given store; admission follows `config.tokens`.
    pub fn with_store(config: ServerConfig, store: Arc<dyn OpStore>) -> Self {
        let authorizer: Arc<dyn Authorizer> = match &config.tokens {
            Some(tokens) => Arc::new(StaticTokens::new(tokens.iter().cloned())),
            None => Arc::new(AllowAll),
        };
        Self::new(config, store, authorizer)
    }

    /// Server without persistence across restarts.
    pub fn in_memory(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let maintenance = self.manager.clone().spawn_maintenance();
        let result: Result<(), BoxError> = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let manager = self.manager.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, manager, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };
        maintenance.abort();
        self.manager.registry().shutdown().await;
        result
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        manager: Arc<ConnectionManager>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        stats.write().await.total_connections += 1;

        let join = match tokio::time::timeout(JOIN_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => ClientMessage::decode(&data)?,
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Ok(()),
            Ok(Some(Ok(_))) => return Err(ProtocolError::UnexpectedMessage("non-binary frame").into()),
            Ok(Some(Err(e))) => return Err(e.into()),
            Err(_) => return Err(ProtocolError::Timeout.into()),
        };
        let ClientMessage::Join {
            room,
            client,
            token,
            presence,
            last_seq,
        } = join
        else {
            return Err(ProtocolError::UnexpectedMessage("expected join").into());
        };

        let request = JoinRequest {
            client,
            token,
            presence,
            last_seq,
        };
        let mut handle = match manager.open(&room, request).await {
            Ok(handle) => handle,
            Err(error) => {
                stats.write().await.rejected_joins += 1;
                log::info!("Join from {addr} to room {room} refused: {error}");
                let frame = ServerMessage::Unavailable { error }.encode()?;
                ws_sender.send(Message::Binary(frame.into())).await?;
                let _ = ws_sender.send(Message::Close(None)).await;
                return Ok(());
            }
        };
        stats.write().await.active_connections += 1;
        log::info!("{addr} attached to room {room} as {}", handle.connection());

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket frame
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                match ClientMessage::decode(&data) {
                                    Ok(ClientMessage::Submit { client_op, base_seq, payload }) => {
                                        if let Err(e) = handle.submit(client_op, base_seq, payload).await {
                                            log::debug!("Submission from detached {}: {e}", handle.connection());
                                        }
                                    }
                                    Ok(ClientMessage::Heartbeat) => {
                                        manager.heartbeat(&handle).await;
                                    }
                                    Ok(ClientMessage::Leave) => break,
                                    Ok(ClientMessage::Join { .. }) => {
                                        log::warn!("Ignoring second join from {addr}");
                                    }
                                    Err(e) => {
                                        log::warn!("Undecodable frame from {addr}: {e}");
                                        let frame = ServerMessage::Rejected {
                                            client_op: 0,
                                            error: SyncError::OperationRejected(format!(
                                                "undecodable frame: {e}"
                                            )),
                                        }
                                        .encode()?;
                                        ws_sender.send(Message::Binary(frame.into())).await?;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                log::debug!("WebSocket error from {addr}: {e}");
                                break;
                            }
                        }
                    }

                    // Outbox → socket
                    out = handle.recv() => {
                        match out {
                            Some(msg) => {
                                let frame = msg.encode()?;
                                ws_sender.send(Message::Binary(frame.into())).await?;
                            }
                            None => {
                                // Detached by the maintenance sweep.
                                let error = SyncError::TransientDisconnect("connection detached".into());
                                let frame = ServerMessage::Unavailable { error }.encode()?;
                                ws_sender.send(Message::Binary(frame.into())).await?;
                                break;
                            }
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        manager.close(&handle).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("{} ({addr}) disconnected from room {room}", handle.connection());
        let _ = ws_sender.send(Message::Close(None)).await;
        result
    }
}
