//! WebSocket relay with board-scoped rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (board_id) ── BroadcastGroup ── engaged draggables
//! Client B ──┘          │
//!                       ├──────────────┐
//!                       ▼              ▼
//!                    Client A       Client B      (origin skipped)
//! ```
//!
//! The relay holds no board state. It authorizes joins, tracks who is in
//! each room and which item each connection is dragging, and fans drag
//! events out to everyone else in the room. A second grab of an engaged
//! item is answered with `DragConflict` to the requester only.
//!
//! When a connection leaves mid-drag the relay finishes the drag on its
//! behalf with a null-destination `DragEnded`, so no peer keeps a stuck
//! ghost or lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use kanban_core::DropResult;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Engagement, RelayFrame, RoomManager};
use crate::protocol::{ClientMessage, RejectReason, ServerMessage, UserInfo};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;
type ConnResult = Result<(), BoxError>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum distinct users per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
}

impl ServerConfig {
    /// Defaults overridden by `KANBAN_RELAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(bind) = lookup("KANBAN_RELAY_BIND") {
            config.bind_addr = bind;
        }
        if let Some(n) = parse_var(&lookup, "KANBAN_RELAY_MAX_PEERS")? {
            config.max_peers_per_room = n;
        }
        if let Some(n) = parse_var(&lookup, "KANBAN_RELAY_BROADCAST_CAPACITY")? {
            config.broadcast_capacity = n;
        }
        if let Some(n) = parse_var(&lookup, "KANBAN_RELAY_HEARTBEAT_SECS")? {
            config.heartbeat_interval_secs = n;
        }
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

/// Decides whether a user may join a board room.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, board_id: Uuid, user: &UserInfo, token: &str) -> bool;
}

/// Admits everyone. For local development and tests.
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _board_id: Uuid, _user: &UserInfo, _token: &str) -> bool {
        true
    }
}

/// Fixed per-user tokens.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthorizer {
    tokens: HashMap<Uuid, String>,
}

impl StaticTokenAuthorizer {
    pub fn new(tokens: HashMap<Uuid, String>) -> Self {
        Self { tokens }
    }

    /// Parse `user-uuid=token,user-uuid=token`.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::Invalid {
            var: "KANBAN_RELAY_TOKENS",
            value: spec.to_string(),
        };
        let mut tokens = HashMap::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (user, token) = entry.split_once('=').ok_or_else(invalid)?;
            let user_id = Uuid::parse_str(user.trim()).map_err(|_| invalid())?;
            tokens.insert(user_id, token.trim().to_string());
        }
        Ok(Self { tokens })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authorizer for StaticTokenAuthorizer {
    fn authorize(&self, _board_id: Uuid, user: &UserInfo, token: &str) -> bool {
        self.tokens.get(&user.user_id).is_some_and(|t| t == token)
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_joins: u64,
}

/// Shared by every connection task.
struct RelayContext {
    config: ServerConfig,
    rooms: RoomManager,
    authorizer: Arc<dyn Authorizer>,
    stats: RwLock<ServerStats>,
}

/// The relay server.
pub struct RelayServer {
    ctx: Arc<RelayContext>,
}

impl RelayServer {
    /// Create a relay that admits every join.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_authorizer(config, Arc::new(AllowAll))
    }

    pub fn with_authorizer(config: ServerConfig, authorizer: Arc<dyn Authorizer>) -> Self {
        let rooms = RoomManager::new(config.broadcast_capacity);
        Self {
            ctx: Arc::new(RelayContext {
                config,
                rooms,
                authorizer,
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: Arc<RelayContext>,
    ) -> ConnResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = ctx.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection {
            id: Uuid::new_v4(),
            ctx: ctx.clone(),
            joined: None,
        };
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<RelayFrame>>> = None;

        let period = Duration::from_secs(ctx.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let result = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = ctx.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                match ClientMessage::decode(&data) {
                                    Ok(client_msg) => {
                                        let outcome = conn.handle(client_msg).await;
                                        if let Some(rx) = outcome.subscribe {
                                            broadcast_rx = Some(rx);
                                        }
                                        if outcome.unsubscribe {
                                            broadcast_rx = None;
                                        }
                                        for reply in outcome.replies {
                                            send(&mut ws_sender, &reply).await?;
                                        }
                                    }
                                    Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Outgoing room traffic
                    frame = async {
                        match broadcast_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            // Not in a room yet, wait forever
                            None => std::future::pending().await,
                        }
                    } => {
                        match frame {
                            Ok(frame) => {
                                // Don't echo back to sender
                                if frame.origin == Some(conn.id) {
                                    continue;
                                }
                                ws_sender.send(Message::Binary(frame.bytes.clone().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Connection {addr} lagged by {n} messages");
                                if let Some(joined) = &conn.joined {
                                    joined.room.record_dropped(n);
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }

                    _ = heartbeat.tick() => {
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        // Cleanup runs on every exit path, errors included.
        conn.leave_room().await;
        {
            let mut s = ctx.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = ctx.rooms.room_count().await;
        }

        result
    }

    pub async fn stats(&self) -> ServerStats {
        self.ctx.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.ctx.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.ctx.rooms.room_count().await
    }
}

async fn send(ws_sender: &mut WsSink, msg: &ServerMessage) -> ConnResult {
    let encoded = msg.encode()?;
    ws_sender.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

struct Joined {
    board_id: Uuid,
    user: UserInfo,
    room: Arc<BroadcastGroup>,
}

/// What the connection loop must do after a message.
#[derive(Default)]
struct Outcome {
    replies: Vec<ServerMessage>,
    subscribe: Option<broadcast::Receiver<Arc<RelayFrame>>>,
    unsubscribe: bool,
}

impl Outcome {
    fn reply(msg: ServerMessage) -> Self {
        Self {
            replies: vec![msg],
            ..Default::default()
        }
    }
}

/// Per-connection relay state.
struct Connection {
    id: Uuid,
    ctx: Arc<RelayContext>,
    joined: Option<Joined>,
}

impl Connection {
    async fn handle(&mut self, msg: ClientMessage) -> Outcome {
        log::trace!("Connection {} sent {}", self.id, msg.name());
        match msg {
            ClientMessage::Join { board_id, user, token } => self.join(board_id, user, token).await,

            ClientMessage::Leave { board_id } => {
                if self.joined.as_ref().is_some_and(|j| j.board_id == board_id) {
                    self.leave_room().await;
                    return Outcome {
                        unsubscribe: true,
                        ..Default::default()
                    };
                }
                Outcome::default()
            }

            ClientMessage::DragStart { draggable_id, kind, source, item, pointer } => {
                let Some(joined) = &self.joined else {
                    return self.not_joined("drag-start");
                };
                let engagement = Engagement {
                    conn_id: self.id,
                    user_id: joined.user.user_id,
                    kind,
                    source,
                };
                match joined.room.claim(draggable_id, engagement).await {
                    Ok(()) => {
                        log::debug!("{} started dragging {draggable_id}", joined.user.name);
                        let started = ServerMessage::DragStarted {
                            draggable_id,
                            kind,
                            source,
                            initiator_id: joined.user.user_id,
                            initiator_name: joined.user.name.clone(),
                            item,
                            pointer,
                        };
                        let lock = ServerMessage::DragConflict {
                            draggable_id,
                            holder: Some(joined.user.user_id),
                        };
                        self.fan_out(&started);
                        self.fan_out(&lock);
                        Outcome::default()
                    }
                    Err(holder) => {
                        log::info!(
                            "Refused grab of {draggable_id} by {}: held by {holder}",
                            joined.user.name
                        );
                        Outcome::reply(ServerMessage::DragConflict {
                            draggable_id,
                            holder: Some(holder),
                        })
                    }
                }
            }

            ClientMessage::DragCoords { pointer, seq } => {
                if let Some(from) = self.active_dragger().await {
                    self.fan_out(&ServerMessage::DragCoords { from, pointer, seq });
                }
                Outcome::default()
            }

            ClientMessage::DragUpdate { destination } => {
                if let Some(from) = self.active_dragger().await {
                    self.fan_out(&ServerMessage::DragUpdated { from, destination });
                }
                Outcome::default()
            }

            ClientMessage::DragEnd { result } => {
                let Some(joined) = &self.joined else {
                    return self.not_joined("drag-end");
                };
                if joined.room.release(&result.draggable_id, &self.id).await {
                    log::debug!(
                        "{} dropped {} at {:?}",
                        joined.user.name,
                        result.draggable_id,
                        result.destination
                    );
                    let from = joined.user.user_id;
                    self.fan_out(&ServerMessage::DragEnded { from, result });
                } else {
                    log::debug!("Ignoring end of {} from a non-holder", result.draggable_id);
                }
                Outcome::default()
            }

            ClientMessage::Ping => Outcome::reply(ServerMessage::Pong),
        }
    }

    async fn join(&mut self, board_id: Uuid, user: UserInfo, token: String) -> Outcome {
        if self.joined.as_ref().is_some_and(|j| j.board_id == board_id) {
            log::debug!("{} re-sent join for board {board_id}", user.name);
        }
        // One room per connection.
        self.leave_room().await;

        if !self.ctx.authorizer.authorize(board_id, &user, &token) {
            log::warn!("Rejected join of {} ({}) to board {board_id}", user.name, user.user_id);
            self.ctx.stats.write().await.rejected_joins += 1;
            return Outcome {
                replies: vec![ServerMessage::JoinRejected { reason: RejectReason::Unauthorized }],
                unsubscribe: true,
                ..Default::default()
            };
        }

        let room = self.ctx.rooms.get_or_create(board_id).await;
        let Some(rx) = room
            .try_add_peer(self.id, user.clone(), self.ctx.config.max_peers_per_room)
            .await
        else {
            log::warn!("Board {board_id} is full, rejecting {}", user.name);
            self.ctx.rooms.remove_if_empty(&board_id).await;
            self.ctx.stats.write().await.rejected_joins += 1;
            return Outcome {
                replies: vec![ServerMessage::JoinRejected { reason: RejectReason::RoomFull }],
                unsubscribe: true,
                ..Default::default()
            };
        };

        let users = room.users().await;
        let _ = room.broadcast(
            Some(self.id),
            &ServerMessage::UserJoined { user: user.clone(), room_id: board_id },
        );
        log::info!("{} ({}) joined board {board_id}", user.name, user.user_id);
        self.ctx.stats.write().await.active_rooms = self.ctx.rooms.room_count().await;

        self.joined = Some(Joined { board_id, user, room });
        Outcome {
            replies: vec![ServerMessage::UsersList { users }],
            subscribe: Some(rx),
            unsubscribe: false,
        }
    }

    /// Leave the current room, finishing any drag left in flight.
    async fn leave_room(&mut self) {
        let Some(joined) = self.joined.take() else {
            return;
        };
        let from = joined.user.user_id;

        for (draggable_id, engagement) in joined.room.release_by(&self.id).await {
            log::info!("Ending abandoned drag of {draggable_id} by {}", joined.user.name);
            let result = DropResult {
                draggable_id,
                kind: engagement.kind,
                source: engagement.source,
                destination: None,
            };
            let _ = joined
                .room
                .broadcast(Some(self.id), &ServerMessage::DragEnded { from, result });
        }

        joined.room.remove_peer(&self.id).await;
        if !joined.room.has_user(&from).await {
            let _ = joined
                .room
                .broadcast(Some(self.id), &ServerMessage::UserDisconnected { user_id: from });
        }
        log::info!("{} left board {}", joined.user.name, joined.board_id);
        self.ctx.rooms.remove_if_empty(&joined.board_id).await;
    }

    /// User id of this connection if it holds a drag; relays cosmetic
    /// traffic only from the holder.
    async fn active_dragger(&self) -> Option<Uuid> {
        let joined = self.joined.as_ref()?;
        joined.room.engaged_by(&self.id).await?;
        Some(joined.user.user_id)
    }

    fn fan_out(&self, msg: &ServerMessage) {
        if let Some(joined) = &self.joined {
            if let Err(e) = joined.room.broadcast(Some(self.id), msg) {
                log::error!("Failed to broadcast {}: {e}", msg.name());
            }
        }
    }

    fn not_joined(&self, what: &str) -> Outcome {
        log::debug!("Connection {} sent {what} before joining a board", self.id);
        Outcome::default()
    }
}
