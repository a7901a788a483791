//! Per-board fan-out with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` frames; a lagging receiver loses the oldest frames, which is
//! acceptable because only `DragEnded` is authoritative and a live drag keeps
//! producing fresh coordinates.
//!
//! Besides membership the room tracks which draggable each connection has
//! engaged, so the relay can answer a second grab of the same item with a
//! conflict marker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use kanban_core::{DragKind, DragLocation};

use crate::protocol::{ProtocolError, ServerMessage, UserInfo};

/// An encoded frame plus the connection it came from, which skips it.
#[derive(Debug)]
pub struct RelayFrame {
    pub origin: Option<Uuid>,
    pub bytes: Vec<u8>,
}

/// Statistics for monitoring room health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub conflicts: u64,
    pub active_peers: usize,
}

/// Lock-free counters for the hot path. Read via [`BroadcastGroup::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    conflicts: AtomicU64,
}

/// A drag in progress, as the relay knows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Engagement {
    pub conn_id: Uuid,
    pub user_id: Uuid,
    pub kind: DragKind,
    pub source: DragLocation,
}

/// A board room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RelayFrame>>,
    /// Connection id → viewer. One user may hold several connections.
    peers: RwLock<HashMap<Uuid, UserInfo>>,
    /// Draggable id → connection currently moving it.
    engaged: RwLock<HashMap<Uuid, Engagement>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            engaged: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a connection unless the room already has `max_peers` distinct
    /// users. Returns the connection's receiver.
    pub async fn try_add_peer(
        &self,
        conn_id: Uuid,
        info: UserInfo,
        max_peers: usize,
    ) -> Option<broadcast::Receiver<Arc<RelayFrame>>> {
        let mut peers = self.peers.write().await;
        let known_user = peers.values().any(|p| p.user_id == info.user_id);
        if !known_user && distinct_users(&peers) >= max_peers {
            return None;
        }
        peers.insert(conn_id, info);
        Some(self.sender.subscribe())
    }

    pub async fn remove_peer(&self, conn_id: &Uuid) -> Option<UserInfo> {
        self.peers.write().await.remove(conn_id)
    }

    /// Whether any connection of `user_id` is still in the room.
    pub async fn has_user(&self, user_id: &Uuid) -> bool {
        self.peers.read().await.values().any(|p| p.user_id == *user_id)
    }

    /// Distinct users, for a joiner's presence list.
    pub async fn users(&self) -> Vec<UserInfo> {
        let peers = self.peers.read().await;
        let mut users: HashMap<Uuid, UserInfo> = HashMap::new();
        for info in peers.values() {
            users.entry(info.user_id).or_insert_with(|| info.clone());
        }
        users.into_values().collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Broadcast to every connection except `origin`.
    ///
    /// Returns the number of receivers, the origin's own included.
    pub fn broadcast(
        &self,
        origin: Option<Uuid>,
        msg: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        let bytes = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(RelayFrame { origin, bytes })))
    }

    /// Broadcast a pre-encoded frame.
    pub fn broadcast_raw(&self, frame: Arc<RelayFrame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Engage `draggable_id` for a connection.
    ///
    /// A connection drags one item at a time, so any earlier engagement of
    /// the same connection is dropped. Returns the holding user when another
    /// connection already has the item.
    pub async fn claim(&self, draggable_id: Uuid, engagement: Engagement) -> Result<(), Uuid> {
        let mut engaged = self.engaged.write().await;
        if let Some(existing) = engaged.get(&draggable_id) {
            if existing.conn_id != engagement.conn_id {
                self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                return Err(existing.user_id);
            }
        }
        engaged.retain(|_, e| e.conn_id != engagement.conn_id);
        engaged.insert(draggable_id, engagement);
        Ok(())
    }

    /// Release `draggable_id` if `conn_id` holds it.
    pub async fn release(&self, draggable_id: &Uuid, conn_id: &Uuid) -> bool {
        let mut engaged = self.engaged.write().await;
        if engaged.get(draggable_id).is_some_and(|e| e.conn_id == *conn_id) {
            engaged.remove(draggable_id);
            return true;
        }
        false
    }

    /// Release everything a connection holds.
    pub async fn release_by(&self, conn_id: &Uuid) -> Vec<(Uuid, Engagement)> {
        let mut engaged = self.engaged.write().await;
        let released: Vec<(Uuid, Engagement)> = engaged
            .iter()
            .filter(|(_, e)| e.conn_id == *conn_id)
            .map(|(id, e)| (*id, *e))
            .collect();
        for (id, _) in &released {
            engaged.remove(id);
        }
        released
    }

    /// Draggable currently held by a connection, if any.
    pub async fn engaged_by(&self, conn_id: &Uuid) -> Option<Uuid> {
        self.engaged
            .read()
            .await
            .iter()
            .find(|(_, e)| e.conn_id == *conn_id)
            .map(|(id, _)| *id)
    }

    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            conflicts: self.stats.conflicts.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn distinct_users(peers: &HashMap<Uuid, UserInfo>) -> usize {
    let mut ids: Vec<Uuid> = peers.values().map(|p| p.user_id).collect();
    ids.sort_unstable();
    ids.dedup();
    ids.len()
}

/// Maps board ids to rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the room for a board.
    pub async fn get_or_create(&self, board_id: Uuid) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&board_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&board_id) {
            return room.clone();
        }

        log::debug!("Opening room for board {board_id}");
        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(board_id, room.clone());
        room
    }

    pub async fn get(&self, board_id: &Uuid) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(board_id).cloned()
    }

    /// Remove a room with no connections left.
    pub async fn remove_if_empty(&self, board_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(board_id) {
            if room.peer_count().await == 0 {
                rooms.remove(board_id);
                log::debug!("Closed empty room for board {board_id}");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_boards(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
