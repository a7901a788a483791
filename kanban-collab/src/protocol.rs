//! Binary relay protocol for board rooms.
//!
//! Two tagged unions, one per direction, bincode-encoded into binary
//! WebSocket frames:
//! ```text
//! client ── ClientMessage ──► relay ── ServerMessage ──► other clients
//! ```
//!
//! The relay binds a connection to a room at `Join`; every later drag message
//! from that connection is scoped to the room, and relayed variants carry the
//! sender's user id (`from`) so peers can attribute them.
//!
//! Only `DragEnd` is authoritative. Coordinates and hover updates are cosmetic
//! and may arrive out of order.

use kanban_core::{DragKind, DragLocation, DropResult, ItemSnapshot};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identity of a board viewer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserInfo {
    pub user_id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
}

impl UserInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit user_id (for testing)
    pub fn with_id(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            avatar_url: None,
        }
    }
}

/// Pointer position normalized to the sender's board viewport, `[0, 1]²`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormPoint {
    pub x: f32,
    pub y: f32,
}

impl NormPoint {
    pub const ORIGIN: NormPoint = NormPoint { x: 0.0, y: 0.0 };

    /// Build a point, clamping each axis into `[0, 1]`. NaN maps to 0.
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x: clamp_unit(x),
            y: clamp_unit(y),
        }
    }

    /// Normalize a pixel position against a viewport of `width × height`.
    pub fn from_pixels(px: f32, py: f32, width: f32, height: f32) -> Self {
        let x = if width > 0.0 { px / width } else { 0.0 };
        let y = if height > 0.0 { py / height } else { 0.0 };
        Self::new(x, y)
    }
}

impl Default for NormPoint {
    fn default() -> Self {
        Self::ORIGIN
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Why the relay refused a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Credentials rejected; the client must re-authenticate.
    Unauthorized,
    /// Room is at `max_peers_per_room`.
    RoomFull,
}

/// Client → relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Join {
        board_id: Uuid,
        user: UserInfo,
        token: String,
    },
    Leave {
        board_id: Uuid,
    },
    DragStart {
        draggable_id: Uuid,
        kind: DragKind,
        source: DragLocation,
        item: ItemSnapshot,
        pointer: NormPoint,
    },
    DragCoords {
        pointer: NormPoint,
        /// Per-client monotonic counter.
        seq: u64,
    },
    DragUpdate {
        destination: Option<DragLocation>,
    },
    DragEnd {
        result: DropResult,
    },
    Ping,
}

/// Relay → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Full presence replace, sent to a joiner.
    UsersList {
        users: Vec<UserInfo>,
    },
    UserJoined {
        user: UserInfo,
        room_id: Uuid,
    },
    UserDisconnected {
        user_id: Uuid,
    },
    DragStarted {
        draggable_id: Uuid,
        kind: DragKind,
        source: DragLocation,
        initiator_id: Uuid,
        initiator_name: String,
        item: ItemSnapshot,
        pointer: NormPoint,
    },
    DragCoords {
        from: Uuid,
        pointer: NormPoint,
        seq: u64,
    },
    DragUpdated {
        from: Uuid,
        destination: Option<DragLocation>,
    },
    DragEnded {
        from: Uuid,
        result: DropResult,
    },
    /// `draggable_id` is engaged by `holder`; do not grab it.
    DragConflict {
        draggable_id: Uuid,
        holder: Option<Uuid>,
    },
    JoinRejected {
        reason: RejectReason,
    },
    Pong,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Leave { .. } => "leave",
            ClientMessage::DragStart { .. } => "drag-start",
            ClientMessage::DragCoords { .. } => "drag-coords",
            ClientMessage::DragUpdate { .. } => "drag-update",
            ClientMessage::DragEnd { .. } => "drag-end",
            ClientMessage::Ping => "ping",
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::UsersList { .. } => "users-list",
            ServerMessage::UserJoined { .. } => "user-joined",
            ServerMessage::UserDisconnected { .. } => "user-disconnected",
            ServerMessage::DragStarted { .. } => "drag-started",
            ServerMessage::DragCoords { .. } => "drag-coords",
            ServerMessage::DragUpdated { .. } => "drag-updated",
            ServerMessage::DragEnded { .. } => "drag-ended",
            ServerMessage::DragConflict { .. } => "drag-conflict",
            ServerMessage::JoinRejected { .. } => "join-rejected",
            ServerMessage::Pong => "pong",
        }
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}

/// Protocol errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
