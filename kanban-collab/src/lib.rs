//! # kanban-collab: Live drag-and-drop sync for shared boards
//!
//! Lets several people work on one board and watch each other's card and
//! list moves as they happen. The relay only fans out events; every client
//! applies the same finished drop to its own snapshot and they converge.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    WebSocket     ┌──────────────┐
//! │ RelayClient  │ ◄──────────────► │ RelayServer  │
//! │ (per viewer) │   bincode frames │ (stateless   │
//! └──────┬───────┘                  │  w.r.t. the  │
//!        │ RelayEvent               │  board)      │
//!        ▼                          └──────┬───────┘
//! ┌──────────────┐                         │
//! │ BoardSession │                  ┌──────┴───────┐
//! │  presence    │                  │ RoomManager  │
//! │  drag / lock │                  │ BroadcastGrp │
//! │  ghost       │                  │ (per board)  │
//! └──────┬───────┘                  └──────────────┘
//!        │ LocalDrop
//!        ▼
//! ┌──────────────┐
//! │ Reconciler   │ ──► PositionStore
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Wire messages (bincode-encoded `ClientMessage` / `ServerMessage`)
//! - [`broadcast`]: Per-board fan-out and engaged-item registry
//! - [`server`]: WebSocket relay
//! - [`client`]: WebSocket client and the `RelaySink` seam
//! - [`presence`]: Who is viewing a board; scoped room membership
//! - [`drag`]: Drag broadcast state machine
//! - [`conflict`]: Advisory lock on an item a peer is moving
//! - [`ghost`]: Placement of a peer's dragged item
//! - [`persist`]: Position updates after a local drop
//! - [`session`]: Per-board-view composition of all of the above

pub mod broadcast;
pub mod client;
pub mod conflict;
pub mod drag;
pub mod error;
pub mod ghost;
pub mod persist;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use client::{ClientConfig, ConnectionState, RelayClient, RelayEvent, RelayHandle, RelaySink};
pub use conflict::{ConflictGuard, Lock};
pub use drag::{DragMachine, DragState, RemoteDragProjection};
pub use error::SyncError;
pub use ghost::{GhostColor, GhostOverlay, GhostRenderer, PointerEvents, Viewport};
pub use persist::{
    plan_position_updates, PositionStore, PositionUpdate, ReconcileReport, Reconciler,
    ReconcilerConfig, StoreError,
};
pub use presence::{PresenceSet, RoomMembership};
pub use protocol::{ClientMessage, NormPoint, ProtocolError, RejectReason, ServerMessage, UserInfo};
pub use server::{
    AllowAll, Authorizer, ConfigError, RelayServer, ServerConfig, ServerStats,
    StaticTokenAuthorizer,
};
pub use session::{BoardSession, LocalDrop, SessionConfig, SessionEffect};
