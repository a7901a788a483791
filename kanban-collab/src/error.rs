//! Error taxonomy for the drag synchronization subsystem.
//!
//! Only [`SyncError::Unauthorized`] is fatal to a board view. Everything else
//! degrades the UI (a missing ghost, a refused grab) without losing data.

use kanban_core::ReorderError;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::ProtocolError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Relay rejected the join. Redirect to re-authentication, do not retry.
    #[error("Not authorized to join board: {reason}")]
    Unauthorized { reason: String },

    /// Send failed or connection dropped; recovered by reconnect.
    #[error("Relay unavailable: {0}")]
    Transient(#[from] ProtocolError),

    /// Grab refused: the item is engaged by a remote drag.
    #[error("Item {draggable_id} is being moved by another user")]
    Conflict { draggable_id: Uuid },

    #[error("Failed to persist position of {target}: {message}")]
    Persistence { target: Uuid, message: String },

    #[error("Reorder failed: {0}")]
    Reorder(#[from] ReorderError),

    #[error("Invalid drag state: {0}")]
    InvalidState(&'static str),
}

impl SyncError {
    /// Errors after which the board view must be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Unauthorized { .. })
    }
}
