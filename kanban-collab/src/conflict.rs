//! Conflict guard: advisory single-slot lock on an item a peer is moving.
//!
//! The relay sends `DragConflict` to observers when someone grabs an item,
//! and to a requester whose grab lost the race. While the lock is held a
//! local drag-start on that item is refused before anything is broadcast.
//!
//! Release: the matching `DragEnded` (same item, or any end from the holder),
//! the holder's disconnect, or a transport reset. Without those the card
//! would stay stuck.

use uuid::Uuid;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lock {
    pub draggable_id: Uuid,
    /// User engaged with the item, when the relay named one.
    pub holder: Option<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct ConflictGuard {
    lock: Option<Lock>,
}

impl ConflictGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a conflict marker. A newer marker replaces the previous one.
    pub fn lock(&mut self, draggable_id: Uuid, holder: Option<Uuid>) {
        if let Some(prev) = self.lock {
            if prev.draggable_id != draggable_id {
                log::debug!("Lock on {} replaced by {draggable_id}", prev.draggable_id);
            }
        }
        self.lock = Some(Lock { draggable_id, holder });
    }

    pub fn current(&self) -> Option<Lock> {
        self.lock
    }

    pub fn is_locked(&self, draggable_id: Uuid) -> bool {
        self.lock.is_some_and(|l| l.draggable_id == draggable_id)
    }

    /// Refuse a local grab of the locked item.
    pub fn can_start(&self, draggable_id: Uuid) -> Result<(), SyncError> {
        if self.is_locked(draggable_id) {
            return Err(SyncError::Conflict { draggable_id });
        }
        Ok(())
    }

    /// Release on a drag end. Returns `true` if the lock was cleared.
    pub fn release_on_end(&mut self, draggable_id: Uuid, from: Uuid) -> bool {
        let matches = self
            .lock
            .is_some_and(|l| l.draggable_id == draggable_id || l.holder == Some(from));
        if matches {
            self.lock = None;
        }
        matches
    }

    /// Release a lock held by a user who went away.
    pub fn release_holder(&mut self, user_id: Uuid) -> bool {
        let matches = self.lock.is_some_and(|l| l.holder == Some(user_id));
        if matches {
            log::debug!("Released lock held by disconnected user {user_id}");
            self.lock = None;
        }
        matches
    }

    pub fn reset(&mut self) {
        self.lock = None;
    }
}
