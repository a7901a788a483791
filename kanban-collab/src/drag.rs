//! Drag broadcast state machine.
//!
//! ```text
//!                 begin_local()                      end_local()
//!   ┌──────┐ ───────────────────► LocalDragActive ───────────────┐
//!   │ Idle │                      (coords, update out)           │
//!   └──────┘ ◄───────────────────────────────────────────────────┘
//!      │ ▲
//!      │ │ remote_ended()  (any DragEnded, unconditionally)
//!      ▼ │
//!   RemoteDragActive  (coords, update mutate the projection)
//! ```
//!
//! A local drag and a remote projection may coexist (two people moving
//! different cards); [`DragMachine::state`] then reports the local one.
//! There is a single remote slot: a second remote start overwrites the first.

use std::time::{Duration, Instant};

use kanban_core::{DragKind, DragLocation, DropResult, ItemSnapshot};
use uuid::Uuid;

use crate::error::SyncError;
use crate::protocol::{ClientMessage, NormPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragState {
    Idle,
    LocalDragActive,
    RemoteDragActive,
}

/// The drag this client is performing.
#[derive(Debug, Clone)]
pub struct LocalDrag {
    pub draggable_id: Uuid,
    pub kind: DragKind,
    pub source: DragLocation,
    pub destination: Option<DragLocation>,
    pub started_at: Instant,
}

/// A peer's drag as currently known to this client.
#[derive(Debug, Clone)]
pub struct RemoteDragProjection {
    pub user_id: Uuid,
    pub user_name: String,
    pub item_name: String,
    pub draggable_id: Uuid,
    pub kind: DragKind,
    pub source: DragLocation,
    pub destination: Option<DragLocation>,
    pub pointer: NormPoint,
    last_seq: u64,
    pub updated_at: Instant,
}

impl RemoteDragProjection {
    /// Apply a coordinate sample. Samples older than the last applied one
    /// are dropped since the relay may reorder them.
    pub fn apply_coords(&mut self, pointer: NormPoint, seq: u64) -> bool {
        if seq <= self.last_seq {
            return false;
        }
        self.pointer = pointer;
        self.last_seq = seq;
        self.updated_at = Instant::now();
        true
    }

    pub fn apply_destination(&mut self, destination: Option<DragLocation>) {
        self.destination = destination;
        self.updated_at = Instant::now();
    }
}

pub struct DragMachine {
    local: Option<LocalDrag>,
    remote: Option<RemoteDragProjection>,
    /// Most recent pointer sample, normalized.
    last_pointer: NormPoint,
    seq: u64,
    coords_interval: Duration,
    last_coords_sent: Option<Instant>,
}

impl DragMachine {
    /// `coords_interval` throttles outgoing coordinates; zero sends every sample.
    pub fn new(coords_interval: Duration) -> Self {
        Self {
            local: None,
            remote: None,
            last_pointer: NormPoint::ORIGIN,
            seq: 0,
            coords_interval,
            last_coords_sent: None,
        }
    }

    pub fn state(&self) -> DragState {
        if self.local.is_some() {
            DragState::LocalDragActive
        } else if self.remote.is_some() {
            DragState::RemoteDragActive
        } else {
            DragState::Idle
        }
    }

    // ── Local side ───────────────────────────────────────────────

    /// Record a pointer sample. Returns a coordinate broadcast while a local
    /// drag is active and the throttle allows it.
    pub fn record_pointer(&mut self, pointer: NormPoint) -> Option<ClientMessage> {
        self.last_pointer = pointer;
        self.local.as_ref()?;

        if let Some(last) = self.last_coords_sent {
            if last.elapsed() < self.coords_interval {
                return None;
            }
        }
        self.seq += 1;
        self.last_coords_sent = Some(Instant::now());
        Some(ClientMessage::DragCoords { pointer, seq: self.seq })
    }

    /// `Idle → LocalDragActive`. The start message carries the last pointer
    /// sample, since a drag-start event has no coordinate of its own.
    pub fn begin_local(
        &mut self,
        draggable_id: Uuid,
        source: DragLocation,
        item: ItemSnapshot,
    ) -> Result<ClientMessage, SyncError> {
        if self.local.is_some() {
            return Err(SyncError::InvalidState("a local drag is already active"));
        }
        let kind = item.kind();
        self.local = Some(LocalDrag {
            draggable_id,
            kind,
            source,
            destination: Some(source),
            started_at: Instant::now(),
        });
        self.last_coords_sent = None;
        Ok(ClientMessage::DragStart {
            draggable_id,
            kind,
            source,
            item,
            pointer: self.last_pointer,
        })
    }

    /// Hover moved to a new destination. `None` if nothing changed.
    pub fn update_local(
        &mut self,
        destination: Option<DragLocation>,
    ) -> Result<Option<ClientMessage>, SyncError> {
        let local = self
            .local
            .as_mut()
            .ok_or(SyncError::InvalidState("no local drag to update"))?;
        if local.destination == destination {
            return Ok(None);
        }
        local.destination = destination;
        Ok(Some(ClientMessage::DragUpdate { destination }))
    }

    /// `LocalDragActive → Idle`. A `None` destination is a no-op move that
    /// is still broadcast so peers drop their projection.
    pub fn end_local(
        &mut self,
        destination: Option<DragLocation>,
    ) -> Result<(DropResult, ClientMessage), SyncError> {
        let local = self
            .local
            .take()
            .ok_or(SyncError::InvalidState("no local drag to end"))?;
        let result = DropResult {
            draggable_id: local.draggable_id,
            kind: local.kind,
            source: local.source,
            destination,
        };
        log::debug!(
            "Local drag of {} ended after {:?}",
            local.draggable_id,
            local.started_at.elapsed()
        );
        Ok((result, ClientMessage::DragEnd { result }))
    }

    /// Drop the local drag without broadcasting, after the relay refused it.
    pub fn abort_local(&mut self) -> Option<LocalDrag> {
        self.local.take()
    }

    pub fn local(&self) -> Option<&LocalDrag> {
        self.local.as_ref()
    }

    // ── Remote side ──────────────────────────────────────────────

    /// `Idle → RemoteDragActive`.
    pub fn remote_started(&mut self, projection: RemoteDragProjection) {
        if let Some(prev) = &self.remote {
            log::debug!(
                "Remote drag by {} overwrites projection of {}",
                projection.user_name,
                prev.user_name
            );
        }
        self.remote = Some(projection);
    }

    /// Coordinates from the projected user. Ignored for anyone else.
    pub fn remote_coords(&mut self, from: Uuid, pointer: NormPoint, seq: u64) -> bool {
        match self.remote.as_mut() {
            Some(p) if p.user_id == from => p.apply_coords(pointer, seq),
            _ => false,
        }
    }

    pub fn remote_updated(&mut self, from: Uuid, destination: Option<DragLocation>) -> bool {
        match self.remote.as_mut() {
            Some(p) if p.user_id == from => {
                p.apply_destination(destination);
                true
            }
            _ => false,
        }
    }

    /// `RemoteDragActive → Idle`, whoever the end came from.
    pub fn remote_ended(&mut self) -> Option<RemoteDragProjection> {
        self.remote.take()
    }

    /// Clear the projection if it belongs to `user_id`.
    pub fn clear_remote_from(&mut self, user_id: Uuid) -> bool {
        if self.remote.as_ref().is_some_and(|p| p.user_id == user_id) {
            self.remote = None;
            return true;
        }
        false
    }

    pub fn projection(&self) -> Option<&RemoteDragProjection> {
        self.remote.as_ref()
    }

    /// Forget every remote drag (transport reset).
    pub fn reset_remote(&mut self) {
        self.remote = None;
    }
}

/// Build a projection from a relayed `DragStarted`.
pub fn projection_from_start(
    initiator_id: Uuid,
    initiator_name: String,
    draggable_id: Uuid,
    source: DragLocation,
    item: &ItemSnapshot,
    pointer: NormPoint,
) -> RemoteDragProjection {
    RemoteDragProjection {
        user_id: initiator_id,
        user_name: initiator_name,
        item_name: item.display_name().to_string(),
        draggable_id,
        kind: item.kind(),
        source,
        destination: Some(source),
        pointer,
        last_seq: 0,
        updated_at: Instant::now(),
    }
}
