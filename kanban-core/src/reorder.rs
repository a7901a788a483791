//! Reorder engine: apply a finished drag to a board snapshot.
//!
//! There is no server-side merge. Every peer runs [`reorder`] on the same
//! terminal drop result, so the output must depend on nothing but the inputs:
//!
//! ```text
//! peer A: reorder(B, R) ──► B'
//! peer B: reorder(B, R) ──► B'     (bit-identical)
//! ```
//!
//! Indices follow splice semantics: the moved item is removed first and the
//! destination index refers to the array *after* removal. An index past the
//! end appends.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::Board;

/// What is being dragged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DragKind {
    List,
    Card,
}

/// A slot inside a container: a list for cards, the board for lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DragLocation {
    pub container_id: Uuid,
    pub index: usize,
}

impl DragLocation {
    pub fn new(container_id: Uuid, index: usize) -> Self {
        Self { container_id, index }
    }
}

/// Outcome of a released drag. `destination: None` means dropped outside
/// any valid target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropResult {
    pub draggable_id: Uuid,
    pub kind: DragKind,
    pub source: DragLocation,
    pub destination: Option<DragLocation>,
}

impl DropResult {
    /// True when applying this result cannot change the board.
    pub fn is_noop(&self) -> bool {
        match self.destination {
            None => true,
            Some(dest) => dest == self.source,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReorderError {
    #[error("Unknown container: {0}")]
    UnknownContainer(Uuid),
    #[error("Source index {index} out of range for container {container_id} (len {len})")]
    SourceOutOfRange {
        container_id: Uuid,
        index: usize,
        len: usize,
    },
    #[error("Stale source: expected {expected} at index {index}, found {found}")]
    StaleSource {
        expected: Uuid,
        found: Uuid,
        index: usize,
    },
}

/// Compute the board after `result` is applied.
///
/// The input is never mutated; on error the caller keeps its snapshot.
pub fn reorder(board: &Board, result: &DropResult) -> Result<Board, ReorderError> {
    let Some(destination) = result.destination else {
        return Ok(board.clone());
    };

    let mut next = board.clone();
    match result.kind {
        DragKind::List => {
            for container in [result.source.container_id, destination.container_id] {
                if container != board.id {
                    return Err(ReorderError::UnknownContainer(container));
                }
            }
            let moved = take_at(
                &mut next.lists,
                result.source,
                result.draggable_id,
                |list| list.id,
            )?;
            insert_clamped(&mut next.lists, destination.index, moved);
            next.renumber_lists();
        }
        DragKind::Card => {
            let src = list_index(&next, result.source.container_id)?;
            let dst = list_index(&next, destination.container_id)?;
            let moved = take_at(
                &mut next.lists[src].cards,
                result.source,
                result.draggable_id,
                |card| card.id,
            )?;
            insert_clamped(&mut next.lists[dst].cards, destination.index, moved);
            next.lists[src].renumber();
            if dst != src {
                next.lists[dst].renumber();
            }
        }
    }

    log::trace!(
        "Reordered {:?} {} from {}:{} to {}:{}",
        result.kind,
        result.draggable_id,
        result.source.container_id,
        result.source.index,
        destination.container_id,
        destination.index
    );
    Ok(next)
}

fn list_index(board: &Board, list_id: Uuid) -> Result<usize, ReorderError> {
    board
        .lists
        .iter()
        .position(|l| l.id == list_id)
        .ok_or(ReorderError::UnknownContainer(list_id))
}

fn take_at<T>(
    items: &mut Vec<T>,
    source: DragLocation,
    expected: Uuid,
    id_of: impl Fn(&T) -> Uuid,
) -> Result<T, ReorderError> {
    let found = items
        .get(source.index)
        .map(&id_of)
        .ok_or(ReorderError::SourceOutOfRange {
            container_id: source.container_id,
            index: source.index,
            len: items.len(),
        })?;
    if found != expected {
        return Err(ReorderError::StaleSource {
            expected,
            found,
            index: source.index,
        });
    }
    Ok(items.remove(source.index))
}

fn insert_clamped<T>(items: &mut Vec<T>, index: usize, item: T) {
    let index = index.min(items.len());
    items.insert(index, item);
}
