//! Broadcast-safe views of the item being dragged.
//!
//! A snapshot travels to every peer in the room, so it carries only what a
//! ghost needs to display. Assignment metadata is left behind.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Board, Card, DragKind, Label, List, MediaRef};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardSnapshot {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub labels: Vec<Label>,
    pub media: Vec<MediaRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSnapshot {
    pub id: Uuid,
    pub title: String,
    pub card_count: usize,
}

/// Snapshot of whatever is being moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemSnapshot {
    Card(CardSnapshot),
    List(ListSnapshot),
}

impl ItemSnapshot {
    pub fn id(&self) -> Uuid {
        match self {
            ItemSnapshot::Card(card) => card.id,
            ItemSnapshot::List(list) => list.id,
        }
    }

    /// Text shown on a remote ghost.
    pub fn display_name(&self) -> &str {
        match self {
            ItemSnapshot::Card(card) => &card.title,
            ItemSnapshot::List(list) => &list.title,
        }
    }

    pub fn kind(&self) -> DragKind {
        match self {
            ItemSnapshot::Card(_) => DragKind::Card,
            ItemSnapshot::List(_) => DragKind::List,
        }
    }
}

impl From<&Card> for CardSnapshot {
    fn from(card: &Card) -> Self {
        Self {
            id: card.id,
            title: card.title.clone(),
            description: card.description.clone(),
            labels: card.labels.clone(),
            media: card.media.clone(),
        }
    }
}

impl From<&List> for ListSnapshot {
    fn from(list: &List) -> Self {
        Self {
            id: list.id,
            title: list.title.clone(),
            card_count: list.cards.len(),
        }
    }
}

impl Board {
    /// Clean snapshot of a draggable, or `None` if it is not on this board.
    pub fn snapshot_of(&self, draggable_id: Uuid, kind: DragKind) -> Option<ItemSnapshot> {
        match kind {
            DragKind::Card => self
                .card(draggable_id)
                .map(|card| ItemSnapshot::Card(card.into())),
            DragKind::List => self
                .list(draggable_id)
                .map(|list| ItemSnapshot::List(list.into())),
        }
    }
}
