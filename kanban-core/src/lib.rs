//! # kanban-core: Board model and reorder engine
//!
//! In-memory snapshot of a shared Kanban board plus the pure function that
//! every peer runs to apply a finished drag.
//!
//! ```text
//! Board ── lists: Vec<List> ── cards: Vec<Card>
//!   │
//!   └── reorder(&Board, &DropResult) -> Board'
//! ```
//!
//! The persistence layer owns the durable copy; this crate only reads and
//! reorders snapshots, so it has no I/O.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod reorder;
pub mod snapshot;

pub use reorder::{reorder, DragKind, DragLocation, DropResult, ReorderError};
pub use snapshot::{CardSnapshot, ItemSnapshot, ListSnapshot};

/// A user with access to the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: Uuid,
    pub name: String,
}

/// Assignment of a card to a user.
///
/// `assigned_by` / `assigned_at` are private to the collaborators of the
/// card and never leave the client in a drag broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignee {
    pub user_id: Uuid,
    pub assigned_by: Uuid,
    /// Unix millis
    pub assigned_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub color: String,
}

/// Reference to an uploaded attachment; the bytes live in media storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub id: Uuid,
    pub url: String,
}

/// The atomic draggable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    /// Dense, zero-based within the owning list.
    pub position: u32,
    pub assignees: Vec<Assignee>,
    pub labels: Vec<Label>,
    pub media: Vec<MediaRef>,
}

impl Card {
    pub fn new(title: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), title)
    }

    /// Create with explicit id (for fixtures and tests)
    pub fn with_id(id: Uuid, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            description: String::new(),
            position: 0,
            assignees: Vec::new(),
            labels: Vec::new(),
            media: Vec::new(),
        }
    }
}

/// A column of cards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct List {
    pub id: Uuid,
    pub title: String,
    /// Dense, zero-based within the board.
    pub position: u32,
    pub visible: bool,
    pub cards: Vec<Card>,
}

impl List {
    pub fn new(title: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), title)
    }

    pub fn with_id(id: Uuid, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            position: 0,
            visible: true,
            cards: Vec::new(),
        }
    }

    /// Append a card, assigning it the next position.
    pub fn push_card(&mut self, mut card: Card) {
        card.position = self.cards.len() as u32;
        self.cards.push(card);
    }

    pub fn card_ids(&self) -> Vec<Uuid> {
        self.cards.iter().map(|c| c.id).collect()
    }

    /// Rewrite card positions to match their index.
    pub fn renumber(&mut self) {
        for (index, card) in self.cards.iter_mut().enumerate() {
            card.position = index as u32;
        }
    }
}

/// Top-level shared document.
///
/// The board id doubles as the container id of the list order, so a list
/// drag names the board as both source and destination container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub id: Uuid,
    pub title: String,
    pub lists: Vec<List>,
    pub members: Vec<Member>,
}

impl Board {
    pub fn new(title: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), title)
    }

    pub fn with_id(id: Uuid, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            lists: Vec::new(),
            members: Vec::new(),
        }
    }

    /// Append a list, assigning it the next position.
    pub fn push_list(&mut self, mut list: List) {
        list.position = self.lists.len() as u32;
        self.lists.push(list);
    }

    pub fn list(&self, list_id: Uuid) -> Option<&List> {
        self.lists.iter().find(|l| l.id == list_id)
    }

    pub fn list_mut(&mut self, list_id: Uuid) -> Option<&mut List> {
        self.lists.iter_mut().find(|l| l.id == list_id)
    }

    pub fn list_ids(&self) -> Vec<Uuid> {
        self.lists.iter().map(|l| l.id).collect()
    }

    /// Locate a card: `(list index, card index)`.
    pub fn find_card(&self, card_id: Uuid) -> Option<(usize, usize)> {
        self.lists.iter().enumerate().find_map(|(li, list)| {
            list.cards
                .iter()
                .position(|c| c.id == card_id)
                .map(|ci| (li, ci))
        })
    }

    pub fn card(&self, card_id: Uuid) -> Option<&Card> {
        self.find_card(card_id)
            .map(|(li, ci)| &self.lists[li].cards[ci])
    }

    pub fn card_count(&self) -> usize {
        self.lists.iter().map(|l| l.cards.len()).sum()
    }

    /// Rewrite list positions to match their index.
    pub fn renumber_lists(&mut self) {
        for (index, list) in self.lists.iter_mut().enumerate() {
            list.position = index as u32;
        }
    }

    /// Every card appears once and no two siblings share a position.
    pub fn is_consistent(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        let mut list_positions = std::collections::HashSet::new();
        for list in &self.lists {
            if !list_positions.insert(list.position) {
                return false;
            }
            let mut positions = std::collections::HashSet::new();
            for card in &list.cards {
                if !seen.insert(card.id) || !positions.insert(card.position) {
                    return false;
                }
            }
        }
        true
    }
}
