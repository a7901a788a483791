//! Persistence reconciler: makes a local drop durable.
//!
//! Only the client that performed the drop persists it. The new order is
//! diffed against the pre-drop board and each changed card or list becomes
//! one independent partial update. A failed update is retried a bounded
//! number of times and then reported, never silently dropped.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use kanban_core::{Board, DragKind, DropResult};
use thiserror::Error;
use uuid::Uuid;

use crate::error::SyncError;

/// One partial update against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionUpdate {
    Card {
        card_id: Uuid,
        list_id: Uuid,
        position: u32,
        /// Previous list when the card crossed containers.
        moved_from: Option<Uuid>,
    },
    List {
        list_id: Uuid,
        position: u32,
    },
}

impl PositionUpdate {
    pub fn target(&self) -> Uuid {
        match self {
            PositionUpdate::Card { card_id, .. } => *card_id,
            PositionUpdate::List { list_id, .. } => *list_id,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Record {0} not found")]
    NotFound(Uuid),
    #[error("Update rejected: {0}")]
    Rejected(String),
}

/// Durable home of card and list positions.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn update_card(
        &self,
        card_id: Uuid,
        list_id: Uuid,
        position: u32,
    ) -> Result<(), StoreError>;

    async fn update_list(&self, list_id: Uuid, position: u32) -> Result<(), StoreError>;
}

/// Updates needed to move the store from `before` to `after`.
///
/// Only containers touched by `result` are inspected; within them, every
/// entity whose container or position changed gets an update.
pub fn plan_position_updates(
    before: &Board,
    after: &Board,
    result: &DropResult,
) -> Vec<PositionUpdate> {
    let Some(destination) = result.destination else {
        return Vec::new();
    };

    match result.kind {
        DragKind::List => after
            .lists
            .iter()
            .filter(|list| before.list(list.id).map(|l| l.position) != Some(list.position))
            .map(|list| PositionUpdate::List {
                list_id: list.id,
                position: list.position,
            })
            .collect(),
        DragKind::Card => {
            let mut containers = vec![result.source.container_id];
            if destination.container_id != result.source.container_id {
                containers.push(destination.container_id);
            }

            let mut updates = Vec::new();
            for list in containers.iter().filter_map(|id| after.list(*id)) {
                for card in &list.cards {
                    let previous = before
                        .find_card(card.id)
                        .map(|(li, ci)| (before.lists[li].id, before.lists[li].cards[ci].position));
                    let moved_from = match previous {
                        Some((old_list, _)) if old_list != list.id => Some(old_list),
                        _ => None,
                    };
                    if previous != Some((list.id, card.position)) {
                        updates.push(PositionUpdate::Card {
                            card_id: card.id,
                            list_id: list.id,
                            position: card.position,
                            moved_from,
                        });
                    }
                }
            }
            updates
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub succeeded: Vec<PositionUpdate>,
    pub failed: Vec<(PositionUpdate, SyncError)>,
}

impl ReconcileReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Reconciler<P: PositionStore> {
    store: P,
    config: ReconcilerConfig,
}

impl<P: PositionStore> Reconciler<P> {
    pub fn new(store: P) -> Self {
        Self::with_config(store, ReconcilerConfig::default())
    }

    pub fn with_config(store: P, config: ReconcilerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &P {
        &self.store
    }

    /// Issue every update. Calls run concurrently and fail independently.
    pub async fn persist(&self, updates: &[PositionUpdate]) -> ReconcileReport {
        let outcomes = join_all(updates.iter().map(|u| self.persist_one(*u))).await;

        let mut report = ReconcileReport::default();
        for (update, outcome) in updates.iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.succeeded.push(*update),
                Err(e) => {
                    log::error!("Giving up on position update for {}: {e}", update.target());
                    report.failed.push((*update, e));
                }
            }
        }
        log::debug!(
            "Reconciled {} position updates ({} failed)",
            report.succeeded.len() + report.failed.len(),
            report.failed.len()
        );
        report
    }

    async fn persist_one(&self, update: PositionUpdate) -> Result<(), SyncError> {
        let mut attempt = 0;
        loop {
            let result = match update {
                PositionUpdate::Card { card_id, list_id, position, .. } => {
                    self.store.update_card(card_id, list_id, position).await
                }
                PositionUpdate::List { list_id, position } => {
                    self.store.update_list(list_id, position).await
                }
            };
            match result {
                Ok(()) => return Ok(()),
                // A missing record will not appear by retrying.
                Err(e @ StoreError::NotFound(_)) => {
                    return Err(SyncError::Persistence {
                        target: update.target(),
                        message: e.to_string(),
                    })
                }
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    log::warn!(
                        "Position update for {} failed (attempt {attempt}): {e}",
                        update.target()
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => {
                    return Err(SyncError::Persistence {
                        target: update.target(),
                        message: e.to_string(),
                    })
                }
            }
        }
    }
}
