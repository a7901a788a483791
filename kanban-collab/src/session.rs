//! Board session: everything one board view needs to stay in sync.
//!
//! ```text
//!  pointer / drag callbacks ──► BoardSession ──► RelaySink ──► relay
//!                                    ▲
//!  RelayEvent (from RelayClient) ────┘
//!        │
//!        ├── PresenceSet        avatars
//!        ├── DragMachine        local drag + remote projection
//!        ├── ConflictGuard      lock on a peer's item
//!        ├── GhostRenderer      overlay for the projection
//!        └── Board              reordered on every DragEnded
//! ```
//!
//! The session is a plain `&mut` state machine; all I/O lives behind the
//! injected sink and in the relay client's tasks. Cosmetic sends (coords,
//! hover updates) that fail are logged and dropped.

use std::time::{Duration, Instant};

use kanban_core::{reorder, Board, DragKind, DragLocation, DropResult};
use uuid::Uuid;

use crate::client::{RelayEvent, RelaySink};
use crate::conflict::{ConflictGuard, Lock};
use crate::drag::{projection_from_start, DragMachine, DragState, RemoteDragProjection};
use crate::error::SyncError;
use crate::ghost::{self, GhostOverlay, GhostRenderer, Viewport};
use crate::persist::{plan_position_updates, PositionUpdate};
use crate::presence::{PresenceSet, RoomMembership};
use crate::protocol::{ClientMessage, NormPoint, RejectReason, ServerMessage, UserInfo};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Minimum spacing of outgoing coordinates; zero sends every sample.
    pub coords_interval: Duration,
    pub ghost_debounce: Duration,
    pub ghost_smoothing: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            coords_interval: Duration::ZERO,
            ghost_debounce: ghost::DEFAULT_DEBOUNCE,
            ghost_smoothing: ghost::DEFAULT_SMOOTHING,
        }
    }
}

/// What the view should do after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    None,
    /// Presence, ghost or lock changed.
    Redraw,
    /// A peer's drop changed the board order.
    BoardReordered,
    /// The relay refused our grab; the local drag was cancelled.
    LocalDragRefused { draggable_id: Uuid },
    /// The transport dropped mid-drag. The relay already ended the drag for
    /// peers, so the local drag was cancelled too.
    LocalDragInterrupted { draggable_id: Uuid },
    /// The room has no space for us. Not fatal.
    RoomFull,
    /// Credentials rejected. The view must be torn down.
    Reauthenticate { reason: String },
}

/// Result of a finished local drag. `updates` go to the reconciler.
#[derive(Debug, Clone)]
pub struct LocalDrop {
    pub result: DropResult,
    pub updates: Vec<PositionUpdate>,
}

pub struct BoardSession<S: RelaySink + Clone> {
    sink: S,
    user: UserInfo,
    token: String,
    board: Board,
    presence: PresenceSet,
    drag: DragMachine,
    guard: ConflictGuard,
    ghost: GhostRenderer,
    membership: Option<RoomMembership<S>>,
}

impl<S: RelaySink + Clone> BoardSession<S> {
    pub fn new(sink: S, user: UserInfo, token: impl Into<String>, board: Board) -> Self {
        Self::with_config(sink, user, token, board, SessionConfig::default())
    }

    pub fn with_config(
        sink: S,
        user: UserInfo,
        token: impl Into<String>,
        board: Board,
        config: SessionConfig,
    ) -> Self {
        Self {
            sink,
            user,
            token: token.into(),
            board,
            presence: PresenceSet::new(),
            drag: DragMachine::new(config.coords_interval),
            guard: ConflictGuard::new(),
            ghost: GhostRenderer::new(config.ghost_debounce, config.ghost_smoothing),
            membership: None,
        }
    }

    /// Join the board's room. A no-op while already joined.
    pub fn enter(&mut self) -> Result<(), SyncError> {
        if self.membership.as_ref().is_some_and(|m| m.board_id() == self.board.id) {
            return Ok(());
        }
        self.leave();
        let membership = RoomMembership::join(
            self.sink.clone(),
            self.board.id,
            self.user.clone(),
            self.token.clone(),
        )?;
        self.membership = Some(membership);
        Ok(())
    }

    /// Leave the current room and join `board`'s.
    pub fn switch_board(&mut self, board: Board) -> Result<(), SyncError> {
        self.leave();
        self.board = board;
        self.enter()
    }

    /// Leave the room and drop all derived state.
    pub fn leave(&mut self) {
        // Dropping the guard sends Leave.
        self.membership = None;
        self.presence.clear();
        self.drag.abort_local();
        self.reset_remote_state();
    }

    fn reset_remote_state(&mut self) {
        self.drag.reset_remote();
        self.guard.reset();
        self.ghost.frame(None, Instant::now());
    }

    // ── Local input ──────────────────────────────────────────────

    pub fn pointer_moved(&mut self, pointer: NormPoint) {
        if let Some(msg) = self.drag.record_pointer(pointer) {
            self.send_cosmetic(msg);
        }
    }

    /// Whether a grab of `draggable_id` would be accepted locally.
    pub fn can_drag(&self, draggable_id: Uuid) -> bool {
        self.drag.local().is_none() && self.guard.can_start(draggable_id).is_ok()
    }

    /// Start dragging. Refused before anything is sent if a peer holds the
    /// item.
    pub fn begin_drag(
        &mut self,
        draggable_id: Uuid,
        kind: DragKind,
        source: DragLocation,
    ) -> Result<(), SyncError> {
        self.guard.can_start(draggable_id)?;
        let item = self
            .board
            .snapshot_of(draggable_id, kind)
            .ok_or(SyncError::InvalidState("draggable is not on this board"))?;
        let msg = self.drag.begin_local(draggable_id, source, item)?;
        if let Err(e) = self.sink.send(msg) {
            // The drag still works locally; peers just won't see it.
            log::warn!("Drag start of {draggable_id} not broadcast: {e}");
        }
        Ok(())
    }

    pub fn drag_updated(&mut self, destination: Option<DragLocation>) -> Result<(), SyncError> {
        if let Some(msg) = self.drag.update_local(destination)? {
            self.send_cosmetic(msg);
        }
        Ok(())
    }

    /// Finish the local drag: broadcast the end, apply it, and plan the
    /// position updates to persist.
    pub fn end_drag(&mut self, destination: Option<DragLocation>) -> Result<LocalDrop, SyncError> {
        let (result, msg) = self.drag.end_local(destination)?;
        if let Err(e) = self.sink.send(msg) {
            log::warn!("Drag end of {} not broadcast: {e}", result.draggable_id);
        }

        let reordered = reorder(&self.board, &result)?;
        let updates = plan_position_updates(&self.board, &reordered, &result);
        self.board = reordered;
        Ok(LocalDrop { result, updates })
    }

    fn send_cosmetic(&self, msg: ClientMessage) {
        if let Err(e) = self.sink.send(msg) {
            log::trace!("Dropped cosmetic drag message: {e}");
        }
    }

    // ── Relay input ──────────────────────────────────────────────

    pub fn handle_event(&mut self, event: RelayEvent) -> SessionEffect {
        match event {
            RelayEvent::Connected => {
                // Fresh transport: anything remote we knew is stale, and the
                // relay holds no engagement for a drag begun before it.
                let interrupted = self.interrupt_local_drag();
                self.reset_remote_state();
                if let Some(membership) = &self.membership {
                    if let Err(e) = membership.rejoin() {
                        log::warn!("Rejoin of board {} failed: {e}", membership.board_id());
                    }
                }
                interrupted.unwrap_or(SessionEffect::Redraw)
            }
            RelayEvent::Disconnected => {
                log::info!("Relay lost, clearing drag state");
                let interrupted = self.interrupt_local_drag();
                self.reset_remote_state();
                self.presence.clear();
                interrupted.unwrap_or(SessionEffect::Redraw)
            }
            RelayEvent::Inbound(msg) => self.handle_message(msg),
        }
    }

    fn interrupt_local_drag(&mut self) -> Option<SessionEffect> {
        let local = self.drag.abort_local()?;
        log::warn!("Drag of {} cancelled by transport loss", local.draggable_id);
        Some(SessionEffect::LocalDragInterrupted {
            draggable_id: local.draggable_id,
        })
    }

    pub fn handle_message(&mut self, msg: ServerMessage) -> SessionEffect {
        match msg {
            ServerMessage::UsersList { .. } | ServerMessage::UserJoined { .. } => {
                redraw_if(self.presence.apply(&msg))
            }

            ServerMessage::UserDisconnected { user_id } => {
                let left = self.presence.apply(&msg);
                let projection = self.drag.clear_remote_from(user_id);
                let lock = self.guard.release_holder(user_id);
                redraw_if(left || projection || lock)
            }

            ServerMessage::DragStarted {
                draggable_id,
                kind: _,
                source,
                initiator_id,
                initiator_name,
                item,
                pointer,
            } => {
                let projection = projection_from_start(
                    initiator_id,
                    initiator_name,
                    draggable_id,
                    source,
                    &item,
                    pointer,
                );
                self.drag.remote_started(projection);
                SessionEffect::Redraw
            }

            ServerMessage::DragCoords { from, pointer, seq } => {
                redraw_if(self.drag.remote_coords(from, pointer, seq))
            }

            ServerMessage::DragUpdated { from, destination } => {
                redraw_if(self.drag.remote_updated(from, destination))
            }

            ServerMessage::DragEnded { from, result } => {
                self.drag.remote_ended();
                self.guard.release_on_end(result.draggable_id, from);
                if result.destination.is_none() {
                    return SessionEffect::Redraw;
                }
                match reorder(&self.board, &result) {
                    Ok(board) => {
                        self.board = board;
                        SessionEffect::BoardReordered
                    }
                    Err(e) => {
                        log::warn!("Drop by {from} does not apply to the local board: {e}");
                        SessionEffect::Redraw
                    }
                }
            }

            ServerMessage::DragConflict { draggable_id, holder } => {
                let ours = self
                    .drag
                    .local()
                    .is_some_and(|l| l.draggable_id == draggable_id);
                if ours {
                    // Refused even when another tab of ours holds it: the
                    // relay would ignore our end.
                    self.drag.abort_local();
                    if holder != Some(self.user.user_id) {
                        self.guard.lock(draggable_id, holder);
                    }
                    log::info!("Grab of {draggable_id} refused by relay");
                    return SessionEffect::LocalDragRefused { draggable_id };
                }
                if holder == Some(self.user.user_id) {
                    return SessionEffect::None;
                }
                self.guard.lock(draggable_id, holder);
                SessionEffect::Redraw
            }

            ServerMessage::JoinRejected { reason } => {
                // Never admitted, so there is no room to leave.
                if let Some(membership) = self.membership.take() {
                    membership.dismiss();
                }
                self.leave();
                match reason {
                    RejectReason::Unauthorized => {
                        let err = SyncError::Unauthorized {
                            reason: "relay rejected credentials".into(),
                        };
                        log::error!("{err}");
                        SessionEffect::Reauthenticate { reason: err.to_string() }
                    }
                    RejectReason::RoomFull => {
                        log::warn!("Board {} is full", self.board.id);
                        SessionEffect::RoomFull
                    }
                }
            }

            ServerMessage::Pong => SessionEffect::None,
        }
    }

    // ── Rendering ────────────────────────────────────────────────

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.ghost.set_viewport(viewport);
    }

    pub fn observe_column_width(&mut self, width: f32, now: Instant) {
        self.ghost.observe_column_width(width, now);
    }

    /// Ghost overlay for this frame, if a peer is dragging.
    pub fn ghost(&mut self, now: Instant) -> Option<GhostOverlay> {
        self.ghost.frame(self.drag.projection(), now)
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn presence(&self) -> &PresenceSet {
        &self.presence
    }

    pub fn drag_state(&self) -> DragState {
        self.drag.state()
    }

    pub fn projection(&self) -> Option<&RemoteDragProjection> {
        self.drag.projection()
    }

    pub fn lock(&self) -> Option<Lock> {
        self.guard.current()
    }

    pub fn is_joined(&self) -> bool {
        self.membership.is_some()
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }
}

fn redraw_if(changed: bool) -> SessionEffect {
    if changed {
        SessionEffect::Redraw
    } else {
        SessionEffect::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::RecordingSink;
    use kanban_core::{Card, List};

    const BOARD: u128 = 1;
    const TODO: u128 = 100;
    const DOING: u128 = 101;
    const C1: u128 = 1000;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn board() -> Board {
        let mut board = Board::with_id(id(BOARD), "Sprint");
        let mut todo = List::with_id(id(TODO), "Todo");
        todo.push_card(Card::with_id(id(C1), "c1"));
        todo.push_card(Card::with_id(id(C1 + 1), "c2"));
        board.push_list(todo);
        let mut doing = List::with_id(id(DOING), "Doing");
        doing.push_card(Card::with_id(id(2000), "d1"));
        board.push_list(doing);
        board
    }

    fn session() -> (BoardSession<RecordingSink>, RecordingSink) {
        let sink = RecordingSink::default();
        let mut session =
            BoardSession::new(sink.clone(), UserInfo::with_id(id(7), "Bob"), "tok", board());
        session.enter().unwrap();
        sink.take();
        (session, sink)
    }

    fn alice() -> UserInfo {
        UserInfo::with_id(id(8), "Alice")
    }

    fn started_by_alice(draggable: u128) -> ServerMessage {
        let board = board();
        let item = board.snapshot_of(id(draggable), DragKind::Card).unwrap();
        ServerMessage::DragStarted {
            draggable_id: id(draggable),
            kind: DragKind::Card,
            source: DragLocation::new(id(TODO), 0),
            initiator_id: alice().user_id,
            initiator_name: alice().name,
            item,
            pointer: NormPoint::new(0.2, 0.3),
        }
    }

    #[test]
    fn test_enter_is_idempotent_and_leave_on_drop() {
        let (mut session, sink) = session();
        session.enter().unwrap();
        assert!(sink.take().is_empty());

        drop(session);
        assert_eq!(sink.take(), vec![ClientMessage::Leave { board_id: id(BOARD) }]);
    }

    #[test]
    fn test_switch_board_leaves_then_joins() {
        let (mut session, sink) = session();
        let other = Board::with_id(id(2), "Other");
        session.switch_board(other).unwrap();
        let sent = sink.take();
        assert_eq!(sent[0], ClientMessage::Leave { board_id: id(BOARD) });
        assert!(matches!(&sent[1], ClientMessage::Join { board_id, .. } if *board_id == id(2)));
    }

    #[test]
    fn test_local_drag_emits_lifecycle_and_reorders() {
        let (mut session, sink) = session();
        session.pointer_moved(NormPoint::new(0.1, 0.1));
        session
            .begin_drag(id(C1), DragKind::Card, DragLocation::new(id(TODO), 0))
            .unwrap();
        session.pointer_moved(NormPoint::new(0.4, 0.1));
        session
            .drag_updated(Some(DragLocation::new(id(DOING), 1)))
            .unwrap();
        let drop = session.end_drag(Some(DragLocation::new(id(DOING), 1))).unwrap();

        let names: Vec<&str> = sink.take().iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["drag-start", "drag-coords", "drag-update", "drag-end"]);

        let doing = session.board().list(id(DOING)).unwrap();
        assert_eq!(doing.card_ids(), vec![id(2000), id(C1)]);
        assert!(drop.updates.iter().any(|u| matches!(
            u,
            PositionUpdate::Card { card_id, moved_from: Some(from), .. } if *card_id == id(C1) && *from == id(TODO)
        )));
        assert_eq!(session.drag_state(), DragState::Idle);
    }

    #[test]
    fn test_locked_item_refused_before_broadcast() {
        let (mut session, sink) = session();
        session.handle_message(started_by_alice(C1));
        session.handle_message(ServerMessage::DragConflict {
            draggable_id: id(C1),
            holder: Some(alice().user_id),
        });

        assert!(!session.can_drag(id(C1)));
        let err = session
            .begin_drag(id(C1), DragKind::Card, DragLocation::new(id(TODO), 0))
            .unwrap_err();
        assert_eq!(err, SyncError::Conflict { draggable_id: id(C1) });
        assert!(sink.take().is_empty());

        // A different card is fine.
        assert!(session.can_drag(id(C1 + 1)));
    }

    #[test]
    fn test_remote_drag_renders_ghost_then_reorders() {
        let (mut session, _sink) = session();
        session.set_viewport(Viewport::new(1000.0, 500.0));
        assert_eq!(session.handle_message(started_by_alice(C1)), SessionEffect::Redraw);
        assert_eq!(session.drag_state(), DragState::RemoteDragActive);

        let overlay = session.ghost(Instant::now()).unwrap();
        assert_eq!(overlay.user_name, "Alice");
        assert_eq!(overlay.item_name, "c1");

        let effect = session.handle_message(ServerMessage::DragEnded {
            from: alice().user_id,
            result: DropResult {
                draggable_id: id(C1),
                kind: DragKind::Card,
                source: DragLocation::new(id(TODO), 0),
                destination: Some(DragLocation::new(id(DOING), 0)),
            },
        });
        assert_eq!(effect, SessionEffect::BoardReordered);
        assert!(session.ghost(Instant::now()).is_none());
        assert_eq!(session.board().list(id(DOING)).unwrap().cards[0].id, id(C1));
    }

    #[test]
    fn test_conflict_on_own_drag_aborts_it() {
        let (mut session, sink) = session();
        session
            .begin_drag(id(C1), DragKind::Card, DragLocation::new(id(TODO), 0))
            .unwrap();
        let effect = session.handle_message(ServerMessage::DragConflict {
            draggable_id: id(C1),
            holder: Some(alice().user_id),
        });
        assert_eq!(effect, SessionEffect::LocalDragRefused { draggable_id: id(C1) });
        assert_eq!(session.drag_state(), DragState::Idle);
        // Start was sent, no end follows.
        let names: Vec<&str> = sink.take().iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["drag-start"]);
    }

    #[test]
    fn test_conflict_held_by_own_other_tab_aborts_drag() {
        let (mut session, sink) = session();
        let me = session.user().user_id;
        session
            .begin_drag(id(C1), DragKind::Card, DragLocation::new(id(TODO), 0))
            .unwrap();
        let effect = session.handle_message(ServerMessage::DragConflict {
            draggable_id: id(C1),
            holder: Some(me),
        });
        assert_eq!(effect, SessionEffect::LocalDragRefused { draggable_id: id(C1) });
        assert_eq!(session.drag_state(), DragState::Idle);
        // Our own hold never locks us out.
        assert!(session.lock().is_none());

        // Nothing left to drop, so nothing is reordered or persisted.
        let before = session.board().clone();
        assert!(session.end_drag(Some(DragLocation::new(id(DOING), 0))).is_err());
        assert_eq!(session.board(), &before);
        let names: Vec<&str> = sink.take().iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["drag-start"]);
    }

    #[test]
    fn test_own_lock_echo_is_ignored() {
        let (mut session, _sink) = session();
        let me = session.user().user_id;
        let effect = session.handle_message(ServerMessage::DragConflict {
            draggable_id: id(C1),
            holder: Some(me),
        });
        assert_eq!(effect, SessionEffect::None);
        assert!(session.can_drag(id(C1)));
    }

    #[test]
    fn test_transport_loss_cancels_local_drag() {
        let (mut session, sink) = session();
        session
            .begin_drag(id(C1), DragKind::Card, DragLocation::new(id(TODO), 0))
            .unwrap();

        let effect = session.handle_event(RelayEvent::Disconnected);
        assert_eq!(effect, SessionEffect::LocalDragInterrupted { draggable_id: id(C1) });
        assert_eq!(session.drag_state(), DragState::Idle);

        assert_eq!(session.handle_event(RelayEvent::Connected), SessionEffect::Redraw);
        let before = session.board().clone();
        assert!(session.end_drag(Some(DragLocation::new(id(DOING), 0))).is_err());
        assert_eq!(session.board(), &before);
        let names: Vec<&str> = sink.take().iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["drag-start", "join"]);
    }

    #[test]
    fn test_reconnect_cancels_drag_begun_while_offline() {
        let (mut session, _sink) = session();
        session
            .begin_drag(id(C1), DragKind::Card, DragLocation::new(id(TODO), 0))
            .unwrap();
        let effect = session.handle_event(RelayEvent::Connected);
        assert_eq!(effect, SessionEffect::LocalDragInterrupted { draggable_id: id(C1) });
        assert_eq!(session.drag_state(), DragState::Idle);
    }

    #[test]
    fn test_disconnect_of_dragger_clears_projection_and_lock() {
        let (mut session, _sink) = session();
        session.handle_message(ServerMessage::UsersList { users: vec![alice()] });
        session.handle_message(started_by_alice(C1));
        session.handle_message(ServerMessage::DragConflict {
            draggable_id: id(C1),
            holder: Some(alice().user_id),
        });

        let effect = session.handle_message(ServerMessage::UserDisconnected {
            user_id: alice().user_id,
        });
        assert_eq!(effect, SessionEffect::Redraw);
        assert!(session.projection().is_none());
        assert!(session.lock().is_none());
        assert!(session.presence().is_empty());
    }

    #[test]
    fn test_transport_loss_resets_remote_state() {
        let (mut session, sink) = session();
        session.handle_message(started_by_alice(C1));
        session.handle_message(ServerMessage::DragConflict { draggable_id: id(C1), holder: None });

        session.handle_event(RelayEvent::Disconnected);
        assert!(session.projection().is_none());
        assert!(session.lock().is_none());

        session.handle_event(RelayEvent::Connected);
        assert!(matches!(sink.take().as_slice(), [ClientMessage::Join { .. }]));
    }

    #[test]
    fn test_unauthorized_requires_reauthentication() {
        let (mut session, _sink) = session();
        let effect = session.handle_message(ServerMessage::JoinRejected {
            reason: RejectReason::Unauthorized,
        });
        assert!(matches!(effect, SessionEffect::Reauthenticate { .. }));
        assert!(!session.is_joined());
    }

    #[test]
    fn test_rejected_join_sends_no_leave() {
        for reason in [RejectReason::Unauthorized, RejectReason::RoomFull] {
            let (mut session, sink) = session();
            session.handle_message(ServerMessage::JoinRejected { reason });
            assert!(!session.is_joined());
            assert!(sink.take().is_empty());
            drop(session);
            assert!(sink.take().is_empty());
        }
    }

    #[test]
    fn test_stale_peer_drop_leaves_board() {
        let (mut session, _sink) = session();
        let before = session.board().clone();
        let effect = session.handle_message(ServerMessage::DragEnded {
            from: alice().user_id,
            result: DropResult {
                draggable_id: id(9999),
                kind: DragKind::Card,
                source: DragLocation::new(id(TODO), 0),
                destination: Some(DragLocation::new(id(DOING), 0)),
            },
        });
        assert_eq!(effect, SessionEffect::Redraw);
        assert_eq!(session.board(), &before);
    }

    #[test]
    fn test_begin_drag_unknown_item() {
        let (mut session, _sink) = session();
        assert!(matches!(
            session.begin_drag(id(4242), DragKind::Card, DragLocation::new(id(TODO), 0)),
            Err(SyncError::InvalidState(_))
        ));
    }
}
