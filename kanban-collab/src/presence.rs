//! Presence channel: who is looking at this board.
//!
//! ## Architecture
//!
//! ```text
//! RoomMembership::join()  ── Join ──►  relay
//!       │                                │
//!       │ (dropped)                      ├── UsersList        (replace)
//!       ▼                                ├── UserJoined       (add, dedup by id)
//!     Leave ──►  relay                   └── UserDisconnected (remove)
//!                                              │
//!                                              ▼
//!                                    PresenceSet::apply()
//!                                              │
//!                                              ▼
//!                                        avatars stack
//! ```
//!
//! Membership is a guard value: whatever path drops it (unmount, board
//! switch, error unwinding) sends the matching `Leave`.

use std::collections::HashMap;
use uuid::Uuid;

use crate::client::RelaySink;
use crate::error::SyncError;
use crate::protocol::{ClientMessage, ServerMessage, UserInfo};

/// Users currently viewing a board, unique by user id.
#[derive(Debug, Clone, Default)]
pub struct PresenceSet {
    users: HashMap<Uuid, UserInfo>,
}

impl PresenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole set. Later duplicates of an id win.
    pub fn replace(&mut self, users: Vec<UserInfo>) {
        self.users = users.into_iter().map(|u| (u.user_id, u)).collect();
    }

    /// Add or refresh a user. Returns `true` if the id was not present.
    pub fn join(&mut self, user: UserInfo) -> bool {
        self.users.insert(user.user_id, user).is_none()
    }

    pub fn disconnect(&mut self, user_id: &Uuid) -> Option<UserInfo> {
        self.users.remove(user_id)
    }

    /// Apply a presence message. Returns `true` if the set changed;
    /// non-presence messages are ignored.
    pub fn apply(&mut self, msg: &ServerMessage) -> bool {
        match msg {
            ServerMessage::UsersList { users } => {
                self.replace(users.clone());
                true
            }
            ServerMessage::UserJoined { user, .. } => {
                let changed = self.users.get(&user.user_id) != Some(user);
                self.join(user.clone());
                changed
            }
            ServerMessage::UserDisconnected { user_id } => self.disconnect(user_id).is_some(),
            _ => false,
        }
    }

    pub fn contains(&self, user_id: &Uuid) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn get(&self, user_id: &Uuid) -> Option<&UserInfo> {
        self.users.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }

    /// Users sorted by name then id, for a stable avatar stack.
    pub fn avatars(&self) -> Vec<&UserInfo> {
        let mut users: Vec<&UserInfo> = self.users.values().collect();
        users.sort_by(|a, b| a.name.cmp(&b.name).then(a.user_id.cmp(&b.user_id)));
        users
    }
}

/// Scoped membership of one board room.
///
/// Created by [`RoomMembership::join`], which sends `Join`. Dropping it sends
/// `Leave`; a failed send on drop is logged, since the relay also drops the
/// membership when the connection closes.
pub struct RoomMembership<S: RelaySink> {
    sink: S,
    board_id: Uuid,
    user: UserInfo,
    token: String,
    // Cleared when the relay refused the join; nothing to leave then.
    admitted: bool,
}

impl<S: RelaySink> RoomMembership<S> {
    pub fn join(
        sink: S,
        board_id: Uuid,
        user: UserInfo,
        token: impl Into<String>,
    ) -> Result<Self, SyncError> {
        let token = token.into();
        // Send before the guard exists so a failed join never sends Leave.
        sink.send(join_message(board_id, &user, &token))?;
        log::info!("Joined board room {board_id} as {}", user.name);
        Ok(Self {
            sink,
            board_id,
            user,
            token,
            admitted: true,
        })
    }

    /// Drop the guard after the relay rejected the join, without sending
    /// `Leave`.
    pub fn dismiss(mut self) {
        self.admitted = false;
        log::debug!("Join of board room {} was rejected", self.board_id);
    }

    /// Re-send `Join` on the same guard, after the transport reconnected.
    pub fn rejoin(&self) -> Result<(), SyncError> {
        log::debug!("Rejoining board room {}", self.board_id);
        self.sink
            .send(join_message(self.board_id, &self.user, &self.token))
    }

    pub fn board_id(&self) -> Uuid {
        self.board_id
    }
}

fn join_message(board_id: Uuid, user: &UserInfo, token: &str) -> ClientMessage {
    ClientMessage::Join {
        board_id,
        user: user.clone(),
        token: token.to_string(),
    }
}

impl<S: RelaySink> Drop for RoomMembership<S> {
    fn drop(&mut self) {
        if !self.admitted {
            return;
        }
        match self.sink.send(ClientMessage::Leave { board_id: self.board_id }) {
            Ok(()) => log::info!("Left board room {}", self.board_id),
            Err(e) => log::debug!("Leave for board {} not sent: {e}", self.board_id),
        }
    }
}
