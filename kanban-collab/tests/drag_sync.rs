//! End-to-end drag synchronization through a real relay.
//!
//! Each test starts a relay on an ephemeral port and connects real clients,
//! each driving its own `BoardSession` over the same board snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use kanban_collab::client::{RelayClient, RelayEvent, RelayHandle};
use kanban_collab::drag::DragState;
use kanban_collab::protocol::UserInfo;
use kanban_collab::server::{Authorizer, RelayServer, ServerConfig, StaticTokenAuthorizer};
use kanban_collab::session::{BoardSession, SessionEffect};
use kanban_collab::{AllowAll, SyncError};
use kanban_core::{Board, Card, DragKind, DragLocation, List};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

const BOARD: u128 = 1;

fn id(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

fn list_id(i: u128) -> Uuid {
    id(100 + i)
}

fn card_id(list: u128, j: u128) -> Uuid {
    id(1000 * (list + 1) + j)
}

/// Three lists `col-1..col-3` with three cards each, identical on every peer.
fn fixture() -> Board {
    let mut board = Board::with_id(id(BOARD), "Release");
    for i in 0..3 {
        let mut list = List::with_id(list_id(i), format!("col-{}", i + 1));
        for j in 0..3 {
            list.push_card(Card::with_id(card_id(i, j), format!("c{}", i * 3 + j + 1)));
        }
        board.push_list(list);
    }
    board
}

async fn start_relay(authorizer: Arc<dyn Authorizer>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::with_authorizer(ServerConfig::default(), authorizer);
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    format!("ws://{addr}")
}

struct Peer {
    client: RelayClient,
    events: mpsc::Receiver<RelayEvent>,
    session: BoardSession<RelayHandle>,
}

impl Peer {
    async fn connect(url: &str, user: UserInfo, token: &str) -> Self {
        let mut client = RelayClient::new(url);
        let events = client.take_event_rx().unwrap();
        client.connect().await.unwrap();
        let session = BoardSession::new(client.sink(), user, token, fixture());
        let mut peer = Self { client, events, session };
        peer.pump_until(|_, _| true).await;
        peer.session.enter().unwrap();
        peer
    }

    /// Feed relay events into the session until `done` holds.
    async fn pump_until(
        &mut self,
        mut done: impl FnMut(&BoardSession<RelayHandle>, &SessionEffect) -> bool,
    ) -> SessionEffect {
        let session = &mut self.session;
        let events = &mut self.events;
        timeout(Duration::from_secs(3), async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                let effect = session.handle_event(event);
                if done(session, &effect) {
                    return effect;
                }
            }
        })
        .await
        .expect("condition not reached in time")
    }

    async fn wait_for_presence(&mut self, n: usize) {
        self.pump_until(|s, _| s.presence().len() == n).await;
    }
}

#[tokio::test]
async fn test_presence_join_and_leave() {
    let url = start_relay(Arc::new(AllowAll)).await;
    let alice = UserInfo::new("Alice");
    let bob = UserInfo::new("Bob");

    let mut a = Peer::connect(&url, alice.clone(), "").await;
    a.wait_for_presence(1).await;

    let mut b = Peer::connect(&url, bob.clone(), "").await;
    b.wait_for_presence(2).await;
    a.wait_for_presence(2).await;
    let names: Vec<&str> = a.session.presence().avatars().iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["Alice", "Bob"]);

    // Bob navigates away: the membership guard sends Leave.
    drop(b);
    a.wait_for_presence(1).await;
    assert!(!a.session.presence().contains(&bob.user_id));
}

#[tokio::test]
async fn test_peer_refused_while_card_is_dragged() {
    let url = start_relay(Arc::new(AllowAll)).await;
    let mut a = Peer::connect(&url, UserInfo::new("Alice"), "").await;
    a.wait_for_presence(1).await;
    let mut b = Peer::connect(&url, UserInfo::new("Bob"), "").await;
    b.wait_for_presence(2).await;

    let c1 = card_id(0, 0);
    a.session
        .begin_drag(c1, DragKind::Card, DragLocation::new(list_id(0), 0))
        .unwrap();

    b.pump_until(|s, _| s.lock().is_some_and(|l| l.draggable_id == c1)).await;
    assert_eq!(b.session.drag_state(), DragState::RemoteDragActive);
    assert_eq!(b.session.projection().unwrap().item_name, "c1");
    assert!(!b.session.can_drag(c1));
    assert_eq!(
        b.session
            .begin_drag(c1, DragKind::Card, DragLocation::new(list_id(0), 0)),
        Err(SyncError::Conflict { draggable_id: c1 })
    );

    // Alice drops c1 into col-1; both peers end up with the same board.
    let dropped = a.session.end_drag(Some(DragLocation::new(list_id(1), 1))).unwrap();
    assert!(!dropped.updates.is_empty());
    let effect = b
        .pump_until(|_, e| *e == SessionEffect::BoardReordered)
        .await;
    assert_eq!(effect, SessionEffect::BoardReordered);

    assert_eq!(a.session.board(), b.session.board());
    assert!(b.session.lock().is_none());
    assert!(b.session.projection().is_none());
    assert!(b.session.can_drag(c1));
    assert_eq!(
        b.session.board().list(list_id(1)).unwrap().card_ids(),
        vec![card_id(1, 0), c1, card_id(1, 1), card_id(1, 2)]
    );
}

#[tokio::test]
async fn test_list_move_converges_on_both_peers() {
    let url = start_relay(Arc::new(AllowAll)).await;
    let mut a = Peer::connect(&url, UserInfo::new("Alice"), "").await;
    a.wait_for_presence(1).await;
    let mut b = Peer::connect(&url, UserInfo::new("Bob"), "").await;
    b.wait_for_presence(2).await;

    // col-2 from index 1 to the front.
    let col2 = list_id(1);
    a.session
        .begin_drag(col2, DragKind::List, DragLocation::new(id(BOARD), 1))
        .unwrap();
    a.session
        .drag_updated(Some(DragLocation::new(id(BOARD), 0)))
        .unwrap();
    a.session.end_drag(Some(DragLocation::new(id(BOARD), 0))).unwrap();

    b.pump_until(|_, e| *e == SessionEffect::BoardReordered).await;

    let expected = vec![list_id(1), list_id(0), list_id(2)];
    assert_eq!(a.session.board().list_ids(), expected);
    assert_eq!(b.session.board().list_ids(), expected);
    let titles: Vec<&str> = b.session.board().lists.iter().map(|l| l.title.as_str()).collect();
    assert_eq!(titles, vec!["col-2", "col-1", "col-3"]);
    assert_eq!(a.session.board(), b.session.board());
    assert!(b.session.board().is_consistent());
}

#[tokio::test]
async fn test_unauthorized_join_requires_reauthentication() {
    let alice = UserInfo::new("Alice");
    let auth = StaticTokenAuthorizer::new(HashMap::from([(alice.user_id, "letmein".to_string())]));
    let url = start_relay(Arc::new(auth)).await;

    let mut ok = Peer::connect(&url, alice, "letmein").await;
    ok.wait_for_presence(1).await;

    let mut intruder = Peer::connect(&url, UserInfo::new("Mallory"), "guess").await;
    let effect = intruder
        .pump_until(|_, e| matches!(e, SessionEffect::Reauthenticate { .. }))
        .await;
    assert!(matches!(effect, SessionEffect::Reauthenticate { .. }));
    assert!(intruder.session.presence().is_empty());
}

#[tokio::test]
async fn test_disconnect_mid_drag_clears_projection_and_lock() {
    let url = start_relay(Arc::new(AllowAll)).await;
    let alice = UserInfo::new("Alice");
    let mut a = Peer::connect(&url, alice.clone(), "").await;
    a.wait_for_presence(1).await;
    let mut b = Peer::connect(&url, UserInfo::new("Bob"), "").await;
    b.wait_for_presence(2).await;

    let c5 = card_id(1, 1);
    a.session
        .begin_drag(c5, DragKind::Card, DragLocation::new(list_id(1), 1))
        .unwrap();
    b.pump_until(|s, _| s.lock().is_some() && s.projection().is_some()).await;

    // Tab closed mid-drag: no end is ever sent by Alice.
    a.client.disconnect();

    b.pump_until(|s, _| !s.presence().contains(&alice.user_id)).await;
    assert!(b.session.projection().is_none());
    assert!(b.session.lock().is_none());
    assert!(b.session.can_drag(c5));
    assert_eq!(b.session.board(), &fixture());
}
