//! End-to-end scenarios across presence, delivery, membership and the
//! event router, driven through the same wiring the server uses.

use murmur_shared::models::User;
use murmur_shared::protocol::{ClientEvent, ServerEvent};
use murmur_shared::types::{ConnectionId, MessageStatus, UserId};
use murmur_store::Database;
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::membership::{CreateGroup, LeaveOutcome};
use crate::testing::{befriend, drain, drain_named, user};

struct Client {
    id: ConnectionId,
    rx: mpsc::Receiver<ServerEvent>,
}

async fn connect(state: &AppState, user: UserId) -> Client {
    let id = ConnectionId::new();
    let (tx, rx) = mpsc::channel(64);
    state.router.connect(user, id, tx).await;
    Client { id, rx }
}

fn setup(names: &[&str]) -> (AppState, Vec<User>) {
    let db = Database::open_in_memory().unwrap();
    let users = names.iter().map(|name| user(&db, name)).collect();
    (AppState::new(db, ServerConfig::default()), users)
}

async fn status_of(state: &AppState, message: murmur_shared::types::MessageId) -> MessageStatus {
    state.db.lock().await.get_message(message).unwrap().status
}

fn trip(participants: Vec<UserId>) -> CreateGroup {
    CreateGroup {
        name: "Trip".to_string(),
        participants,
        avatar: None,
    }
}

#[tokio::test]
async fn test_message_lifecycle_sent_delivered_seen() {
    let db = Database::open_in_memory().unwrap();
    let a = user(&db, "alice");
    let b = user(&db, "bob");
    befriend(&db, &a, &b);
    let state = AppState::new(db, ServerConfig::default());

    let mut alice = connect(&state, a.id).await;
    let message = state.delivery.send(a.id, *b.id.as_uuid(), "hi").await.unwrap();
    assert_eq!(message.status, MessageStatus::Sent);

    let mut bob = connect(&state, b.id).await;
    assert_eq!(status_of(&state, message.id).await, MessageStatus::Delivered);
    assert_eq!(
        drain_named(&mut alice.rx, "messageDelivered"),
        vec![ServerEvent::MessageDelivered {
            message_id: message.id,
            receiver_id: b.id
        }]
    );
    drain(&mut bob.rx);

    state
        .router
        .dispatch(
            bob.id,
            ClientEvent::MarkMessagesAsSeen {
                sender_id: a.id,
                seen_by: b.id,
            },
        )
        .await;
    assert_eq!(status_of(&state, message.id).await, MessageStatus::Seen);
    assert_eq!(
        drain(&mut alice.rx),
        vec![ServerEvent::MessagesSeen { receiver_id: b.id }]
    );
}

#[tokio::test]
async fn test_seen_is_never_regressed_by_reconnect() {
    let db = Database::open_in_memory().unwrap();
    let a = user(&db, "alice");
    let b = user(&db, "bob");
    befriend(&db, &a, &b);
    let state = AppState::new(db, ServerConfig::default());

    let message = state.delivery.send(a.id, *b.id.as_uuid(), "hi").await.unwrap();
    state.delivery.mark_seen(b.id, a.id).await.unwrap();

    let mut alice = connect(&state, a.id).await;
    let bob = connect(&state, b.id).await;
    state.router.disconnect(bob.id).await;
    connect(&state, b.id).await;

    assert_eq!(status_of(&state, message.id).await, MessageStatus::Seen);
    assert!(drain_named(&mut alice.rx, "messageDelivered").is_empty());
}

#[tokio::test]
async fn test_reconnect_sweeps_exactly_queued_messages() {
    let db = Database::open_in_memory().unwrap();
    let a = user(&db, "alice");
    let b = user(&db, "bob");
    let c = user(&db, "carol");
    befriend(&db, &a, &b);
    befriend(&db, &c, &b);
    let state = AppState::new(db, ServerConfig::default());

    let mut alice = connect(&state, a.id).await;
    let mut carol = connect(&state, c.id).await;
    for text in ["1", "2", "3"] {
        state.delivery.send(a.id, *b.id.as_uuid(), text).await.unwrap();
    }
    state.delivery.send(c.id, *b.id.as_uuid(), "4").await.unwrap();
    // Messages bob sent are not his to sweep.
    state.delivery.send(b.id, *a.id.as_uuid(), "5").await.unwrap();
    drain(&mut alice.rx);

    connect(&state, b.id).await;
    assert_eq!(drain_named(&mut alice.rx, "messageDelivered").len(), 3);
    assert_eq!(drain_named(&mut carol.rx, "messageDelivered").len(), 1);
}

#[tokio::test]
async fn test_one_direct_conversation_per_pair() {
    let db = Database::open_in_memory().unwrap();
    let a = user(&db, "alice");
    let b = user(&db, "bob");
    befriend(&db, &a, &b);
    let state = AppState::new(db, ServerConfig::default());

    let (first, second) = tokio::join!(
        state.delivery.send(a.id, *b.id.as_uuid(), "hi"),
        state.delivery.send(b.id, *a.id.as_uuid(), "hey"),
    );
    assert_eq!(first.unwrap().conversation_id, second.unwrap().conversation_id);
    assert_eq!(state.db.lock().await.conversations_for(a.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_second_tab_keeps_presence_and_offline_is_broadcast_once() {
    let (state, users) = setup(&["alice", "bob"]);
    let (a, b) = (users[0].id, users[1].id);

    let mut observer = connect(&state, b).await;
    drain(&mut observer.rx);
    let tab1 = connect(&state, a).await;
    let tab2 = connect(&state, a).await;
    assert_eq!(
        drain_named(&mut observer.rx, "onlineUsers").len(),
        1,
        "only the first tab announces"
    );

    state.router.disconnect(tab1.id).await;
    assert!(state.presence.is_online(a).await);
    assert!(drain(&mut observer.rx).is_empty());

    state.router.disconnect(tab2.id).await;
    state.router.disconnect(tab2.id).await;
    assert!(!state.presence.is_online(a).await);
    assert_eq!(
        drain(&mut observer.rx),
        vec![ServerEvent::OnlineUsers(vec![b])]
    );
}

#[tokio::test]
async fn test_group_invite_accept_and_admin_succession() {
    let (state, users) = setup(&["admin", "bob", "carol"]);
    let (admin, b, c) = (users[0].id, users[1].id, users[2].id);

    let group = state.membership.create_group(admin, trip(vec![b, c])).await.unwrap();
    let g = group.group().unwrap();
    assert_eq!(g.participants, vec![admin]);
    assert_eq!(g.pending_participants, vec![b, c]);

    let group = state.membership.accept_invite(b, group.id).await.unwrap();
    let g = group.group().unwrap();
    assert_eq!(g.participants, vec![admin, b]);
    assert_eq!(g.pending_participants, vec![c]);

    let mut bob = connect(&state, b).await;
    drain(&mut bob.rx);
    let outcome = state.membership.leave_group(admin, group.id).await.unwrap();
    assert_eq!(outcome, LeaveOutcome::Left { new_admin: Some(b) });

    let stored = state.db.lock().await.get_conversation(group.id).unwrap();
    let g = stored.group().unwrap();
    assert_eq!(g.group_admin, b);
    assert_eq!(g.participants, vec![b]);

    assert!(matches!(
        &drain_named(&mut bob.rx, "newMessage")[..],
        [ServerEvent::NewMessage(m)] if m.is_system_message && m.message == "Admin left the group"
    ));
}

#[tokio::test]
async fn test_rejection_is_private() {
    let (state, users) = setup(&["admin", "bob", "carol"]);
    let (admin, b, c) = (users[0].id, users[1].id, users[2].id);

    let group = state.membership.create_group(admin, trip(vec![b, c])).await.unwrap();
    state.membership.accept_invite(b, group.id).await.unwrap();
    let before = state.db.lock().await.messages_for_conversation(group.id).unwrap().len();

    let mut admin_conn = connect(&state, admin).await;
    let mut bob = connect(&state, b).await;
    drain(&mut admin_conn.rx);
    drain(&mut bob.rx);

    state.membership.reject_invite(c, group.id).await.unwrap();

    let stored = state.db.lock().await.get_conversation(group.id).unwrap();
    let g = stored.group().unwrap();
    assert!(g.pending_participants.is_empty());
    assert_eq!(g.participants, vec![admin, b]);
    assert_eq!(
        state.db.lock().await.messages_for_conversation(group.id).unwrap().len(),
        before
    );
    assert!(drain(&mut admin_conn.rx).is_empty());
    assert!(drain(&mut bob.rx).is_empty());
}

#[tokio::test]
async fn test_concurrent_accept_and_leave_keep_membership_consistent() {
    let (state, users) = setup(&["admin", "bob", "carol", "dave"]);
    let (admin, b, c, d) = (users[0].id, users[1].id, users[2].id, users[3].id);

    let group = state
        .membership
        .create_group(admin, trip(vec![b, c, d]))
        .await
        .unwrap();
    state.membership.accept_invite(b, group.id).await.unwrap();

    let (accepted, left, rejected) = tokio::join!(
        state.membership.accept_invite(c, group.id),
        state.membership.leave_group(b, group.id),
        state.membership.reject_invite(d, group.id),
    );
    accepted.unwrap();
    left.unwrap();
    rejected.unwrap();

    let stored = state.db.lock().await.get_conversation(group.id).unwrap();
    let g = stored.group().unwrap();
    assert_eq!(g.participants, vec![admin, c]);
    assert!(g.pending_participants.is_empty());
    assert_eq!(g.group_admin, admin);
}

#[tokio::test]
async fn test_last_member_leaving_deletes_group() {
    let (state, users) = setup(&["admin", "bob", "carol"]);
    let (admin, b, c) = (users[0].id, users[1].id, users[2].id);

    let group = state.membership.create_group(admin, trip(vec![b, c])).await.unwrap();
    state.membership.accept_invite(b, group.id).await.unwrap();

    state.membership.leave_group(admin, group.id).await.unwrap();
    let outcome = state.membership.leave_group(b, group.id).await.unwrap();
    assert_eq!(outcome, LeaveOutcome::Dissolved);
    assert!(state.db.lock().await.find_conversation(group.id).unwrap().is_none());
    // Carol's pending invite went with it.
    assert!(state.membership.my_conversations(c).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_presence_and_pushes_do_not_wait_on_the_store() {
    let (state, users) = setup(&["alice", "bob"]);
    let (a, b) = (users[0].id, users[1].id);

    let _store = state.db.lock().await;
    let pushed = tokio::time::timeout(std::time::Duration::from_secs(1), async {
        let (tx, mut rx) = mpsc::channel(8);
        state.presence.connect(b, ConnectionId::new(), tx).await;
        drain(&mut rx);
        let reached = state
            .presence
            .send_to_user(
                b,
                ServerEvent::UserTyping {
                    sender_id: a,
                    is_typing: true,
                    conversation_id: None,
                },
            )
            .await;
        (reached, drain(&mut rx).len())
    })
    .await
    .expect("presence work blocked on the store lock");
    assert_eq!(pushed, (1, 1));
}
