//! Fixtures shared by the server's unit and scenario tests.

use std::sync::Arc;

use chrono::Utc;
use murmur_shared::models::User;
use murmur_shared::protocol::ServerEvent;
use murmur_shared::types::{ConnectionId, UserId};
use murmur_store::Database;
use tokio::sync::{mpsc, Mutex};

use crate::presence::PresenceRegistry;
use crate::SharedDb;

pub(crate) fn shared(db: Database) -> SharedDb {
    Arc::new(Mutex::new(db))
}

pub(crate) fn user(db: &Database, username: &str) -> User {
    let user = User {
        id: UserId::new(),
        username: username.to_string(),
        full_name: format!("{}{}", username[..1].to_uppercase(), &username[1..]),
        avatar: None,
        created_at: Utc::now(),
    };
    db.insert_user(&user).unwrap();
    user
}

pub(crate) fn befriend(db: &Database, a: &User, b: &User) {
    let request = db.insert_friend_request(a.id, b.id).unwrap();
    db.accept_friend_request(request.id).unwrap();
}

/// Register a fake connection for `user` and discard the presence
/// broadcasts it caused.
pub(crate) async fn online(
    presence: &PresenceRegistry,
    user: UserId,
) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
    let id = ConnectionId::new();
    let (tx, mut rx) = mpsc::channel(64);
    presence.connect(user, id, tx).await;
    drain(&mut rx);
    (id, rx)
}

pub(crate) fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Drain and keep only events with the given wire name.
pub(crate) fn drain_named(rx: &mut mpsc::Receiver<ServerEvent>, name: &str) -> Vec<ServerEvent> {
    drain(rx).into_iter().filter(|e| e.name() == name).collect()
}
