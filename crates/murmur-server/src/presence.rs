//! Presence registry: which users are online, through which connections,
//! and which group rooms each connection has joined.
//!
//! A user is online while they hold at least one connection handle. The
//! handle set, not a flag, is the source of truth, so closing one of two
//! tabs never marks the user offline. Every mutation happens under a single
//! write lock, which linearizes connect/disconnect/join per user and room.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use murmur_shared::protocol::ServerEvent;
use murmur_shared::types::{ConnectionId, ConversationId, UserId};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// Sending half of a connection's outbound queue.
pub type Outbound = mpsc::Sender<ServerEvent>;

struct Connection {
    user: UserId,
    tx: Outbound,
    rooms: HashSet<ConversationId>,
}

#[derive(Default)]
struct Registry {
    users: HashMap<UserId, HashSet<ConnectionId>>,
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<ConversationId, HashSet<ConnectionId>>,
}

impl Registry {
    fn online_users(&self) -> Vec<UserId> {
        self.users.keys().copied().collect::<BTreeSet<_>>().into_iter().collect()
    }

    fn push(&self, id: &ConnectionId, event: ServerEvent) -> bool {
        let Some(conn) = self.connections.get(id) else {
            return false;
        };
        match conn.tx.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    connection = %id,
                    user = %conn.user,
                    event = e.into_inner().name(),
                    "Dropping event for unreachable connection"
                );
                false
            }
        }
    }

    fn push_all(&self, event: &ServerEvent) {
        for id in self.connections.keys() {
            self.push(id, event.clone());
        }
    }

    fn push_user(&self, user: &UserId, event: &ServerEvent) -> usize {
        self.users
            .get(user)
            .map(|ids| ids.iter().filter(|id| self.push(id, event.clone())).count())
            .unwrap_or(0)
    }
}

/// Result of removing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub user: UserId,
    /// The user's last connection closed.
    pub went_offline: bool,
}

#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<RwLock<Registry>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection handle for `user`.
    ///
    /// On the user's first handle every live connection receives the new
    /// `onlineUsers` list. Otherwise only the new connection gets a snapshot.
    /// Returns `true` if the user just came online.
    pub async fn connect(&self, user: UserId, id: ConnectionId, tx: Outbound) -> bool {
        let mut reg = self.inner.write().await;

        reg.connections.insert(
            id,
            Connection {
                user,
                tx,
                rooms: HashSet::new(),
            },
        );
        let handles = reg.users.entry(user).or_default();
        handles.insert(id);
        let first = handles.len() == 1;

        let snapshot = ServerEvent::OnlineUsers(reg.online_users());
        if first {
            info!(user = %user, connection = %id, "User came online");
            reg.push_all(&snapshot);
        } else {
            debug!(
                user = %user,
                connection = %id,
                connections = reg.users.get(&user).map(HashSet::len).unwrap_or(0),
                "Additional connection for online user"
            );
            reg.push(&id, snapshot);
        }

        first
    }

    /// Remove a connection handle and its room memberships.
    ///
    /// When the owner's last handle goes, every remaining connection receives
    /// the new `onlineUsers` list. Unknown handles return `None`, so a repeated
    /// disconnect never broadcasts twice.
    pub async fn disconnect(&self, id: ConnectionId) -> Option<Departure> {
        let mut reg = self.inner.write().await;

        let conn = reg.connections.remove(&id)?;
        for room in &conn.rooms {
            if let Some(members) = reg.rooms.get_mut(room) {
                members.remove(&id);
                if members.is_empty() {
                    reg.rooms.remove(room);
                }
            }
        }

        let went_offline = match reg.users.get_mut(&conn.user) {
            Some(handles) => {
                handles.remove(&id);
                handles.is_empty()
            }
            None => false,
        };

        if went_offline {
            reg.users.remove(&conn.user);
            info!(user = %conn.user, connection = %id, "User went offline");
            let snapshot = ServerEvent::OnlineUsers(reg.online_users());
            reg.push_all(&snapshot);
        } else {
            debug!(user = %conn.user, connection = %id, "Connection closed, user still online");
        }

        Some(Departure {
            user: conn.user,
            went_offline,
        })
    }

    pub async fn is_online(&self, user: UserId) -> bool {
        self.inner.read().await.users.contains_key(&user)
    }

    pub async fn connections_of(&self, user: UserId) -> Vec<ConnectionId> {
        self.inner
            .read()
            .await
            .users
            .get(&user)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        self.inner.read().await.online_users()
    }

    pub async fn user_of(&self, id: ConnectionId) -> Option<UserId> {
        self.inner.read().await.connections.get(&id).map(|c| c.user)
    }

    /// Push `event` to every connection of `user`. Returns how many
    /// connections accepted it; zero is the normal offline case.
    pub async fn send_to_user(&self, user: UserId, event: ServerEvent) -> usize {
        self.inner.read().await.push_user(&user, &event)
    }

    /// Push `event` to every connection of each listed user.
    pub async fn send_to_users<'a>(
        &self,
        users: impl IntoIterator<Item = &'a UserId>,
        event: ServerEvent,
    ) -> usize {
        let reg = self.inner.read().await;
        users.into_iter().map(|u| reg.push_user(u, &event)).sum()
    }

    // ------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------

    /// Attach a connection to a group's broadcast room. Returns `false` if
    /// the connection is unknown.
    pub async fn join_room(&self, id: ConnectionId, room: ConversationId) -> bool {
        let mut reg = self.inner.write().await;

        let Some(conn) = reg.connections.get_mut(&id) else {
            return false;
        };
        conn.rooms.insert(room);
        reg.rooms.entry(room).or_default().insert(id);

        debug!(connection = %id, room = %room, "Connection joined room");
        true
    }

    pub async fn in_room(&self, id: ConnectionId, room: ConversationId) -> bool {
        self.inner
            .read()
            .await
            .rooms
            .get(&room)
            .is_some_and(|members| members.contains(&id))
    }

    /// Detach every connection of `user` from `room` (the user left the group).
    pub async fn leave_room(&self, user: UserId, room: ConversationId) {
        let mut reg = self.inner.write().await;
        let Registry {
            users,
            connections,
            rooms,
        } = &mut *reg;

        let Some(handles) = users.get(&user) else {
            return;
        };
        for id in handles {
            if let Some(conn) = connections.get_mut(id) {
                conn.rooms.remove(&room);
            }
            if let Some(members) = rooms.get_mut(&room) {
                members.remove(id);
            }
        }
        if rooms.get(&room).is_some_and(HashSet::is_empty) {
            rooms.remove(&room);
        }
    }

    /// Drop a room entirely (the group was deleted).
    pub async fn close_room(&self, room: ConversationId) {
        let mut reg = self.inner.write().await;
        let Some(members) = reg.rooms.remove(&room) else {
            return;
        };
        for id in members {
            if let Some(conn) = reg.connections.get_mut(&id) {
                conn.rooms.remove(&room);
            }
        }
        info!(room = %room, "Closed room");
    }

    /// Push `event` to every connection in `room` except `except`.
    pub async fn broadcast_room(
        &self,
        room: ConversationId,
        event: ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        let reg = self.inner.read().await;
        let Some(members) = reg.rooms.get(&room) else {
            return 0;
        };
        members
            .iter()
            .filter(|id| Some(**id) != except)
            .filter(|id| reg.push(id, event.clone()))
            .count()
    }
}
