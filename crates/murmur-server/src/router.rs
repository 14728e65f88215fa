//! Event router: the single dispatch point for connection lifecycle and
//! inbound client events.
//!
//! Each inbound event is checked against the connection's identity,
//! routed to the presence registry or a state machine, and fanned out to
//! the affected live connections. Failures stop at [`EventRouter::dispatch`]
//! and are logged; they never take the connection or the process down.

use murmur_shared::protocol::{ClientEvent, ServerEvent};
use murmur_shared::types::{ConnectionId, UserId};
use tracing::{debug, error, warn};

use crate::delivery::DeliveryService;
use crate::error::ServerError;
use crate::presence::{Departure, Outbound, PresenceRegistry};
use crate::resolver::{self, GroupAccess};
use crate::SharedDb;

#[derive(Clone)]
pub struct EventRouter {
    db: SharedDb,
    presence: PresenceRegistry,
    delivery: DeliveryService,
}

impl EventRouter {
    pub fn new(db: SharedDb, presence: PresenceRegistry, delivery: DeliveryService) -> Self {
        Self {
            db,
            presence,
            delivery,
        }
    }

    /// Register a live connection and deliver what was queued for its user.
    pub async fn connect(&self, user: UserId, id: ConnectionId, tx: Outbound) {
        self.presence.connect(user, id, tx).await;

        if let Err(e) = self.delivery.sweep(user).await {
            error!(user = %user, error = %e, "Delivery sweep failed");
        }
    }

    pub async fn disconnect(&self, id: ConnectionId) -> Option<Departure> {
        self.presence.disconnect(id).await
    }

    /// Handle one inbound event from connection `id`.
    pub async fn dispatch(&self, id: ConnectionId, event: ClientEvent) {
        let name = event.name();
        match self.handle(id, event).await {
            Ok(()) => debug!(connection = %id, event = name, "Event handled"),
            Err(e) if e.is_rejection() => {
                warn!(connection = %id, event = name, error = %e, "Event rejected")
            }
            Err(e) => error!(connection = %id, event = name, error = %e, "Event failed"),
        }
    }

    /// Push a notification to every live connection of `user`. Offline
    /// users are skipped silently.
    pub async fn notify(&self, user: UserId, event: ServerEvent) -> usize {
        self.presence.send_to_user(user, event).await
    }

    async fn handle(&self, id: ConnectionId, event: ClientEvent) -> Result<(), ServerError> {
        let user = self
            .presence
            .user_of(id)
            .await
            .ok_or(ServerError::Unauthorized)?;

        match event {
            ClientEvent::JoinChat(room) => {
                resolver::resolve_group(&*self.db.lock().await, user, room, GroupAccess::Member)?;
                self.presence.join_room(id, room).await;
            }

            ClientEvent::Typing {
                sender_id,
                receiver_id,
                conversation_id,
                is_typing,
            } => {
                if sender_id != user {
                    return Err(ServerError::Forbidden(
                        "Cannot signal typing for another user".to_string(),
                    ));
                }

                if let Some(room) = conversation_id {
                    if !self.presence.in_room(id, room).await {
                        return Err(ServerError::Forbidden(
                            "Join the group before signalling typing".to_string(),
                        ));
                    }
                    let signal = ServerEvent::UserTyping {
                        sender_id: user,
                        is_typing,
                        conversation_id: Some(room),
                    };
                    self.presence.broadcast_room(room, signal, Some(id)).await;
                } else {
                    let peer = receiver_id.ok_or_else(|| {
                        ServerError::Validation(
                            "Either receiverId or conversationId is required".to_string(),
                        )
                    })?;
                    resolver::require_friend(
                        &*self.db.lock().await,
                        user,
                        peer,
                        "You can only signal your friends",
                    )?;
                    let signal = ServerEvent::UserTyping {
                        sender_id: user,
                        is_typing,
                        conversation_id: None,
                    };
                    self.presence.send_to_user(peer, signal).await;
                }
            }

            ClientEvent::MarkMessagesAsSeen { sender_id, seen_by } => {
                if seen_by != user {
                    return Err(ServerError::Forbidden(
                        "Cannot acknowledge messages for another user".to_string(),
                    ));
                }
                self.delivery.mark_seen(user, sender_id).await?;
            }
        }

        Ok(())
    }
}
