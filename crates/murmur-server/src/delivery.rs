//! Delivery state machine.
//!
//! Each direct message moves `sent -> delivered -> seen` and never back:
//!
//! - creation: `delivered` if the peer has a live connection, else `sent`
//! - sweep (the peer connects): every `sent` message addressed to them
//!   becomes `delivered`, one `messageDelivered` notice per message
//! - seen acknowledgment: everything from the peer to the acker becomes
//!   `seen` in one batch, with a single aggregate `messagesSeen` notice
//!
//! Group messages carry one shared status that stays `sent`. Their fan-out
//! reaches live participants only; offline members pick them up from
//! history. A missing connection is never an error here.

use murmur_shared::models::{Conversation, Message};
use murmur_shared::protocol::ServerEvent;
use murmur_shared::types::{ConversationId, MessageStatus, UserId};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ServerError;
use crate::presence::PresenceRegistry;
use crate::resolver::{self, GroupAccess, Resolved};
use crate::SharedDb;

/// A conversation's messages as seen by one participant.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct History {
    /// `None` when two friends have not exchanged a message yet.
    pub conversation: Option<Conversation>,
    pub messages: Vec<Message>,
}

#[derive(Clone)]
pub struct DeliveryService {
    db: SharedDb,
    presence: PresenceRegistry,
    max_message_len: usize,
}

impl DeliveryService {
    pub fn new(db: SharedDb, presence: PresenceRegistry, max_message_len: usize) -> Self {
        Self {
            db,
            presence,
            max_message_len,
        }
    }

    /// Create a message from `sender` to `raw_target` (a friend's user id
    /// or a group id) and push it to the live recipients.
    pub async fn send(
        &self,
        sender: UserId,
        raw_target: Uuid,
        text: &str,
    ) -> Result<Message, ServerError> {
        if text.trim().is_empty() {
            return Err(ServerError::Validation("All fields are required".to_string()));
        }
        if text.chars().count() > self.max_message_len {
            return Err(ServerError::Validation(format!(
                "Message exceeds {} characters",
                self.max_message_len
            )));
        }

        let db = self.db.lock().await;
        let resolved = resolver::resolve_target(&db, sender, raw_target)?;
        let target = resolved.target();

        match resolved {
            Resolved::Direct(peer) => {
                let (conversation, created) = db.get_or_create_direct(sender, peer)?;
                if created {
                    debug!(conversation = %conversation.id, "Opened direct conversation");
                }

                let status = if self.presence.is_online(peer).await {
                    MessageStatus::Delivered
                } else {
                    MessageStatus::Sent
                };
                let message = Message::new(sender, target, conversation.id, text, status);
                db.insert_message(&message)?;
                db.touch_conversation(conversation.id, message.created_at)?;
                drop(db);

                let reached = self
                    .presence
                    .send_to_user(peer, ServerEvent::NewMessage(message.clone()))
                    .await;
                debug!(
                    message = %message.id,
                    from = %sender,
                    to = %peer,
                    status = %message.status,
                    reached,
                    "Direct message sent"
                );
                Ok(message)
            }
            Resolved::Group(conversation) => {
                let message =
                    Message::new(sender, target, conversation.id, text, MessageStatus::Sent);
                db.insert_message(&message)?;
                db.touch_conversation(conversation.id, message.created_at)?;
                drop(db);

                let recipients = conversation.participants().iter().filter(|p| **p != sender);
                let reached = self
                    .presence
                    .send_to_users(recipients, ServerEvent::NewMessage(message.clone()))
                    .await;
                debug!(
                    message = %message.id,
                    from = %sender,
                    group = %conversation.id,
                    reached,
                    "Group message sent"
                );
                Ok(message)
            }
        }
    }

    /// Push a system narration to the live members of a group, skipping
    /// the user whose action produced it.
    pub async fn announce(&self, conversation: &Conversation, message: &Message, actor: UserId) {
        let recipients = conversation.participants().iter().filter(|p| **p != actor);
        self.presence
            .send_to_users(recipients, ServerEvent::NewMessage(message.clone()))
            .await;
    }

    /// Deliver everything still `sent` to `user` and tell each sender.
    pub async fn sweep(&self, user: UserId) -> Result<usize, ServerError> {
        let delivered = self.db.lock().await.mark_delivered_for(user)?;

        for message in &delivered {
            if let Some(sender) = message.sender_id {
                self.presence
                    .send_to_user(
                        sender,
                        ServerEvent::MessageDelivered {
                            message_id: message.id,
                            receiver_id: user,
                        },
                    )
                    .await;
            }
        }

        if !delivered.is_empty() {
            info!(user = %user, count = delivered.len(), "Swept queued messages to delivered");
        }
        Ok(delivered.len())
    }

    /// `acker` has viewed their conversation with `peer`: mark everything
    /// `peer` sent them as seen and notify `peer` once.
    pub async fn mark_seen(&self, acker: UserId, peer: UserId) -> Result<usize, ServerError> {
        let db = self.db.lock().await;
        if db.find_direct(acker, peer)?.is_none() {
            return Err(ServerError::NotFound("Conversation not found".to_string()));
        }
        let count = db.mark_seen(peer, acker)?;
        drop(db);

        self.presence
            .send_to_user(peer, ServerEvent::MessagesSeen { receiver_id: acker })
            .await;
        debug!(acker = %acker, peer = %peer, count, "Marked messages as seen");
        Ok(count)
    }

    /// Senders with direct messages to `user` that are not yet seen.
    pub async fn unread_senders(&self, user: UserId) -> Result<Vec<UserId>, ServerError> {
        Ok(self.db.lock().await.unread_senders(user)?)
    }

    /// Messages exchanged with a friend, or posted in a group `actor` is a
    /// member of.
    pub async fn history(&self, actor: UserId, raw_other: Uuid) -> Result<History, ServerError> {
        let db = self.db.lock().await;

        let group_id = ConversationId::from(raw_other);
        if db.find_conversation(group_id)?.is_some_and(|c| c.is_group()) {
            let conversation = resolver::resolve_group(&db, actor, group_id, GroupAccess::Member)?;
            let messages = db.messages_for_conversation(conversation.id)?;
            return Ok(History {
                conversation: Some(conversation),
                messages,
            });
        }

        let peer = UserId::from(raw_other);
        if !db.user_exists(peer)? {
            return Err(ServerError::NotFound("User or Group not found".to_string()));
        }
        resolver::require_friend(&db, actor, peer, "You can only view messages from your friends")?;

        match db.find_direct(actor, peer)? {
            Some(conversation) => {
                let messages = db.messages_for_conversation(conversation.id)?;
                Ok(History {
                    conversation: Some(conversation),
                    messages,
                })
            }
            None => Ok(History {
                conversation: None,
                messages: Vec::new(),
            }),
        }
    }
}
