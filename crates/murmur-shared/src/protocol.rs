use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::models::{Conversation, Message, User};
use crate::types::{ConversationId, FriendRequestStatus, MessageId, UserId};

/// Events a client sends over its persistent connection.
///
/// Framed as `{"event": "<name>", "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Join the broadcast room of a group conversation.
    #[serde(rename = "join-chat")]
    JoinChat(ConversationId),

    /// Typing indicator for a direct peer or a group room.
    Typing {
        sender_id: UserId,
        #[serde(default)]
        receiver_id: Option<UserId>,
        #[serde(default)]
        conversation_id: Option<ConversationId>,
        is_typing: bool,
    },

    /// `seen_by` has viewed everything `sender_id` sent them.
    MarkMessagesAsSeen { sender_id: UserId, seen_by: UserId },
}

/// Events pushed by the server to live connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Every user with at least one live connection.
    OnlineUsers(Vec<UserId>),

    UserTyping {
        sender_id: UserId,
        is_typing: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
    },

    /// Aggregate notice: `receiver_id` has seen the recipient's messages.
    MessagesSeen { receiver_id: UserId },

    NewMessage(Message),

    MessageDelivered {
        message_id: MessageId,
        receiver_id: UserId,
    },

    NewFriendRequest(FriendRequestNotice),

    FriendRequestAccepted { message: String, user: User },

    FriendRequestRejected { message: String },

    FriendRemoved { message: String, remover_id: UserId },

    /// The recipient was invited to a group.
    GroupInvite(Conversation),
}

/// Payload of [`ServerEvent::NewFriendRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestNotice {
    #[serde(rename = "_id")]
    pub id: uuid::Uuid,
    pub from: User,
    pub status: FriendRequestStatus,
}

impl ServerEvent {
    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::OnlineUsers(_) => "onlineUsers",
            ServerEvent::UserTyping { .. } => "userTyping",
            ServerEvent::MessagesSeen { .. } => "messagesSeen",
            ServerEvent::NewMessage(_) => "newMessage",
            ServerEvent::MessageDelivered { .. } => "messageDelivered",
            ServerEvent::NewFriendRequest(_) => "newFriendRequest",
            ServerEvent::FriendRequestAccepted { .. } => "friendRequestAccepted",
            ServerEvent::FriendRequestRejected { .. } => "friendRequestRejected",
            ServerEvent::FriendRemoved { .. } => "friendRemoved",
            ServerEvent::GroupInvite(_) => "groupInvite",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinChat(_) => "join-chat",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::MarkMessagesAsSeen { .. } => "markMessagesAsSeen",
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_typing_to_peer() {
        let sender = UserId::new();
        let receiver = UserId::new();
        let text = format!(
            r#"{{"event":"typing","data":{{"senderId":"{sender}","receiverId":"{receiver}","isTyping":true}}}}"#
        );

        let event = ClientEvent::from_json(&text).unwrap();
        assert_eq!(
            event,
            ClientEvent::Typing {
                sender_id: sender,
                receiver_id: Some(receiver),
                conversation_id: None,
                is_typing: true,
            }
        );
    }

    #[test]
    fn test_decode_join_chat() {
        let room = ConversationId::new();
        let text = format!(r#"{{"event":"join-chat","data":"{room}"}}"#);
        assert_eq!(ClientEvent::from_json(&text).unwrap(), ClientEvent::JoinChat(room));
    }

    #[test]
    fn test_decode_rejects_unknown_event() {
        assert!(ClientEvent::from_json(r#"{"event":"explode","data":{}}"#).is_err());
        assert!(ClientEvent::from_json("not json").is_err());
    }

    #[test]
    fn test_encode_message_delivered() {
        let message_id = MessageId::new();
        let receiver_id = UserId::new();
        let json: serde_json::Value = serde_json::from_str(
            &ServerEvent::MessageDelivered { message_id, receiver_id }
                .to_json()
                .unwrap(),
        )
        .unwrap();

        assert_eq!(json["event"], "messageDelivered");
        assert_eq!(json["data"]["messageId"], message_id.to_string());
        assert_eq!(json["data"]["receiverId"], receiver_id.to_string());
    }

    #[test]
    fn test_direct_typing_omits_conversation() {
        let event = ServerEvent::UserTyping {
            sender_id: UserId::new(),
            is_typing: false,
            conversation_id: None,
        };
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert!(json["data"].get("conversationId").is_none());
        assert_eq!(event.name(), json["event"]);
    }
}
