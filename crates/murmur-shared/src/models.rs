//! Domain records shared by the store and the server.
//!
//! Every struct serializes with camelCase field names so it can be pushed
//! to clients as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ConversationId, FriendRequestStatus, MembershipState, MessageId, MessageStatus, Target,
    UserId,
};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A registered user's public profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub username: String,
    pub full_name: String,
    /// Reference to an avatar image; generation is handled elsewhere.
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Friend request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequest {
    #[serde(rename = "_id")]
    pub id: uuid::Uuid,
    pub from: UserId,
    pub to: UserId,
    pub status: FriendRequestStatus,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A direct or group conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(rename = "_id")]
    pub id: ConversationId,
    #[serde(flatten)]
    pub kind: ConversationKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ConversationKind {
    /// Exactly two participants; at most one per unordered pair.
    Direct { participants: [UserId; 2] },
    Group(Group),
}

/// Admin-governed group state.
///
/// A user id appears in at most one of `participants` and
/// `pending_participants`; `admin` is in `participants` whenever it is
/// non-empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub group_name: String,
    pub group_avatar: Option<String>,
    pub group_admin: UserId,
    /// Active members in join order.
    pub participants: Vec<UserId>,
    pub pending_participants: Vec<UserId>,
}

impl Group {
    pub fn state_of(&self, user: UserId) -> MembershipState {
        if self.participants.contains(&user) {
            MembershipState::Member
        } else if self.pending_participants.contains(&user) {
            MembershipState::Pending
        } else {
            MembershipState::None
        }
    }

    pub fn is_member(&self, user: UserId) -> bool {
        self.participants.contains(&user)
    }

    pub fn is_pending(&self, user: UserId) -> bool {
        self.pending_participants.contains(&user)
    }
}

impl Conversation {
    pub fn is_group(&self) -> bool {
        matches!(self.kind, ConversationKind::Group(_))
    }

    pub fn group(&self) -> Option<&Group> {
        match &self.kind {
            ConversationKind::Group(group) => Some(group),
            ConversationKind::Direct { .. } => None,
        }
    }

    pub fn group_mut(&mut self) -> Option<&mut Group> {
        match &mut self.kind {
            ConversationKind::Group(group) => Some(group),
            ConversationKind::Direct { .. } => None,
        }
    }

    /// Active participants (both users of a direct conversation).
    pub fn participants(&self) -> &[UserId] {
        match &self.kind {
            ConversationKind::Direct { participants } => participants,
            ConversationKind::Group(group) => &group.participants,
        }
    }

    /// Whether `user` is an active participant or an invitee.
    pub fn involves(&self, user: UserId) -> bool {
        match &self.kind {
            ConversationKind::Direct { participants } => participants.contains(&user),
            ConversationKind::Group(group) => group.state_of(user) != MembershipState::None,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A chat message or a system narration of a membership change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: MessageId,
    /// Absent only for system messages.
    pub sender_id: Option<UserId>,
    pub target: Target,
    pub conversation_id: ConversationId,
    pub message: String,
    pub status: MessageStatus,
    pub is_system_message: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a user-authored message with a fresh id.
    pub fn new(
        sender_id: UserId,
        target: Target,
        conversation_id: ConversationId,
        message: impl Into<String>,
        status: MessageStatus,
    ) -> Self {
        Self {
            id: MessageId::new(),
            sender_id: Some(sender_id),
            target,
            conversation_id,
            message: message.into(),
            status,
            is_system_message: false,
            created_at: Utc::now(),
        }
    }

    /// Build a system message narrating a change in a group.
    pub fn system(conversation_id: ConversationId, message: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            sender_id: None,
            target: Target::Group { conversation_id },
            conversation_id,
            message: message.into(),
            status: MessageStatus::Sent,
            is_system_message: true,
            created_at: Utc::now(),
        }
    }
}
