//! Conversation resolver.
//!
//! Inbound actions name their target with a bare id that may be a user (a
//! direct peer) or a group conversation. The resolver decides which it is,
//! once, and checks that the actor may act on it. Everything downstream
//! works with the typed [`Resolved`] value instead of probing the store
//! again. Unknown and unauthorized ids both fail; nothing resolves to a
//! silent no-op.

use murmur_shared::models::Conversation;
use murmur_shared::types::{ConversationId, MembershipState, Target, UserId};
use murmur_store::Database;
use uuid::Uuid;

use crate::error::ServerError;

/// A target id after resolution and authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// A friend of the actor.
    Direct(UserId),
    /// A group the actor may act on, as loaded.
    Group(Conversation),
}

impl Resolved {
    pub fn target(&self) -> Target {
        match self {
            Resolved::Direct(user_id) => Target::Direct { user_id: *user_id },
            Resolved::Group(conversation) => Target::Group {
                conversation_id: conversation.id,
            },
        }
    }
}

/// Who may act on a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAccess {
    /// Active participants only (send, history, typing, join-room).
    Member,
    /// Participants and pending invitees (viewing the conversation).
    MemberOrInvitee,
}

impl GroupAccess {
    fn allows(self, state: MembershipState) -> bool {
        match self {
            GroupAccess::Member => state == MembershipState::Member,
            GroupAccess::MemberOrInvitee => state != MembershipState::None,
        }
    }
}

/// Resolve a raw id to a direct peer or a group and authorize `actor`.
///
/// Users are tried first: a user id resolves to `Direct` only when the
/// peer is a friend of the actor. Otherwise the id must name a group the
/// actor is an active participant of.
pub fn resolve_target(db: &Database, actor: UserId, raw: Uuid) -> Result<Resolved, ServerError> {
    let as_user = UserId::from(raw);
    if db.user_exists(as_user)? {
        if as_user == actor {
            return Err(ServerError::Forbidden(
                "You cannot message yourself".to_string(),
            ));
        }
        require_friend(db, actor, as_user, "You can only send messages to your friends")?;
        return Ok(Resolved::Direct(as_user));
    }

    match db.find_conversation(ConversationId::from(raw))? {
        Some(conversation) if conversation.is_group() => {
            authorize_group(&conversation, actor, GroupAccess::Member)?;
            Ok(Resolved::Group(conversation))
        }
        _ => Err(ServerError::NotFound("User or Group not found".to_string())),
    }
}

/// Load a group conversation and check `actor`'s access to it.
pub fn resolve_group(
    db: &Database,
    actor: UserId,
    id: ConversationId,
    access: GroupAccess,
) -> Result<Conversation, ServerError> {
    let conversation = db
        .find_conversation(id)?
        .filter(Conversation::is_group)
        .ok_or_else(|| ServerError::NotFound("Group not found".to_string()))?;

    authorize_group(&conversation, actor, access)?;
    Ok(conversation)
}

/// Fail with `Forbidden(reason)` unless `a` and `b` are friends.
pub fn require_friend(
    db: &Database,
    a: UserId,
    b: UserId,
    reason: &str,
) -> Result<(), ServerError> {
    if db.are_friends(a, b)? {
        Ok(())
    } else {
        Err(ServerError::Forbidden(reason.to_string()))
    }
}

fn authorize_group(
    conversation: &Conversation,
    actor: UserId,
    access: GroupAccess,
) -> Result<(), ServerError> {
    let state = conversation
        .group()
        .map(|g| g.state_of(actor))
        .unwrap_or(MembershipState::None);

    if access.allows(state) {
        Ok(())
    } else {
        Err(ServerError::Forbidden(
            "You are not a member of this group".to_string(),
        ))
    }
}
