//! Membership state machine for group conversations.
//!
//! A (user, group) pair is `none`, `pending` (invited) or `member`:
//!
//! ```text
//!   none --invite--> pending --accept--> member --leave--> none
//!                       |
//!                       +----reject----> none
//! ```
//!
//! The transitions are pure functions over [`Group`]; [`MembershipService`]
//! applies each one as a single read-modify-write under the store lock, then
//! narrates it with a system message and pushes the result to live
//! connections.

use std::sync::Arc;

use chrono::Utc;
use murmur_shared::models::{Conversation, ConversationKind, Group, Message};
use murmur_shared::protocol::ServerEvent;
use murmur_shared::types::{ConversationId, UserId};
use murmur_store::Database;
use serde::Deserialize;
use tracing::{debug, info};

use crate::delivery::DeliveryService;
use crate::error::ServerError;
use crate::presence::PresenceRegistry;
use crate::resolver::{self, GroupAccess};
use crate::SharedDb;

// ---------------------------------------------------------------------------
// Admin succession
// ---------------------------------------------------------------------------

/// Chooses the next admin when the current one leaves.
pub trait SuccessionPolicy: Send + Sync {
    /// `remaining` is the participant list after the departure, in join
    /// order, and is never empty. The result must be one of its entries.
    fn next_admin(&self, remaining: &[UserId], departed: UserId) -> Option<UserId>;
}

/// The earliest-joined remaining participant becomes admin.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstRemaining;

impl SuccessionPolicy for FirstRemaining {
    fn next_admin(&self, remaining: &[UserId], _departed: UserId) -> Option<UserId> {
        remaining.first().copied()
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The last participant left; the group must be deleted.
    Dissolved,
    /// The group lives on. `new_admin` is set when the admin left.
    Left { new_admin: Option<UserId> },
}

fn check_invariant(group: &Group) -> Result<(), ServerError> {
    if let Some(user) = group
        .participants
        .iter()
        .find(|u| group.pending_participants.contains(u))
    {
        return Err(ServerError::Conflict(format!(
            "User {user} is both a member and an invitee"
        )));
    }
    Ok(())
}

fn dedup(users: &[UserId]) -> Vec<UserId> {
    let mut unique = Vec::with_capacity(users.len());
    for user in users {
        if !unique.contains(user) {
            unique.push(*user);
        }
    }
    unique
}

/// Build a new group: `admin` is the sole participant and every invitee is
/// pending.
pub fn new_group(
    admin: UserId,
    name: &str,
    avatar: Option<String>,
    invitees: &[UserId],
    min_invitees: usize,
) -> Result<Group, ServerError> {
    let name = name.trim();
    let invitees = dedup(invitees);
    if name.is_empty() || invitees.len() < min_invitees {
        return Err(ServerError::Validation(format!(
            "Group must have a name and at least {min_invitees} other members"
        )));
    }
    if invitees.contains(&admin) {
        return Err(ServerError::Conflict("You cannot invite yourself".to_string()));
    }

    let group = Group {
        group_name: name.to_string(),
        group_avatar: avatar,
        group_admin: admin,
        participants: vec![admin],
        pending_participants: invitees,
    };
    check_invariant(&group)?;
    Ok(group)
}

/// Admin-only: add users who are neither members nor invitees to the
/// pending set. Returns the users actually invited.
pub fn invite(group: &mut Group, actor: UserId, users: &[UserId]) -> Result<Vec<UserId>, ServerError> {
    check_invariant(group)?;
    if group.group_admin != actor {
        return Err(ServerError::Forbidden(
            "Only the group admin can add members".to_string(),
        ));
    }
    if users.is_empty() {
        return Err(ServerError::Validation("No users to invite".to_string()));
    }
    if users.contains(&actor) {
        return Err(ServerError::Conflict("You cannot invite yourself".to_string()));
    }

    let fresh: Vec<UserId> = dedup(users)
        .into_iter()
        .filter(|u| !group.is_member(*u) && !group.is_pending(*u))
        .collect();
    if fresh.is_empty() {
        return Err(ServerError::Conflict(
            "Users are already members or invited".to_string(),
        ));
    }

    group.pending_participants.extend(fresh.iter().copied());
    Ok(fresh)
}

/// Move `user` from pending to the end of the participant list.
pub fn accept(group: &mut Group, user: UserId) -> Result<(), ServerError> {
    check_invariant(group)?;
    take_pending(group, user)?;
    group.participants.push(user);
    Ok(())
}

/// Drop `user`'s pending invite.
pub fn reject(group: &mut Group, user: UserId) -> Result<(), ServerError> {
    check_invariant(group)?;
    take_pending(group, user)
}

/// Remove `user` from the participants, handing the admin role on if
/// needed.
pub fn leave(
    group: &mut Group,
    user: UserId,
    policy: &dyn SuccessionPolicy,
) -> Result<LeaveOutcome, ServerError> {
    check_invariant(group)?;
    if !group.is_member(user) {
        return Err(ServerError::Forbidden(
            "You are not a member of this group".to_string(),
        ));
    }

    group.participants.retain(|p| *p != user);
    if group.participants.is_empty() {
        return Ok(LeaveOutcome::Dissolved);
    }

    if group.group_admin != user {
        return Ok(LeaveOutcome::Left { new_admin: None });
    }

    let next = policy
        .next_admin(&group.participants, user)
        .filter(|candidate| group.participants.contains(candidate))
        .ok_or_else(|| ServerError::Internal("Succession policy chose no member".to_string()))?;
    group.group_admin = next;
    Ok(LeaveOutcome::Left {
        new_admin: Some(next),
    })
}

fn take_pending(group: &mut Group, user: UserId) -> Result<(), ServerError> {
    let Some(pos) = group.pending_participants.iter().position(|p| *p == user) else {
        return Err(ServerError::Validation("No pending invite found".to_string()));
    };
    group.pending_participants.remove(pos);
    Ok(())
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Body of a group-creation request.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateGroup {
    pub name: String,
    #[serde(default)]
    pub participants: Vec<UserId>,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Clone)]
pub struct MembershipService {
    db: SharedDb,
    presence: PresenceRegistry,
    delivery: DeliveryService,
    policy: Arc<dyn SuccessionPolicy>,
    min_invitees: usize,
}

impl MembershipService {
    pub fn new(
        db: SharedDb,
        presence: PresenceRegistry,
        delivery: DeliveryService,
        policy: Arc<dyn SuccessionPolicy>,
        min_invitees: usize,
    ) -> Self {
        Self {
            db,
            presence,
            delivery,
            policy,
            min_invitees,
        }
    }

    pub async fn create_group(
        &self,
        admin: UserId,
        request: CreateGroup,
    ) -> Result<Conversation, ServerError> {
        let db = self.db.lock().await;
        let creator = db.get_user(admin)?;
        let group = new_group(
            admin,
            &request.name,
            request.avatar,
            &request.participants,
            self.min_invitees,
        )?;
        require_users(&db, &group.pending_participants)?;

        let now = Utc::now();
        let conversation = Conversation {
            id: ConversationId::new(),
            kind: ConversationKind::Group(group),
            created_at: now,
            updated_at: now,
        };
        db.insert_conversation(&conversation)?;

        let narration = Message::system(
            conversation.id,
            format!(
                "{} created the group \"{}\"",
                creator.full_name,
                request.name.trim()
            ),
        );
        db.insert_message(&narration)?;
        drop(db);

        let invitees = conversation
            .group()
            .map(|g| g.pending_participants.clone())
            .unwrap_or_default();
        self.presence
            .send_to_users(&invitees, ServerEvent::GroupInvite(conversation.clone()))
            .await;

        info!(
            group = %conversation.id,
            admin = %admin,
            invitees = invitees.len(),
            "Group created"
        );
        Ok(conversation)
    }

    /// Admin invites more users into an existing group.
    pub async fn add_members(
        &self,
        actor: UserId,
        id: ConversationId,
        users: &[UserId],
    ) -> Result<Conversation, ServerError> {
        let db = self.db.lock().await;
        let mut conversation = resolver::resolve_group(&db, actor, id, GroupAccess::Member)?;
        require_users(&db, users)?;
        let inviter = db.get_user(actor)?;

        let fresh = invite(group_of(&mut conversation)?, actor, users)?;
        conversation.updated_at = Utc::now();
        db.save_group(&conversation)?;

        let noun = if fresh.len() == 1 { "member" } else { "members" };
        let narration = Message::system(
            id,
            format!("{} invited {} new {noun}", inviter.full_name, fresh.len()),
        );
        db.insert_message(&narration)?;
        drop(db);

        self.presence
            .send_to_users(&fresh, ServerEvent::GroupInvite(conversation.clone()))
            .await;
        self.delivery.announce(&conversation, &narration, actor).await;

        debug!(group = %id, invited = fresh.len(), "Members invited");
        Ok(conversation)
    }

    pub async fn accept_invite(
        &self,
        user: UserId,
        id: ConversationId,
    ) -> Result<Conversation, ServerError> {
        let db = self.db.lock().await;
        let mut conversation = load_group(&db, id)?;
        let joiner = db.get_user(user)?;

        accept(group_of(&mut conversation)?, user)?;
        conversation.updated_at = Utc::now();
        db.save_group(&conversation)?;

        let narration = Message::system(id, format!("{} joined the group", joiner.full_name));
        db.insert_message(&narration)?;
        drop(db);

        self.delivery.announce(&conversation, &narration, user).await;

        debug!(group = %id, user = %user, "Invite accepted");
        Ok(conversation)
    }

    /// Rejections are private: nothing is narrated or broadcast.
    pub async fn reject_invite(&self, user: UserId, id: ConversationId) -> Result<(), ServerError> {
        let db = self.db.lock().await;
        let mut conversation = load_group(&db, id)?;

        reject(group_of(&mut conversation)?, user)?;
        conversation.updated_at = Utc::now();
        db.save_group(&conversation)?;

        debug!(group = %id, user = %user, "Invite rejected");
        Ok(())
    }

    pub async fn leave_group(
        &self,
        user: UserId,
        id: ConversationId,
    ) -> Result<LeaveOutcome, ServerError> {
        let db = self.db.lock().await;
        let mut conversation = load_group(&db, id)?;
        let leaver = db.get_user(user)?;

        let outcome = leave(group_of(&mut conversation)?, user, self.policy.as_ref())?;
        match outcome {
            LeaveOutcome::Dissolved => {
                db.delete_conversation(id)?;
                drop(db);

                self.presence.close_room(id).await;
                info!(group = %id, "Group deleted as last member left");
            }
            LeaveOutcome::Left { new_admin } => {
                conversation.updated_at = Utc::now();
                db.save_group(&conversation)?;

                let narration =
                    Message::system(id, format!("{} left the group", leaver.full_name));
                db.insert_message(&narration)?;
                drop(db);

                self.presence.leave_room(user, id).await;
                self.delivery.announce(&conversation, &narration, user).await;

                if let Some(admin) = new_admin {
                    info!(group = %id, admin = %admin, "Admin role handed over");
                }
            }
        }
        Ok(outcome)
    }

    /// Conversations `user` participates in or is invited to, most recently
    /// active first.
    pub async fn my_conversations(&self, user: UserId) -> Result<Vec<Conversation>, ServerError> {
        Ok(self.db.lock().await.conversations_for(user)?)
    }

    pub async fn get_conversation(
        &self,
        user: UserId,
        id: ConversationId,
    ) -> Result<Conversation, ServerError> {
        let conversation = self
            .db
            .lock()
            .await
            .find_conversation(id)?
            .ok_or_else(|| ServerError::NotFound("Conversation not found".to_string()))?;

        if !conversation.involves(user) {
            return Err(ServerError::Forbidden(
                "You are not a participant of this conversation".to_string(),
            ));
        }
        Ok(conversation)
    }
}

fn load_group(db: &Database, id: ConversationId) -> Result<Conversation, ServerError> {
    db.find_conversation(id)?
        .filter(Conversation::is_group)
        .ok_or_else(|| ServerError::NotFound("Group not found".to_string()))
}

fn group_of(conversation: &mut Conversation) -> Result<&mut Group, ServerError> {
    conversation
        .group_mut()
        .ok_or_else(|| ServerError::NotFound("Group not found".to_string()))
}

fn require_users(db: &Database, users: &[UserId]) -> Result<(), ServerError> {
    for user in users {
        if !db.user_exists(*user)? {
            return Err(ServerError::NotFound(format!("User {user} not found")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use murmur_shared::types::MessageStatus;

    use super::*;
    use crate::testing::{drain, drain_named, online, shared, user};

    fn ids(n: usize) -> Vec<UserId> {
        (0..n).map(|_| UserId::new()).collect()
    }

    // -- pure transitions ---------------------------------------------------

    #[test]
    fn test_new_group_seeds_admin_and_pending() {
        let admin = UserId::new();
        let invitees = ids(2);
        let group = new_group(admin, " Trip ", None, &invitees, 2).unwrap();

        assert_eq!(group.group_name, "Trip");
        assert_eq!(group.participants, vec![admin]);
        assert_eq!(group.pending_participants, invitees);
        assert_eq!(group.group_admin, admin);
    }

    #[test]
    fn test_new_group_validation() {
        let admin = UserId::new();
        let one = ids(1);
        assert!(matches!(
            new_group(admin, "Trip", None, &one, 2),
            Err(ServerError::Validation(_))
        ));
        // Duplicates do not count twice.
        assert!(matches!(
            new_group(admin, "Trip", None, &[one[0], one[0]], 2),
            Err(ServerError::Validation(_))
        ));
        assert!(matches!(
            new_group(admin, "  ", None, &ids(2), 2),
            Err(ServerError::Validation(_))
        ));
        assert!(matches!(
            new_group(admin, "Trip", None, &[admin, one[0]], 2),
            Err(ServerError::Conflict(_))
        ));
    }

    #[test]
    fn test_invite_guards() {
        let admin = UserId::new();
        let invitees = ids(2);
        let mut group = new_group(admin, "Trip", None, &invitees, 2).unwrap();
        accept(&mut group, invitees[0]).unwrap();

        assert!(matches!(
            invite(&mut group, invitees[0], &ids(1)),
            Err(ServerError::Forbidden(_))
        ));
        assert!(matches!(
            invite(&mut group, admin, &[admin]),
            Err(ServerError::Conflict(_))
        ));
        assert!(matches!(
            invite(&mut group, admin, &invitees),
            Err(ServerError::Conflict(_))
        ));

        let newcomer = UserId::new();
        let fresh = invite(&mut group, admin, &[invitees[1], newcomer, newcomer]).unwrap();
        assert_eq!(fresh, vec![newcomer]);
        assert_eq!(group.pending_participants, vec![invitees[1], newcomer]);
    }

    #[test]
    fn test_accept_and_reject_require_pending() {
        let admin = UserId::new();
        let invitees = ids(2);
        let mut group = new_group(admin, "Trip", None, &invitees, 2).unwrap();

        accept(&mut group, invitees[0]).unwrap();
        assert_eq!(group.participants, vec![admin, invitees[0]]);
        assert!(matches!(accept(&mut group, invitees[0]), Err(ServerError::Validation(_))));

        reject(&mut group, invitees[1]).unwrap();
        assert!(group.pending_participants.is_empty());
        assert!(matches!(reject(&mut group, invitees[1]), Err(ServerError::Validation(_))));
    }

    #[test]
    fn test_leave_hands_admin_to_first_remaining() {
        let admin = UserId::new();
        let invitees = ids(2);
        let mut group = new_group(admin, "Trip", None, &invitees, 2).unwrap();
        accept(&mut group, invitees[1]).unwrap();
        accept(&mut group, invitees[0]).unwrap();

        let outcome = leave(&mut group, admin, &FirstRemaining).unwrap();
        assert_eq!(outcome, LeaveOutcome::Left { new_admin: Some(invitees[1]) });
        assert_eq!(group.participants, vec![invitees[1], invitees[0]]);

        let outcome = leave(&mut group, invitees[0], &FirstRemaining).unwrap();
        assert_eq!(outcome, LeaveOutcome::Left { new_admin: None });
        assert_eq!(group.group_admin, invitees[1]);

        assert_eq!(
            leave(&mut group, invitees[1], &FirstRemaining).unwrap(),
            LeaveOutcome::Dissolved
        );
    }

    #[test]
    fn test_leave_requires_membership() {
        let admin = UserId::new();
        let invitees = ids(2);
        let mut group = new_group(admin, "Trip", None, &invitees, 2).unwrap();
        assert!(matches!(
            leave(&mut group, invitees[0], &FirstRemaining),
            Err(ServerError::Forbidden(_))
        ));
    }

    struct LastRemaining;

    impl SuccessionPolicy for LastRemaining {
        fn next_admin(&self, remaining: &[UserId], _departed: UserId) -> Option<UserId> {
            remaining.last().copied()
        }
    }

    #[test]
    fn test_succession_policy_is_pluggable() {
        let admin = UserId::new();
        let invitees = ids(2);
        let mut group = new_group(admin, "Trip", None, &invitees, 2).unwrap();
        accept(&mut group, invitees[0]).unwrap();
        accept(&mut group, invitees[1]).unwrap();

        leave(&mut group, admin, &LastRemaining).unwrap();
        assert_eq!(group.group_admin, invitees[1]);
    }

    #[test]
    fn test_overlap_is_rejected_before_transition() {
        let admin = UserId::new();
        let other = UserId::new();
        let mut group = Group {
            group_name: "Broken".to_string(),
            group_avatar: None,
            group_admin: admin,
            participants: vec![admin, other],
            pending_participants: vec![other],
        };
        assert!(matches!(reject(&mut group, other), Err(ServerError::Conflict(_))));
    }

    // -- service -------------------------------------------------------------

    fn service(db: Database) -> (MembershipService, SharedDb, PresenceRegistry) {
        let db = shared(db);
        let presence = PresenceRegistry::new();
        let delivery = DeliveryService::new(db.clone(), presence.clone(), 4096);
        let membership = MembershipService::new(
            db.clone(),
            presence.clone(),
            delivery,
            Arc::new(FirstRemaining),
            2,
        );
        (membership, db, presence)
    }

    fn create(name: &str, participants: Vec<UserId>) -> CreateGroup {
        CreateGroup {
            name: name.to_string(),
            participants,
            avatar: None,
        }
    }

    #[tokio::test]
    async fn test_create_group_narrates_and_invites() {
        let db = Database::open_in_memory().unwrap();
        let admin = user(&db, "admin");
        let bob = user(&db, "bob");
        let carol = user(&db, "carol");
        let (membership, db, presence) = service(db);
        let (_, mut bob_rx) = online(&presence, bob.id).await;

        let trip = membership
            .create_group(admin.id, create("Trip", vec![bob.id, carol.id]))
            .await
            .unwrap();

        assert_eq!(drain(&mut bob_rx), vec![ServerEvent::GroupInvite(trip.clone())]);
        let messages = db.lock().await.messages_for_conversation(trip.id).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_system_message);
        assert!(messages[0].sender_id.is_none());
        assert_eq!(messages[0].message, "Admin created the group \"Trip\"");
    }

    #[tokio::test]
    async fn test_create_group_with_unknown_invitee() {
        let db = Database::open_in_memory().unwrap();
        let admin = user(&db, "admin");
        let bob = user(&db, "bob");
        let (membership, db, _presence) = service(db);

        let err = membership
            .create_group(admin.id, create("Trip", vec![bob.id, UserId::new()]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
        assert!(db.lock().await.conversations_for(admin.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_members_pushes_invite_and_narration() {
        let db = Database::open_in_memory().unwrap();
        let admin = user(&db, "admin");
        let bob = user(&db, "bob");
        let carol = user(&db, "carol");
        let dave = user(&db, "dave");
        let (membership, _db, presence) = service(db);

        let trip = membership
            .create_group(admin.id, create("Trip", vec![bob.id, carol.id]))
            .await
            .unwrap();
        membership.accept_invite(bob.id, trip.id).await.unwrap();

        let (_, mut bob_rx) = online(&presence, bob.id).await;
        let (_, mut dave_rx) = online(&presence, dave.id).await;

        let updated = membership.add_members(admin.id, trip.id, &[dave.id]).await.unwrap();
        assert!(updated.group().unwrap().is_pending(dave.id));
        assert_eq!(drain_named(&mut dave_rx, "groupInvite").len(), 1);

        let narrations = drain_named(&mut bob_rx, "newMessage");
        assert!(matches!(
            &narrations[..],
            [ServerEvent::NewMessage(m)] if m.message == "Admin invited 1 new member"
        ));

        assert!(matches!(
            membership.add_members(bob.id, trip.id, &[dave.id]).await,
            Err(ServerError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_leave_last_member_deletes_group() {
        let db = Database::open_in_memory().unwrap();
        let admin = user(&db, "admin");
        let bob = user(&db, "bob");
        let carol = user(&db, "carol");
        let (membership, db, _presence) = service(db);

        let trip = membership
            .create_group(admin.id, create("Trip", vec![bob.id, carol.id]))
            .await
            .unwrap();
        let outcome = membership.leave_group(admin.id, trip.id).await.unwrap();
        assert_eq!(outcome, LeaveOutcome::Dissolved);
        assert!(db.lock().await.find_conversation(trip.id).unwrap().is_none());

        // The narration survives the group.
        assert_eq!(db.lock().await.messages_for_conversation(trip.id).unwrap().len(), 1);
        assert!(matches!(
            membership.accept_invite(bob.id, trip.id).await,
            Err(ServerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_group_message_fans_out_to_live_members_only() {
        let db = Database::open_in_memory().unwrap();
        let admin = user(&db, "admin");
        let bob = user(&db, "bob");
        let carol = user(&db, "carol");
        let (membership, db, presence) = service(db);
        let delivery = DeliveryService::new(db.clone(), presence.clone(), 4096);

        let trip = membership
            .create_group(admin.id, create("Trip", vec![bob.id, carol.id]))
            .await
            .unwrap();
        membership.accept_invite(bob.id, trip.id).await.unwrap();

        let (_, mut admin_rx) = online(&presence, admin.id).await;
        let (_, mut bob_rx) = online(&presence, bob.id).await;
        let (_, mut carol_rx) = online(&presence, carol.id).await;

        let message = delivery.send(admin.id, *trip.id.as_uuid(), "hello").await.unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(drain(&mut bob_rx), vec![ServerEvent::NewMessage(message)]);
        assert!(drain(&mut admin_rx).is_empty());
        // Carol is only invited.
        assert!(drain(&mut carol_rx).is_empty());
    }

    #[tokio::test]
    async fn test_get_conversation_for_invitee_and_outsider() {
        let db = Database::open_in_memory().unwrap();
        let admin = user(&db, "admin");
        let bob = user(&db, "bob");
        let carol = user(&db, "carol");
        let eve = user(&db, "eve");
        let (membership, _db, _presence) = service(db);

        let trip = membership
            .create_group(admin.id, create("Trip", vec![bob.id, carol.id]))
            .await
            .unwrap();

        assert_eq!(membership.get_conversation(bob.id, trip.id).await.unwrap().id, trip.id);
        assert_eq!(membership.my_conversations(carol.id).await.unwrap().len(), 1);
        assert!(matches!(
            membership.get_conversation(eve.id, trip.id).await,
            Err(ServerError::Forbidden(_))
        ));
    }
}
