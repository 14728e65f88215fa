//! Identity and friendship directory.
//!
//! Users register with a handle and a display name; credential checks
//! happen upstream. Friendship is symmetric and needs mutual consent: a
//! pending request from one side, accepted by the other. Every friendship
//! change is pushed to the counterpart through the event router.

use chrono::Utc;
use murmur_shared::constants::MIN_USERNAME_LEN;
use murmur_shared::models::{FriendRequest, User};
use murmur_shared::protocol::{FriendRequestNotice, ServerEvent};
use murmur_shared::types::{FriendRequestStatus, UserId};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::error::ServerError;
use crate::router::EventRouter;
use crate::SharedDb;

/// Body of a registration request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub username: String,
    pub full_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Clone)]
pub struct Directory {
    db: SharedDb,
    router: EventRouter,
}

impl Directory {
    pub fn new(db: SharedDb, router: EventRouter) -> Self {
        Self { db, router }
    }

    pub async fn register(&self, registration: Registration) -> Result<User, ServerError> {
        let username = registration.username.trim().to_lowercase();
        let full_name = registration.full_name.trim().to_string();
        if username.is_empty() || full_name.is_empty() {
            return Err(ServerError::Validation("All fields are required".to_string()));
        }
        if username.chars().count() < MIN_USERNAME_LEN {
            return Err(ServerError::Validation(format!(
                "Username must be at least {MIN_USERNAME_LEN} characters"
            )));
        }

        let db = self.db.lock().await;
        if db.find_user_by_username(&username)?.is_some() {
            return Err(ServerError::Conflict("Username already taken".to_string()));
        }

        let user = User {
            id: UserId::new(),
            username,
            full_name,
            avatar: registration.avatar.filter(|a| !a.trim().is_empty()),
            created_at: Utc::now(),
        };
        db.insert_user(&user)?;

        info!(user = %user.id, username = %user.username, "User registered");
        Ok(user)
    }

    /// Load a user, mapping absence to a 404.
    pub async fn profile(&self, user: UserId) -> Result<User, ServerError> {
        self.db
            .lock()
            .await
            .find_user(user)?
            .ok_or_else(|| ServerError::NotFound("User not found".to_string()))
    }

    /// Everyone except `me`.
    pub async fn all_users(&self, me: UserId) -> Result<Vec<User>, ServerError> {
        Ok(self.db.lock().await.list_users_except(me)?)
    }

    pub async fn friends(&self, user: UserId) -> Result<Vec<User>, ServerError> {
        Ok(self.db.lock().await.friends_of(user)?)
    }

    pub async fn send_friend_request(
        &self,
        from: UserId,
        to: UserId,
    ) -> Result<FriendRequest, ServerError> {
        if from == to {
            return Err(ServerError::Validation(
                "You cannot send friend request to yourself".to_string(),
            ));
        }

        let db = self.db.lock().await;
        let sender = db.get_user(from)?;
        if !db.user_exists(to)? {
            return Err(ServerError::NotFound("User not found".to_string()));
        }
        if db.are_friends(from, to)? {
            return Err(ServerError::Conflict("You are already friends".to_string()));
        }
        if db.find_pending_request(from, to)?.is_some() {
            return Err(ServerError::Conflict("Friend request already sent".to_string()));
        }
        let request = db.insert_friend_request(from, to)?;
        drop(db);

        self.router
            .notify(
                to,
                ServerEvent::NewFriendRequest(FriendRequestNotice {
                    id: request.id,
                    from: sender,
                    status: request.status,
                }),
            )
            .await;

        info!(from = %from, to = %to, request = %request.id, "Friend request sent");
        Ok(request)
    }

    /// Accept a pending request addressed to `me`; the friendship becomes
    /// symmetric.
    pub async fn accept_friend_request(&self, me: UserId, request: Uuid) -> Result<(), ServerError> {
        let db = self.db.lock().await;
        let pending = pending_for(&db, me, request)?;
        let accepter = db.get_user(me)?;

        db.accept_friend_request(request)?;
        drop(db);

        self.router
            .notify(
                pending.from,
                ServerEvent::FriendRequestAccepted {
                    message: format!("{} accepted your friend request", accepter.full_name),
                    user: accepter,
                },
            )
            .await;

        info!(user = %me, friend = %pending.from, "Friend request accepted");
        Ok(())
    }

    pub async fn reject_friend_request(&self, me: UserId, request: Uuid) -> Result<(), ServerError> {
        let db = self.db.lock().await;
        let pending = pending_for(&db, me, request)?;
        let rejecter = db.get_user(me)?;

        db.resolve_friend_request(request, FriendRequestStatus::Rejected)?;
        drop(db);

        self.router
            .notify(
                pending.from,
                ServerEvent::FriendRequestRejected {
                    message: format!("{} rejected your friend request", rejecter.full_name),
                },
            )
            .await;
        Ok(())
    }

    /// Pending requests addressed to `me`, with the sender expanded.
    pub async fn pending_requests(&self, me: UserId) -> Result<Vec<FriendRequestNotice>, ServerError> {
        let db = self.db.lock().await;
        db.pending_requests_for(me)?
            .into_iter()
            .map(|request| -> Result<FriendRequestNotice, ServerError> {
                Ok(FriendRequestNotice {
                    id: request.id,
                    from: db.get_user(request.from)?,
                    status: request.status,
                })
            })
            .collect()
    }

    /// Drop the friendship in both directions, along with every request
    /// between the pair.
    pub async fn remove_friend(&self, me: UserId, friend: UserId) -> Result<(), ServerError> {
        let db = self.db.lock().await;
        let remover = db.get_user(me)?;
        if !db.user_exists(friend)? {
            return Err(ServerError::NotFound("User not found".to_string()));
        }
        db.remove_friendship(me, friend)?;
        drop(db);

        self.router
            .notify(
                friend,
                ServerEvent::FriendRemoved {
                    message: format!("{} removed you from friends", remover.full_name),
                    remover_id: me,
                },
            )
            .await;

        info!(user = %me, friend = %friend, "Friend removed");
        Ok(())
    }
}

fn pending_for(
    db: &murmur_store::Database,
    me: UserId,
    id: Uuid,
) -> Result<FriendRequest, ServerError> {
    match db.get_friend_request(id) {
        Ok(request) if request.to == me && request.status == FriendRequestStatus::Pending => {
            Ok(request)
        }
        Ok(_) | Err(murmur_store::StoreError::NotFound) => {
            Err(ServerError::NotFound("Friend request not found".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}
