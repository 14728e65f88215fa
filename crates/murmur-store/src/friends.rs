//! Friendship edges and friend requests.
//!
//! Friendships are symmetric: every helper writes or removes both
//! directions in one transaction.

use chrono::Utc;
use murmur_shared::types::{FriendRequestStatus, UserId};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::database::{parse_id, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{FriendRequest, User};
use crate::users::row_to_user;

impl Database {
    // ------------------------------------------------------------------
    // Friendships
    // ------------------------------------------------------------------

    pub fn are_friends(&self, a: UserId, b: UserId) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM friendships WHERE user_id = ?1 AND friend_id = ?2)",
            params![a.to_string(), b.to_string()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Remove both friendship edges and every request between the pair.
    /// Returns `true` if the pair were friends.
    pub fn remove_friendship(&self, a: UserId, b: UserId) -> Result<bool> {
        let (a, b) = (a.to_string(), b.to_string());
        let tx = self.conn().unchecked_transaction()?;
        let removed = tx.execute(
            "DELETE FROM friendships
             WHERE (user_id = ?1 AND friend_id = ?2) OR (user_id = ?2 AND friend_id = ?1)",
            params![a, b],
        )?;
        tx.execute(
            "DELETE FROM friend_requests
             WHERE (from_id = ?1 AND to_id = ?2) OR (from_id = ?2 AND to_id = ?1)",
            params![a, b],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    pub fn friends_of(&self, user: UserId) -> Result<Vec<User>> {
        let mut stmt = self.conn().prepare(
            "SELECT u.id, u.username, u.full_name, u.avatar, u.created_at
             FROM friendships f JOIN users u ON u.id = f.friend_id
             WHERE f.user_id = ?1
             ORDER BY u.full_name ASC",
        )?;
        let rows = stmt.query_map(params![user.to_string()], row_to_user)?;

        let mut friends = Vec::new();
        for row in rows {
            friends.push(row?);
        }
        Ok(friends)
    }

    // ------------------------------------------------------------------
    // Friend requests
    // ------------------------------------------------------------------

    /// Create a pending request from `from` to `to`.
    pub fn insert_friend_request(&self, from: UserId, to: UserId) -> Result<FriendRequest> {
        let request = FriendRequest {
            id: Uuid::new_v4(),
            from,
            to,
            status: FriendRequestStatus::Pending,
            created_at: Utc::now(),
        };

        self.conn().execute(
            "INSERT INTO friend_requests (id, from_id, to_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                request.id.to_string(),
                request.from.to_string(),
                request.to.to_string(),
                request.status.as_str(),
                request.created_at.to_rfc3339(),
            ],
        )?;
        Ok(request)
    }

    pub fn get_friend_request(&self, id: Uuid) -> Result<FriendRequest> {
        let request = self.conn().query_row(
            "SELECT id, from_id, to_id, status, created_at FROM friend_requests WHERE id = ?1",
            params![id.to_string()],
            row_to_request,
        )?;
        Ok(request)
    }

    /// The pending request from `from` to `to`, if any.
    pub fn find_pending_request(&self, from: UserId, to: UserId) -> Result<Option<FriendRequest>> {
        let request = self
            .conn()
            .query_row(
                "SELECT id, from_id, to_id, status, created_at FROM friend_requests
                 WHERE from_id = ?1 AND to_id = ?2 AND status = 'pending'",
                params![from.to_string(), to.to_string()],
                row_to_request,
            )
            .optional()?;
        Ok(request)
    }

    /// Resolve a pending request. Resolved requests are immutable, so this
    /// fails with `NotFound` unless the request is still pending.
    pub fn resolve_friend_request(&self, id: Uuid, status: FriendRequestStatus) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE friend_requests SET status = ?2 WHERE id = ?1 AND status = 'pending'",
            params![id.to_string(), status.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Accept a pending request and record the friendship in the same
    /// transaction. Fails with `NotFound` unless the request is pending;
    /// on any failure the request stays pending.
    pub fn accept_friend_request(&self, id: Uuid) -> Result<FriendRequest> {
        let tx = self.conn().unchecked_transaction()?;
        let affected = tx.execute(
            "UPDATE friend_requests SET status = ?2 WHERE id = ?1 AND status = 'pending'",
            params![id.to_string(), FriendRequestStatus::Accepted.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        let request = tx.query_row(
            "SELECT id, from_id, to_id, status, created_at FROM friend_requests WHERE id = ?1",
            params![id.to_string()],
            row_to_request,
        )?;
        insert_edges(&tx, request.from, request.to)?;
        tx.commit()?;
        Ok(request)
    }

    /// Pending requests addressed to `user`, oldest first.
    pub fn pending_requests_for(&self, user: UserId) -> Result<Vec<FriendRequest>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, from_id, to_id, status, created_at FROM friend_requests
             WHERE to_id = ?1 AND status = 'pending'
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![user.to_string()], row_to_request)?;

        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }
        Ok(requests)
    }
}

fn insert_edges(tx: &rusqlite::Transaction<'_>, a: UserId, b: UserId) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    for (from, to) in [(a, b), (b, a)] {
        tx.execute(
            "INSERT OR IGNORE INTO friendships (user_id, friend_id, created_at) VALUES (?1, ?2, ?3)",
            params![from.to_string(), to.to_string(), now],
        )?;
    }
    Ok(())
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<FriendRequest> {
    let id: String = row.get(0)?;
    let from: String = row.get(1)?;
    let to: String = row.get(2)?;
    let status: String = row.get(3)?;
    let created: String = row.get(4)?;

    let status = FriendRequestStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown friend request status '{status}'").into(),
        )
    })?;

    Ok(FriendRequest {
        id: parse_id::<Uuid>(0, &id)?,
        from: parse_id(1, &from)?,
        to: parse_id(2, &to)?,
        status,
        created_at: parse_ts(4, &created)?,
    })
}
