//! CRUD operations for [`User`] records.

use murmur_shared::types::UserId;
use rusqlite::{params, OptionalExtension};

use crate::database::{parse_id, parse_ts, Database};
use crate::error::Result;
use crate::models::User;

const USER_COLUMNS: &str = "id, username, full_name, avatar, created_at";

impl Database {
    /// Insert a new user. Fails with `Duplicate` if the username is taken.
    pub fn insert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, username, full_name, avatar, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id.to_string(),
                user.username,
                user.full_name,
                user.avatar,
                user.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: UserId) -> Result<User> {
        let user = self.conn().query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![id.to_string()],
            row_to_user,
        )?;
        Ok(user)
    }

    /// Like [`Database::get_user`] but `None` when the id is unknown.
    pub fn find_user(&self, id: UserId) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.to_string()],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                params![username],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn user_exists(&self, id: UserId) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// All users except `me`, ordered by full name.
    pub fn list_users_except(&self, me: UserId) -> Result<Vec<User>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id != ?1 ORDER BY full_name ASC"
        ))?;
        let rows = stmt.query_map(params![me.to_string()], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }
}

pub(crate) fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let created: String = row.get(4)?;

    Ok(User {
        id: parse_id(0, &id)?,
        username: row.get(1)?,
        full_name: row.get(2)?,
        avatar: row.get(3)?,
        created_at: parse_ts(4, &created)?,
    })
}
