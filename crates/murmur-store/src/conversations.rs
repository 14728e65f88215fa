//! CRUD operations for [`Conversation`] records and their member rows.

use chrono::{DateTime, Utc};
use murmur_shared::types::{ConversationId, UserId};
use rusqlite::{params, OptionalExtension};

use crate::database::{parse_id, parse_opt_id, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{Conversation, ConversationKind, Group};

/// Unordered-pair key enforcing one direct conversation per pair.
pub fn direct_key(a: UserId, b: UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

/// Raw `conversations` row before members are attached.
struct ConversationRow {
    id: ConversationId,
    is_group: bool,
    group_name: Option<String>,
    group_avatar: Option<String>,
    group_admin: Option<UserId>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

const CONVERSATION_COLUMNS: &str =
    "id, is_group, group_name, group_avatar, group_admin, created_at, updated_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a conversation with its member rows.
    ///
    /// A second direct conversation for the same pair fails with
    /// `Duplicate`.
    pub fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;

        let (is_group, key, name, avatar, admin) = match &conversation.kind {
            ConversationKind::Direct { participants: [a, b] } => {
                (false, Some(direct_key(*a, *b)), None, None, None)
            }
            ConversationKind::Group(group) => (
                true,
                None,
                Some(group.group_name.clone()),
                group.group_avatar.clone(),
                Some(group.group_admin.to_string()),
            ),
        };

        tx.execute(
            "INSERT INTO conversations
                (id, is_group, direct_key, group_name, group_avatar, group_admin, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                conversation.id.to_string(),
                is_group,
                key,
                name,
                avatar,
                admin,
                conversation.created_at.to_rfc3339(),
                conversation.updated_at.to_rfc3339(),
            ],
        )?;
        write_members(&tx, conversation)?;

        tx.commit()?;
        Ok(())
    }

    /// Find the direct conversation between `a` and `b`, creating it when
    /// missing. The flag reports whether it was created.
    pub fn get_or_create_direct(&self, a: UserId, b: UserId) -> Result<(Conversation, bool)> {
        if let Some(existing) = self.find_direct(a, b)? {
            return Ok((existing, false));
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: ConversationId::new(),
            kind: ConversationKind::Direct { participants: [a, b] },
            created_at: now,
            updated_at: now,
        };
        self.insert_conversation(&conversation)?;
        tracing::debug!(conversation = %conversation.id, "created direct conversation");
        Ok((conversation, true))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.find_conversation(id)?.ok_or(StoreError::NotFound)
    }

    pub fn find_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
                row_to_conversation,
            )
            .optional()?;

        row.map(|row| self.attach_members(row)).transpose()
    }

    pub fn find_direct(&self, a: UserId, b: UserId) -> Result<Option<Conversation>> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE direct_key = ?1"),
                params![direct_key(a, b)],
                row_to_conversation,
            )
            .optional()?;

        row.map(|row| self.attach_members(row)).transpose()
    }

    /// Conversations where `user` is a participant or an invitee, most
    /// recently active first.
    pub fn conversations_for(&self, user: UserId) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE id IN (SELECT conversation_id FROM conversation_members WHERE user_id = ?1)
             ORDER BY updated_at DESC"
        ))?;
        let rows = stmt.query_map(params![user.to_string()], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(self.attach_members(row?)?);
        }
        Ok(conversations)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Persist the full state of a group: metadata plus member rows, in
    /// one transaction.
    pub fn save_group(&self, conversation: &Conversation) -> Result<()> {
        let Some(group) = conversation.group() else {
            return Err(StoreError::Corrupt(format!(
                "conversation {} is not a group",
                conversation.id
            )));
        };

        let tx = self.conn().unchecked_transaction()?;
        let affected = tx.execute(
            "UPDATE conversations
             SET group_name = ?2, group_avatar = ?3, group_admin = ?4, updated_at = ?5
             WHERE id = ?1 AND is_group = 1",
            params![
                conversation.id.to_string(),
                group.group_name,
                group.group_avatar,
                group.group_admin.to_string(),
                conversation.updated_at.to_rfc3339(),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }

        tx.execute(
            "DELETE FROM conversation_members WHERE conversation_id = ?1",
            params![conversation.id.to_string()],
        )?;
        write_members(&tx, conversation)?;

        tx.commit()?;
        Ok(())
    }

    /// Bump `updated_at` so the conversation sorts as recently active.
    pub fn touch_conversation(&self, id: ConversationId, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
            params![id.to_string(), at.to_rfc3339()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a conversation and its member rows. Messages are kept.
    pub fn delete_conversation(&self, id: ConversationId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn attach_members(&self, row: ConversationRow) -> Result<Conversation> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, state FROM conversation_members
             WHERE conversation_id = ?1
             ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![row.id.to_string()], |r| {
            let user: String = r.get(0)?;
            let state: String = r.get(1)?;
            Ok((parse_id::<UserId>(0, &user)?, state))
        })?;

        let mut participants = Vec::new();
        let mut pending = Vec::new();
        for member in rows {
            let (user, state) = member?;
            match state.as_str() {
                "member" => participants.push(user),
                "pending" => pending.push(user),
                other => {
                    return Err(StoreError::Corrupt(format!("unknown member state '{other}'")))
                }
            }
        }

        let kind = if row.is_group {
            let admin = row.group_admin.ok_or_else(|| {
                StoreError::Corrupt(format!("group {} has no admin", row.id))
            })?;
            ConversationKind::Group(Group {
                group_name: row.group_name.unwrap_or_default(),
                group_avatar: row.group_avatar,
                group_admin: admin,
                participants,
                pending_participants: pending,
            })
        } else {
            let [a, b] = participants[..] else {
                return Err(StoreError::Corrupt(format!(
                    "direct conversation {} has {} participants",
                    row.id,
                    participants.len()
                )));
            };
            ConversationKind::Direct { participants: [a, b] }
        };

        Ok(Conversation {
            id: row.id,
            kind,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn write_members(tx: &rusqlite::Transaction<'_>, conversation: &Conversation) -> Result<()> {
    let id = conversation.id.to_string();
    let mut insert = tx.prepare(
        "INSERT INTO conversation_members (conversation_id, user_id, state, position)
         VALUES (?1, ?2, ?3, ?4)",
    )?;

    let (participants, pending): (&[UserId], &[UserId]) = match &conversation.kind {
        ConversationKind::Direct { participants } => (&participants[..], &[][..]),
        ConversationKind::Group(group) => (&group.participants[..], &group.pending_participants[..]),
    };

    for (position, user) in participants.iter().enumerate() {
        insert.execute(params![id, user.to_string(), "member", position as i64])?;
    }
    for (position, user) in pending.iter().enumerate() {
        insert.execute(params![id, user.to_string(), "pending", position as i64])?;
    }
    Ok(())
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    let id: String = row.get(0)?;
    let admin: Option<String> = row.get(4)?;
    let created: String = row.get(5)?;
    let updated: String = row.get(6)?;

    Ok(ConversationRow {
        id: parse_id(0, &id)?,
        is_group: row.get(1)?,
        group_name: row.get(2)?,
        group_avatar: row.get(3)?,
        group_admin: parse_opt_id(4, admin)?,
        created_at: parse_ts(5, &created)?,
        updated_at: parse_ts(6, &updated)?,
    })
}
