//! Message persistence and the status transitions of the delivery
//! lifecycle.
//!
//! Status is stored as its rank and every update filters on
//! `status < new`, so no statement can move a message backwards.

use murmur_shared::types::{ConversationId, MessageId, MessageStatus, Target, UserId};
use rusqlite::params;

use crate::database::{parse_id, parse_opt_id, parse_ts, Database};
use crate::error::Result;
use crate::models::Message;

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, receiver_id, body, status, is_system, created_at";

impl Database {
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages
                (id, conversation_id, sender_id, receiver_id, body, status, is_system, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id.to_string(),
                message.conversation_id.to_string(),
                message.sender_id.map(|s| s.to_string()),
                message.target.direct_peer().map(|r| r.to_string()),
                message.message,
                message.status.rank(),
                message.is_system_message,
                message.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        let message = self.conn().query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![id.to_string()],
            row_to_message,
        )?;
        Ok(message)
    }

    /// All messages of a conversation in insertion order.
    pub fn messages_for_conversation(&self, conversation: ConversationId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1
             ORDER BY rowid ASC"
        ))?;
        let rows = stmt.query_map(params![conversation.to_string()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Sweep: move every `sent` direct message addressed to `receiver` to
    /// `delivered`. Returns exactly the messages that transitioned.
    pub fn mark_delivered_for(&self, receiver: UserId) -> Result<Vec<Message>> {
        let tx = self.conn().unchecked_transaction()?;

        let pending = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE receiver_id = ?1 AND status = ?2
                 ORDER BY rowid ASC"
            ))?;
            let rows = stmt.query_map(
                params![receiver.to_string(), MessageStatus::Sent.rank()],
                row_to_message,
            )?;
            let mut pending = Vec::new();
            for row in rows {
                pending.push(row?);
            }
            pending
        };

        let mut delivered = Vec::with_capacity(pending.len());
        {
            let mut update = tx.prepare(
                "UPDATE messages SET status = ?2 WHERE id = ?1 AND status < ?2",
            )?;
            for mut message in pending {
                let Some(next) = message.status.advance(MessageStatus::Delivered) else {
                    continue;
                };
                let affected = update.execute(params![message.id.to_string(), next.rank()])?;
                if affected > 0 {
                    message.status = next;
                    delivered.push(message);
                }
            }
        }

        tx.commit()?;
        Ok(delivered)
    }

    /// Seen batch: every message from `sender` to `receiver` not yet seen
    /// becomes seen. Returns the number of messages that transitioned.
    pub fn mark_seen(&self, sender: UserId, receiver: UserId) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?3
             WHERE sender_id = ?1 AND receiver_id = ?2 AND status < ?3",
            params![sender.to_string(), receiver.to_string(), MessageStatus::Seen.rank()],
        )?;
        Ok(affected)
    }

    /// Distinct senders with direct messages to `receiver` that are not yet
    /// seen.
    pub fn unread_senders(&self, receiver: UserId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT DISTINCT sender_id FROM messages
             WHERE receiver_id = ?1 AND status < ?2 AND sender_id IS NOT NULL
             ORDER BY sender_id",
        )?;
        let rows = stmt.query_map(
            params![receiver.to_string(), MessageStatus::Seen.rank()],
            |row| {
                let sender: String = row.get(0)?;
                parse_id::<UserId>(0, &sender)
            },
        )?;

        let mut senders = Vec::new();
        for row in rows {
            senders.push(row?);
        }
        Ok(senders)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let conversation: String = row.get(1)?;
    let sender: Option<String> = row.get(2)?;
    let receiver: Option<String> = row.get(3)?;
    let rank: i64 = row.get(5)?;
    let created: String = row.get(7)?;

    let conversation_id: ConversationId = parse_id(1, &conversation)?;
    let target = match parse_opt_id::<UserId>(3, receiver)? {
        Some(user_id) => Target::Direct { user_id },
        None => Target::Group { conversation_id },
    };
    let status = MessageStatus::from_rank(rank).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Integer,
            format!("unknown message status rank {rank}").into(),
        )
    })?;

    Ok(Message {
        id: parse_id(0, &id)?,
        sender_id: parse_opt_id(2, sender)?,
        target,
        conversation_id,
        message: row.get(4)?,
        status,
        is_system_message: row.get(6)?,
        created_at: parse_ts(7, &created)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::tests::user;

    fn direct(db: &Database, from: UserId, to: UserId, status: MessageStatus) -> Message {
        let (conversation, _) = db.get_or_create_direct(from, to).unwrap();
        let message = Message::new(
            from,
            Target::Direct { user_id: to },
            conversation.id,
            "hi",
            status,
        );
        db.insert_message(&message).unwrap();
        message
    }

    #[test]
    fn test_round_trip_direct_and_system() {
        let db = Database::open_in_memory().unwrap();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");

        let msg = direct(&db, alice.id, bob.id, MessageStatus::Sent);
        assert_eq!(db.get_message(msg.id).unwrap(), msg);

        let system = Message::system(ConversationId::new(), "Bob joined the group");
        db.insert_message(&system).unwrap();
        assert_eq!(db.get_message(system.id).unwrap(), system);
    }

    #[test]
    fn test_status_never_regresses() {
        let db = Database::open_in_memory().unwrap();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        let msg = direct(&db, alice.id, bob.id, MessageStatus::Sent);

        assert_eq!(db.mark_seen(alice.id, bob.id).unwrap(), 1);
        assert!(db.mark_delivered_for(bob.id).unwrap().is_empty());
        assert_eq!(db.mark_seen(alice.id, bob.id).unwrap(), 0);
        assert_eq!(db.get_message(msg.id).unwrap().status, MessageStatus::Seen);
    }

    #[test]
    fn test_sweep_transitions_exactly_sent_messages() {
        let db = Database::open_in_memory().unwrap();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        let carol = user(&db, "carol");

        let m1 = direct(&db, alice.id, bob.id, MessageStatus::Sent);
        let m2 = direct(&db, carol.id, bob.id, MessageStatus::Sent);
        let _seen = direct(&db, alice.id, bob.id, MessageStatus::Seen);
        let _other = direct(&db, bob.id, alice.id, MessageStatus::Sent);

        let swept = db.mark_delivered_for(bob.id).unwrap();
        let ids: Vec<_> = swept.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![m1.id, m2.id]);
        assert!(swept.iter().all(|m| m.status == MessageStatus::Delivered));

        // A second sweep finds nothing.
        assert!(db.mark_delivered_for(bob.id).unwrap().is_empty());
    }

    #[test]
    fn test_mark_seen_and_unread() {
        let db = Database::open_in_memory().unwrap();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        let carol = user(&db, "carol");

        direct(&db, alice.id, bob.id, MessageStatus::Sent);
        direct(&db, alice.id, bob.id, MessageStatus::Delivered);
        direct(&db, carol.id, bob.id, MessageStatus::Delivered);

        let mut unread = db.unread_senders(bob.id).unwrap();
        unread.sort();
        let mut expected = vec![alice.id, carol.id];
        expected.sort();
        assert_eq!(unread, expected);

        assert_eq!(db.mark_seen(alice.id, bob.id).unwrap(), 2);
        assert_eq!(db.mark_seen(alice.id, bob.id).unwrap(), 0);
        assert_eq!(db.unread_senders(bob.id).unwrap(), vec![carol.id]);
    }

    #[test]
    fn test_group_messages_are_not_swept() {
        let db = Database::open_in_memory().unwrap();
        let alice = user(&db, "alice");
        let conversation_id = ConversationId::new();
        let msg = Message::new(
            alice.id,
            Target::Group { conversation_id },
            conversation_id,
            "hello all",
            MessageStatus::Sent,
        );
        db.insert_message(&msg).unwrap();

        assert!(db.mark_delivered_for(alice.id).unwrap().is_empty());
        assert_eq!(db.messages_for_conversation(conversation_id).unwrap(), vec![msg]);
    }
}
