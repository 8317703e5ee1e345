//! Reaction storage.  A reaction is the triple (message, emoji, user); the
//! composite primary key makes adds and removes naturally idempotent, which
//! is what lets replayed reaction events merge cleanly.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use rusqlite::params;

use courrier_shared::types::{MessageId, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::messages::{parse_user, parse_uuid};

impl Database {
    /// Add a reaction.  Returns `false` when the same user already reacted
    /// with the same emoji (replay or double-tap).
    pub fn add_reaction(&self, message_id: MessageId, emoji: &str, user: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO reactions (message_id, emoji, user_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                message_id.to_string(),
                emoji,
                user.to_hex(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Remove a reaction.  Returns `false` when there was nothing to remove.
    pub fn remove_reaction(
        &self,
        message_id: MessageId,
        emoji: &str,
        user: &UserId,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM reactions WHERE message_id = ?1 AND emoji = ?2 AND user_id = ?3",
            params![message_id.to_string(), emoji, user.to_hex()],
        )?;
        Ok(affected > 0)
    }

    /// All reactions on one message, grouped as emoji -> reacting users.
    pub fn reactions_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<BTreeMap<String, BTreeSet<UserId>>> {
        let mut stmt = self.conn().prepare(
            "SELECT emoji, user_id FROM reactions WHERE message_id = ?1",
        )?;
        let rows = stmt.query_map(params![message_id.to_string()], |row| {
            let emoji: String = row.get(0)?;
            let user_hex: String = row.get(1)?;
            Ok((emoji, parse_user(&user_hex, 1)?))
        })?;

        let mut grouped: BTreeMap<String, BTreeSet<UserId>> = BTreeMap::new();
        for row in rows {
            let (emoji, user) = row?;
            grouped.entry(emoji).or_default().insert(user);
        }
        Ok(grouped)
    }

    /// Reactions for a batch of messages, for rendering a page of history
    /// without one query per row.
    pub fn reactions_for_messages(
        &self,
        message_ids: &[MessageId],
    ) -> Result<BTreeMap<MessageId, BTreeMap<String, BTreeSet<UserId>>>> {
        if message_ids.is_empty() {
            return Ok(BTreeMap::new());
        }

        let placeholders = vec!["?"; message_ids.len()].join(", ");
        let sql = format!(
            "SELECT message_id, emoji, user_id FROM reactions WHERE message_id IN ({placeholders})"
        );
        let mut stmt = self.conn().prepare(&sql)?;

        let id_strings: Vec<String> = message_ids.iter().map(|id| id.to_string()).collect();
        let rows = stmt.query_map(rusqlite::params_from_iter(id_strings.iter()), |row| {
            let id_str: String = row.get(0)?;
            let emoji: String = row.get(1)?;
            let user_hex: String = row.get(2)?;
            Ok((
                MessageId(parse_uuid(&id_str, 0)?),
                emoji,
                parse_user(&user_hex, 2)?,
            ))
        })?;

        let mut grouped: BTreeMap<MessageId, BTreeMap<String, BTreeSet<UserId>>> = BTreeMap::new();
        for row in rows {
            let (message_id, emoji, user) = row?;
            grouped
                .entry(message_id)
                .or_default()
                .entry(emoji)
                .or_default()
                .insert(user);
        }
        Ok(grouped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db"), &[0u8; 32]).unwrap();
        (dir, db)
    }

    #[test]
    fn add_is_idempotent() {
        let (_dir, db) = test_db();
        let message_id = MessageId::new();
        let user = UserId([4u8; 32]);

        assert!(db.add_reaction(message_id, "👍", &user).unwrap());
        assert!(!db.add_reaction(message_id, "👍", &user).unwrap());

        let grouped = db.reactions_for_message(message_id).unwrap();
        assert_eq!(grouped.get("👍").map(|s| s.len()), Some(1));
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, db) = test_db();
        let message_id = MessageId::new();
        let user = UserId([4u8; 32]);

        db.add_reaction(message_id, "❤️", &user).unwrap();
        assert!(db.remove_reaction(message_id, "❤️", &user).unwrap());
        assert!(!db.remove_reaction(message_id, "❤️", &user).unwrap());
        assert!(db.reactions_for_message(message_id).unwrap().is_empty());
    }

    #[test]
    fn groups_by_emoji_across_users() {
        let (_dir, db) = test_db();
        let message_id = MessageId::new();
        let alice = UserId([1u8; 32]);
        let bob = UserId([2u8; 32]);

        db.add_reaction(message_id, "👍", &alice).unwrap();
        db.add_reaction(message_id, "👍", &bob).unwrap();
        db.add_reaction(message_id, "🎉", &alice).unwrap();

        let grouped = db.reactions_for_message(message_id).unwrap();
        assert_eq!(grouped["👍"].len(), 2);
        assert_eq!(grouped["🎉"].len(), 1);
    }

    #[test]
    fn batch_lookup_spans_messages() {
        let (_dir, db) = test_db();
        let first = MessageId::new();
        let second = MessageId::new();
        let user = UserId([1u8; 32]);

        db.add_reaction(first, "👍", &user).unwrap();
        db.add_reaction(second, "❤️", &user).unwrap();

        let grouped = db.reactions_for_messages(&[first, second]).unwrap();
        assert_eq!(grouped.len(), 2);
        assert!(grouped[&first].contains_key("👍"));
        assert!(grouped[&second].contains_key("❤️"));
    }
}
