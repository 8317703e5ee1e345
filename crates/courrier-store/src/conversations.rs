//! Conversation records and the derived summaries the conversation list
//! renders from.

use chrono::{DateTime, Utc};
use rusqlite::params;

use courrier_shared::types::{ConversationId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::messages::{parse_rfc3339, parse_user, parse_uuid};
use crate::models::{Conversation, ConversationSummary};

impl Database {
    /// Insert a conversation if its id is not already present.
    pub fn upsert_conversation(&self, conversation: &Conversation) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT INTO conversations (id, peer, created_at, archived, last_read_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO NOTHING",
            params![
                conversation.id.to_string(),
                conversation.peer.to_hex(),
                conversation.created_at.to_rfc3339(),
                conversation.archived,
                conversation.last_read_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.conn()
            .query_row(
                "SELECT id, peer, created_at, archived, last_read_at
                 FROM conversations WHERE id = ?1",
                params![id.to_string()],
                row_to_conversation,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn list_conversations(&self, include_archived: bool) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, peer, created_at, archived, last_read_at
             FROM conversations
             WHERE archived <= ?1
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![include_archived], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    pub fn set_archived(&self, id: ConversationId, archived: bool) -> Result<()> {
        self.conn().execute(
            "UPDATE conversations SET archived = ?2 WHERE id = ?1",
            params![id.to_string(), archived],
        )?;
        Ok(())
    }

    /// Move the read watermark forward.  A stale watermark (older than the
    /// stored one) is ignored, so replayed read events cannot resurrect
    /// unread counts.
    pub fn set_last_read_at(&self, id: ConversationId, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE conversations SET last_read_at = ?2
             WHERE id = ?1 AND (last_read_at IS NULL OR last_read_at < ?2)",
            params![id.to_string(), at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Fold the message log into one summary per conversation: latest
    /// preview, last activity and unread count.  Sorted by recency.
    pub fn conversation_summaries(&self, include_archived: bool) -> Result<Vec<ConversationSummary>> {
        let conversations = self.list_conversations(include_archived)?;

        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let latest: Option<(Option<String>, String)> = match self.conn().query_row(
                "SELECT body, timestamp FROM messages
                 WHERE conversation_id = ?1 AND deleted_at IS NULL
                 ORDER BY timestamp DESC LIMIT 1",
                params![conversation.id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            ) {
                Ok(pair) => Some(pair),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(other) => return Err(StoreError::Sqlite(other)),
            };

            let unread_count: u32 = self.conn().query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE conversation_id = ?1 AND is_outgoing = 0 AND deleted_at IS NULL
                   AND (?2 IS NULL OR timestamp > ?2)",
                params![
                    conversation.id.to_string(),
                    conversation.last_read_at.map(|t| t.to_rfc3339()),
                ],
                |row| row.get(0),
            )?;

            let last_activity_at = match &latest {
                Some((_, ts)) => DateTime::parse_from_rfc3339(ts)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(StoreError::ChronoParse)?,
                None => conversation.created_at,
            };

            summaries.push(ConversationSummary {
                conversation_id: conversation.id,
                peer: conversation.peer,
                last_message_preview: latest.and_then(|(body, _)| body),
                last_activity_at: Some(last_activity_at),
                unread_count,
                archived: conversation.archived,
            });
        }

        summaries.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(summaries)
    }
}

/// Map a `rusqlite::Row` to a [`Conversation`].
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id_str: String = row.get(0)?;
    let peer_hex: String = row.get(1)?;
    let created_str: String = row.get(2)?;
    let archived: bool = row.get(3)?;
    let last_read_str: Option<String> = row.get(4)?;

    Ok(Conversation {
        id: ConversationId(parse_uuid(&id_str, 0)?),
        peer: parse_user(&peer_hex, 1)?,
        created_at: parse_rfc3339(&created_str, 2)?,
        archived,
        last_read_at: last_read_str.map(|s| parse_rfc3339(&s, 4)).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use chrono::Duration;
    use courrier_shared::types::{DeviceId, MessageId, MessageStatus};

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db"), &[0u8; 32]).unwrap();
        (dir, db)
    }

    fn seed(db: &Database, peer: UserId) -> Conversation {
        let conversation = Conversation {
            id: ConversationId::direct(&UserId([0u8; 32]), &peer),
            peer,
            created_at: Utc::now() - Duration::hours(1),
            archived: false,
            last_read_at: None,
        };
        db.upsert_conversation(&conversation).unwrap();
        conversation
    }

    fn inbound(conversation: &Conversation, text: &str, at: DateTime<Utc>) -> Message {
        Message {
            id: MessageId::new(),
            conversation_id: conversation.id,
            sender: conversation.peer,
            sender_device: DeviceId(1),
            body: Some(text.into()),
            ciphertext: None,
            is_encrypted: true,
            is_outgoing: false,
            reply_to: None,
            timestamp: at,
            status: MessageStatus::Delivered,
            edited_at: None,
            deleted_at: None,
            local_only: false,
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let (_dir, db) = test_db();
        let conversation = seed(&db, UserId([5u8; 32]));
        assert!(!db.upsert_conversation(&conversation).unwrap());
        assert_eq!(db.list_conversations(false).unwrap().len(), 1);
    }

    #[test]
    fn summary_counts_unread_after_watermark() {
        let (_dir, db) = test_db();
        let conversation = seed(&db, UserId([5u8; 32]));
        let base = Utc::now();

        db.upsert_message(&inbound(&conversation, "un", base - Duration::minutes(3)))
            .unwrap();
        db.upsert_message(&inbound(&conversation, "deux", base - Duration::minutes(2)))
            .unwrap();
        db.upsert_message(&inbound(&conversation, "trois", base - Duration::minutes(1)))
            .unwrap();

        let summary = &db.conversation_summaries(false).unwrap()[0];
        assert_eq!(summary.unread_count, 3);
        assert_eq!(summary.last_message_preview.as_deref(), Some("trois"));

        db.set_last_read_at(conversation.id, base - Duration::minutes(2))
            .unwrap();
        let summary = &db.conversation_summaries(false).unwrap()[0];
        assert_eq!(summary.unread_count, 1);

        // a stale watermark must not undo the newer one
        db.set_last_read_at(conversation.id, base - Duration::minutes(30))
            .unwrap();
        let summary = &db.conversation_summaries(false).unwrap()[0];
        assert_eq!(summary.unread_count, 1);
    }

    #[test]
    fn deleted_messages_leave_preview_and_count() {
        let (_dir, db) = test_db();
        let conversation = seed(&db, UserId([5u8; 32]));
        let base = Utc::now();

        let kept = inbound(&conversation, "reste", base - Duration::minutes(2));
        let dropped = inbound(&conversation, "parti", base - Duration::minutes(1));
        db.upsert_message(&kept).unwrap();
        db.upsert_message(&dropped).unwrap();
        db.apply_delete(dropped.id, Utc::now()).unwrap();

        let summary = &db.conversation_summaries(false).unwrap()[0];
        assert_eq!(summary.last_message_preview.as_deref(), Some("reste"));
        assert_eq!(summary.unread_count, 1);
    }

    #[test]
    fn archived_conversations_are_hidden_by_default() {
        let (_dir, db) = test_db();
        let conversation = seed(&db, UserId([5u8; 32]));
        db.set_archived(conversation.id, true).unwrap();

        assert!(db.conversation_summaries(false).unwrap().is_empty());
        assert_eq!(db.conversation_summaries(true).unwrap().len(), 1);
    }
}
