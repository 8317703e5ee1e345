//! CRUD operations for [`Message`] records.
//!
//! Both the delivery side and the sync reconciler write here, so every write
//! is an upsert keyed by message id and lifecycle changes go through the
//! monotonic [`Database::advance_status`] guard.

use chrono::{DateTime, Utc};
use rusqlite::params;

use courrier_shared::types::{ConversationId, DeviceId, MessageId, MessageStatus, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Message;

impl Database {
    // ------------------------------------------------------------------
    // Create / merge
    // ------------------------------------------------------------------

    /// Insert a message if its id is not already present.
    ///
    /// Returns `true` when a row was inserted, `false` when the id already
    /// existed (replayed event).  An existing row always wins: replays never
    /// clobber local lifecycle or decryption progress.
    pub fn upsert_message(&self, message: &Message) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT INTO messages (id, conversation_id, sender, sender_device, body,
                                   ciphertext, is_encrypted, is_outgoing, reply_to,
                                   timestamp, status, edited_at, deleted_at, local_only)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(id) DO NOTHING",
            params![
                message.id.to_string(),
                message.conversation_id.to_string(),
                message.sender.to_hex(),
                message.sender_device.0,
                message.body,
                message.ciphertext,
                message.is_encrypted,
                message.is_outgoing,
                message.reply_to.map(|id| id.to_string()),
                message.timestamp.to_rfc3339(),
                message.status.as_str(),
                message.edited_at.map(|t| t.to_rfc3339()),
                message.deleted_at.map(|t| t.to_rfc3339()),
                message.local_only,
            ],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single message by id.
    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Page through a conversation's log, newest first.
    pub fn get_messages_for_conversation(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY timestamp DESC
             LIMIT ?2 OFFSET ?3"
        ))?;

        let rows = stmt.query_map(
            params![conversation_id.to_string(), limit, offset],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Ids of received messages not yet marked read, oldest first.  Feeds
    /// the read receipt sent when the user opens the conversation.
    pub fn unread_inbound_ids(&self, conversation_id: ConversationId) -> Result<Vec<MessageId>> {
        let mut stmt = self.conn().prepare(
            "SELECT id FROM messages
             WHERE conversation_id = ?1 AND is_outgoing = 0
               AND status != 'read' AND deleted_at IS NULL
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id.to_string()], |row| {
            let id_str: String = row.get(0)?;
            Ok(MessageId(parse_uuid(&id_str, 0)?))
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Messages from one peer device whose ciphertext never decrypted.
    /// The session layer retries these after a session rebuild.
    pub fn undecrypted_from_peer(
        &self,
        peer: &UserId,
        peer_device: DeviceId,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE sender = ?1 AND sender_device = ?2
               AND body IS NULL AND ciphertext IS NOT NULL
             ORDER BY timestamp ASC"
        ))?;

        let rows = stmt.query_map(params![peer.to_hex(), peer_device.0], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Advance a message's lifecycle state, if and only if the transition
    /// moves forward.  Returns the new status when a change was applied,
    /// `None` for out-of-order or replayed updates (a no-op, not an error).
    pub fn advance_status(
        &self,
        id: MessageId,
        next: MessageStatus,
    ) -> Result<Option<MessageStatus>> {
        let current = self.get_message(id)?.status;
        if !current.can_advance_to(next) {
            return Ok(None);
        }
        self.conn().execute(
            "UPDATE messages SET status = ?2 WHERE id = ?1",
            params![id.to_string(), next.as_str()],
        )?;
        Ok(Some(next))
    }

    /// Bulk variant of [`Database::advance_status`]; unknown ids are
    /// skipped.  Returns the ids that actually changed.
    pub fn advance_status_bulk(
        &self,
        ids: &[MessageId],
        next: MessageStatus,
    ) -> Result<Vec<MessageId>> {
        let mut changed = Vec::new();
        for id in ids {
            match self.advance_status(*id, next) {
                Ok(Some(_)) => changed.push(*id),
                Ok(None) | Err(StoreError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(changed)
    }

    /// Record the plaintext of a previously undecryptable row.  The stored
    /// ciphertext stays in the log for post-crash re-decryption.
    pub fn set_decrypted_body(&self, id: MessageId, body: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE messages SET body = ?2 WHERE id = ?1",
            params![id.to_string(), body],
        )?;
        Ok(())
    }

    /// Flip the encryption flag, for sends that fell back to plaintext
    /// after the row was written.
    pub fn set_message_encrypted(&self, id: MessageId, encrypted: bool) -> Result<()> {
        self.conn().execute(
            "UPDATE messages SET is_encrypted = ?2 WHERE id = ?1",
            params![id.to_string(), encrypted],
        )?;
        Ok(())
    }

    /// Put a message's content back to a prior state, clearing any
    /// deletion mark.  This is the undo side of an optimistic edit or
    /// delete whose delivery was rejected.
    pub fn restore_message_content(
        &self,
        id: MessageId,
        body: Option<&str>,
        edited_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE messages SET body = ?2, edited_at = ?3, deleted_at = NULL WHERE id = ?1",
            params![
                id.to_string(),
                body,
                edited_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Apply an edit: replace the body and stamp `edited_at`.
    /// Deleted messages are not editable.
    pub fn apply_edit(
        &self,
        id: MessageId,
        new_body: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET body = ?2, edited_at = ?3
             WHERE id = ?1 AND deleted_at IS NULL",
            params![id.to_string(), new_body, edited_at.to_rfc3339()],
        )?;
        Ok(affected > 0)
    }

    /// Soft-delete: stamp `deleted_at` and blank the body.  Idempotent --
    /// deleting an already-deleted message returns `false`.
    pub fn apply_delete(&self, id: MessageId, deleted_at: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET deleted_at = ?2, body = NULL, ciphertext = NULL
             WHERE id = ?1 AND deleted_at IS NULL",
            params![id.to_string(), deleted_at.to_rfc3339()],
        )?;
        Ok(affected > 0)
    }

    /// Mark a cancelled send as client-side only.
    pub fn set_local_only(&self, id: MessageId, local_only: bool) -> Result<()> {
        self.conn().execute(
            "UPDATE messages SET local_only = ?2 WHERE id = ?1",
            params![id.to_string(), local_only],
        )?;
        Ok(())
    }

    /// Re-enter the pipeline after a permanent failure or cancellation.
    /// Deliberately bypasses the monotonic guard: manual resend is the one
    /// sanctioned way back to `pending`.
    pub fn reset_for_resend(&self, id: MessageId) -> Result<()> {
        self.conn().execute(
            "UPDATE messages SET status = 'pending', local_only = 0 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender, sender_device, body, ciphertext, \
     is_encrypted, is_outgoing, reply_to, timestamp, status, edited_at, deleted_at, local_only";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Message`].
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let conversation_str: String = row.get(1)?;
    let sender_hex: String = row.get(2)?;
    let sender_device: u32 = row.get(3)?;
    let body: Option<String> = row.get(4)?;
    let ciphertext: Option<Vec<u8>> = row.get(5)?;
    let is_encrypted: bool = row.get(6)?;
    let is_outgoing: bool = row.get(7)?;
    let reply_to_str: Option<String> = row.get(8)?;
    let ts_str: String = row.get(9)?;
    let status_str: String = row.get(10)?;
    let edited_str: Option<String> = row.get(11)?;
    let deleted_str: Option<String> = row.get(12)?;
    let local_only: bool = row.get(13)?;

    Ok(Message {
        id: MessageId(parse_uuid(&id_str, 0)?),
        conversation_id: ConversationId(parse_uuid(&conversation_str, 1)?),
        sender: parse_user(&sender_hex, 2)?,
        sender_device: DeviceId(sender_device),
        body,
        ciphertext,
        is_encrypted,
        is_outgoing,
        reply_to: reply_to_str
            .map(|s| parse_uuid(&s, 8).map(MessageId))
            .transpose()?,
        timestamp: parse_rfc3339(&ts_str, 9)?,
        status: MessageStatus::parse(&status_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                10,
                rusqlite::types::Type::Text,
                format!("unknown status {status_str:?}").into(),
            )
        })?,
        edited_at: edited_str.map(|s| parse_rfc3339(&s, 11)).transpose()?,
        deleted_at: deleted_str.map(|s| parse_rfc3339(&s, 12)).transpose()?,
        local_only,
    })
}

pub(crate) fn parse_uuid(s: &str, col: usize) -> rusqlite::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_user(s: &str, col: usize) -> rusqlite::Result<UserId> {
    UserId::from_hex(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_rfc3339(s: &str, col: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
        })
}
