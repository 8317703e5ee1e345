//! The durable retry queue for undelivered frames.
//!
//! Entries hold the pre-encryption body plus, once the first attempt has
//! resolved devices and encrypted, the prepared frames.  Retries after a
//! crash replay the prepared bytes instead of ratcheting again, which keeps
//! the cipher counters honest.  Timestamps here are unix milliseconds, not
//! RFC 3339: the scheduler does arithmetic on them.

use rusqlite::params;

use courrier_shared::protocol::FrameKind;
use courrier_shared::types::{ConversationId, MessageId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::messages::{parse_user, parse_uuid};
use crate::models::OutboxEntry;

impl Database {
    /// Queue a frame for delivery.  Returns `false` if the message is
    /// already queued.
    pub fn outbox_enqueue(&self, entry: &OutboxEntry) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT INTO outbox (message_id, conversation_id, recipient, kind, body,
                                 prepared, created_at_ms, next_retry_ms, tries)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(message_id) DO NOTHING",
            params![
                entry.message_id.to_string(),
                entry.conversation_id.to_string(),
                entry.recipient.to_hex(),
                entry.kind.as_str(),
                entry.body,
                entry.prepared,
                entry.created_at_ms,
                entry.next_retry_ms,
                entry.tries,
            ],
        )?;
        Ok(affected > 0)
    }

    /// Cache the encrypted frames produced by the first delivery attempt.
    pub fn outbox_set_prepared(&self, message_id: MessageId, prepared: &[u8]) -> Result<()> {
        self.conn().execute(
            "UPDATE outbox SET prepared = ?2 WHERE message_id = ?1",
            params![message_id.to_string(), prepared],
        )?;
        Ok(())
    }

    /// Entries whose retry time has come, oldest deadline first.
    pub fn outbox_due(&self, now_ms: i64, limit: u32) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT message_id, conversation_id, recipient, kind, body, prepared,
                    created_at_ms, next_retry_ms, tries
             FROM outbox WHERE next_retry_ms <= ?1
             ORDER BY next_retry_ms ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now_ms, limit], row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn outbox_get(&self, message_id: MessageId) -> Result<Option<OutboxEntry>> {
        let result = self.conn().query_row(
            "SELECT message_id, conversation_id, recipient, kind, body, prepared,
                    created_at_ms, next_retry_ms, tries
             FROM outbox WHERE message_id = ?1",
            params![message_id.to_string()],
            row_to_entry,
        );
        match result {
            Ok(entry) => Ok(Some(entry)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(StoreError::Sqlite(other)),
        }
    }

    /// Push the deadline out without consuming a retry.  Used when an
    /// attempt was refused before reaching the network (open circuit),
    /// which must not eat into the per-message retry budget.
    pub fn outbox_defer(&self, message_id: MessageId, next_retry_ms: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE outbox SET next_retry_ms = ?2 WHERE message_id = ?1",
            params![message_id.to_string(), next_retry_ms],
        )?;
        Ok(())
    }

    /// Record a failed attempt: bump the try counter and push the deadline
    /// out.  Returns the new try count so the caller can give up at its
    /// retry ceiling.
    pub fn outbox_bump_retry(&self, message_id: MessageId, next_retry_ms: i64) -> Result<u32> {
        self.conn().execute(
            "UPDATE outbox SET tries = tries + 1, next_retry_ms = ?2 WHERE message_id = ?1",
            params![message_id.to_string(), next_retry_ms],
        )?;
        let tries = self
            .conn()
            .query_row(
                "SELECT tries FROM outbox WHERE message_id = ?1",
                params![message_id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;
        Ok(tries)
    }

    /// Drop an entry after success, exhaustion or cancellation.
    pub fn outbox_remove(&self, message_id: MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM outbox WHERE message_id = ?1",
            params![message_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    pub fn outbox_len(&self) -> Result<u32> {
        let count: u32 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    let id_str: String = row.get(0)?;
    let conversation_str: String = row.get(1)?;
    let recipient_hex: String = row.get(2)?;
    let kind_str: String = row.get(3)?;
    let body: Vec<u8> = row.get(4)?;
    let prepared: Option<Vec<u8>> = row.get(5)?;
    let created_at_ms: i64 = row.get(6)?;
    let next_retry_ms: i64 = row.get(7)?;
    let tries: u32 = row.get(8)?;

    Ok(OutboxEntry {
        message_id: MessageId(parse_uuid(&id_str, 0)?),
        conversation_id: ConversationId(parse_uuid(&conversation_str, 1)?),
        recipient: parse_user(&recipient_hex, 2)?,
        kind: FrameKind::parse(&kind_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown frame kind {kind_str:?}").into(),
            )
        })?,
        body,
        prepared,
        created_at_ms,
        next_retry_ms,
        tries,
    })
}
