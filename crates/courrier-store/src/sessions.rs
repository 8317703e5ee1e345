//! Durable mirror of ratchet session state, keyed by (peer, device).
//!
//! The cipher layer writes here after every ratchet advance, so a restart
//! resumes mid-conversation instead of forcing a new handshake.

use chrono::Utc;
use rusqlite::params;

use courrier_shared::types::{DeviceId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::SessionRecord;

impl Database {
    /// Write the serialized session, inserting or overwriting in place.
    /// `created_at` is preserved across overwrites; `last_used_at` is not.
    pub fn save_session(&self, peer: &UserId, peer_device: DeviceId, state: &[u8]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO sessions (peer, peer_device, state, created_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(peer, peer_device)
             DO UPDATE SET state = excluded.state, last_used_at = excluded.last_used_at",
            params![peer.to_hex(), peer_device.0, state, now],
        )?;
        Ok(())
    }

    pub fn load_session(&self, peer: &UserId, peer_device: DeviceId) -> Result<Option<SessionRecord>> {
        let result = self.conn().query_row(
            "SELECT peer, peer_device, state, created_at, last_used_at
             FROM sessions WHERE peer = ?1 AND peer_device = ?2",
            params![peer.to_hex(), peer_device.0],
            row_to_session,
        );
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(StoreError::Sqlite(other)),
        }
    }

    /// Drop a session, e.g. when the peer re-handshakes from a wiped device.
    pub fn delete_session(&self, peer: &UserId, peer_device: DeviceId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM sessions WHERE peer = ?1 AND peer_device = ?2",
            params![peer.to_hex(), peer_device.0],
        )?;
        Ok(affected > 0)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT peer, peer_device, state, created_at, last_used_at
             FROM sessions ORDER BY last_used_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_session)?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let peer_hex: String = row.get(0)?;
    let peer_device: u32 = row.get(1)?;
    let state: Vec<u8> = row.get(2)?;
    let created_str: String = row.get(3)?;
    let last_used_str: String = row.get(4)?;
    Ok(SessionRecord {
        peer: crate::messages::parse_user(&peer_hex, 0)?,
        peer_device: DeviceId(peer_device),
        state,
        created_at: crate::messages::parse_rfc3339(&created_str, 3)?,
        last_used_at: crate::messages::parse_rfc3339(&last_used_str, 4)?,
    })
}
