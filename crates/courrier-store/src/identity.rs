//! Persistence for the device identity and its prekey material.
//!
//! The identity table is a single-row table (`id = 1`); prekeys live in
//! their own tables so the pool can be replenished and consumed
//! independently of the identity itself.  Consuming a one-time prekey is a
//! guarded update: a key already marked consumed is never handed out again.

use chrono::Utc;
use rusqlite::params;

use courrier_shared::types::DeviceId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{StoredIdentity, StoredPreKey, StoredSignedPreKey};

impl Database {
    // ------------------------------------------------------------------
    // Device identity
    // ------------------------------------------------------------------

    pub fn save_device_identity(&self, identity: &StoredIdentity) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO device_identity
                 (id, device_id, registration_id, signing_secret, exchange_secret,
                  next_prekey_id, published, created_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                identity.device_id.0,
                identity.registration_id,
                identity.signing_secret.as_slice(),
                identity.exchange_secret.as_slice(),
                identity.next_prekey_id,
                identity.published,
                identity.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_device_identity(&self) -> Result<Option<StoredIdentity>> {
        let result = self.conn().query_row(
            "SELECT device_id, registration_id, signing_secret, exchange_secret,
                    next_prekey_id, published, created_at
             FROM device_identity WHERE id = 1",
            [],
            |row| {
                let device_id: u32 = row.get(0)?;
                let registration_id: u32 = row.get(1)?;
                let signing_secret: Vec<u8> = row.get(2)?;
                let exchange_secret: Vec<u8> = row.get(3)?;
                let next_prekey_id: u32 = row.get(4)?;
                let published: bool = row.get(5)?;
                let created_str: String = row.get(6)?;
                Ok(StoredIdentity {
                    device_id: DeviceId(device_id),
                    registration_id,
                    signing_secret: blob_to_array(signing_secret, 2)?,
                    exchange_secret: blob_to_array(exchange_secret, 3)?,
                    next_prekey_id,
                    published,
                    created_at: crate::messages::parse_rfc3339(&created_str, 6)?,
                })
            },
        );
        match result {
            Ok(identity) => Ok(Some(identity)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(StoreError::Sqlite(other)),
        }
    }

    /// Record whether the directory accepted our registration.
    pub fn set_identity_published(&self, published: bool) -> Result<()> {
        self.conn().execute(
            "UPDATE device_identity SET published = ?1 WHERE id = 1",
            params![published],
        )?;
        Ok(())
    }

    /// Reserve a contiguous block of prekey ids and return the first one.
    pub fn allocate_prekey_ids(&self, count: u32) -> Result<u32> {
        let start: u32 = self.conn().query_row(
            "SELECT next_prekey_id FROM device_identity WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        self.conn().execute(
            "UPDATE device_identity SET next_prekey_id = ?1 WHERE id = 1",
            params![start + count],
        )?;
        Ok(start)
    }

    // ------------------------------------------------------------------
    // Signed prekeys
    // ------------------------------------------------------------------

    pub fn save_signed_prekey(&self, prekey: &StoredSignedPreKey) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO signed_prekeys (id, public, secret, signature, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                prekey.id,
                prekey.public.as_slice(),
                prekey.secret.as_slice(),
                prekey.signature.as_slice(),
                prekey.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_signed_prekey(&self, id: u32) -> Result<StoredSignedPreKey> {
        self.conn()
            .query_row(
                "SELECT id, public, secret, signature, created_at
                 FROM signed_prekeys WHERE id = ?1",
                params![id],
                row_to_signed_prekey,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// The most recently generated signed prekey, if any.
    pub fn latest_signed_prekey(&self) -> Result<Option<StoredSignedPreKey>> {
        let result = self.conn().query_row(
            "SELECT id, public, secret, signature, created_at
             FROM signed_prekeys ORDER BY id DESC LIMIT 1",
            [],
            row_to_signed_prekey,
        );
        match result {
            Ok(prekey) => Ok(Some(prekey)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(StoreError::Sqlite(other)),
        }
    }

    // ------------------------------------------------------------------
    // One-time prekeys
    // ------------------------------------------------------------------

    pub fn save_one_time_prekeys(&mut self, prekeys: &[StoredPreKey]) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        for prekey in prekeys {
            tx.execute(
                "INSERT OR REPLACE INTO one_time_prekeys
                     (id, public, secret, consumed, published, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    prekey.id,
                    prekey.public.as_slice(),
                    prekey.secret.as_slice(),
                    prekey.consumed,
                    prekey.published,
                    prekey.created_at.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Consume a one-time prekey.  The guarded update makes this a
    /// use-at-most-once operation: a second take of the same id fails with
    /// [`StoreError::PreKeyConsumed`].
    pub fn take_one_time_prekey(&self, id: u32) -> Result<StoredPreKey> {
        let claimed = self.conn().execute(
            "UPDATE one_time_prekeys SET consumed = 1 WHERE id = ?1 AND consumed = 0",
            params![id],
        )?;
        if claimed == 0 {
            let exists: bool = self.conn().query_row(
                "SELECT COUNT(*) > 0 FROM one_time_prekeys WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            return Err(if exists {
                StoreError::PreKeyConsumed(id)
            } else {
                StoreError::NotFound
            });
        }

        self.conn()
            .query_row(
                "SELECT id, public, secret, consumed, published, created_at
                 FROM one_time_prekeys WHERE id = ?1",
                params![id],
                row_to_prekey,
            )
            .map_err(StoreError::Sqlite)
    }

    /// How many unconsumed keys remain in the pool, for replenishment
    /// decisions.
    pub fn unconsumed_prekey_count(&self) -> Result<u32> {
        let count: u32 = self.conn().query_row(
            "SELECT COUNT(*) FROM one_time_prekeys WHERE consumed = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Keys generated locally but not yet uploaded to the directory.
    pub fn unpublished_prekeys(&self) -> Result<Vec<StoredPreKey>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, public, secret, consumed, published, created_at
             FROM one_time_prekeys WHERE published = 0 AND consumed = 0
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], row_to_prekey)?;

        let mut prekeys = Vec::new();
        for row in rows {
            prekeys.push(row?);
        }
        Ok(prekeys)
    }

    pub fn mark_prekeys_published(&self, ids: &[u32]) -> Result<()> {
        for id in ids {
            self.conn().execute(
                "UPDATE one_time_prekeys SET published = 1 WHERE id = ?1",
                params![id],
            )?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_signed_prekey(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredSignedPreKey> {
    let id: u32 = row.get(0)?;
    let public: Vec<u8> = row.get(1)?;
    let secret: Vec<u8> = row.get(2)?;
    let signature: Vec<u8> = row.get(3)?;
    let created_str: String = row.get(4)?;
    Ok(StoredSignedPreKey {
        id,
        public: blob_to_array(public, 1)?,
        secret: blob_to_array(secret, 2)?,
        signature: blob_to_array(signature, 3)?,
        created_at: crate::messages::parse_rfc3339(&created_str, 4)?,
    })
}

fn row_to_prekey(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredPreKey> {
    let id: u32 = row.get(0)?;
    let public: Vec<u8> = row.get(1)?;
    let secret: Vec<u8> = row.get(2)?;
    let consumed: bool = row.get(3)?;
    let published: bool = row.get(4)?;
    let created_str: String = row.get(5)?;
    Ok(StoredPreKey {
        id,
        public: blob_to_array(public, 1)?,
        secret: blob_to_array(secret, 2)?,
        consumed,
        published,
        created_at: crate::messages::parse_rfc3339(&created_str, 5)?,
    })
}

fn blob_to_array<const N: usize>(blob: Vec<u8>, col: usize) -> rusqlite::Result<[u8; N]> {
    blob.try_into().map_err(|v: Vec<u8>| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Blob,
            format!("expected {N} bytes, got {}", v.len()).into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db"), &[0u8; 32]).unwrap();
        (dir, db)
    }

    fn sample_identity() -> StoredIdentity {
        StoredIdentity {
            device_id: DeviceId(42),
            registration_id: 777,
            signing_secret: [1u8; 32],
            exchange_secret: [2u8; 32],
            next_prekey_id: 1,
            published: false,
            created_at: Utc::now(),
        }
    }

    fn sample_prekey(id: u32) -> StoredPreKey {
        StoredPreKey {
            id,
            public: [3u8; 32],
            secret: [4u8; 32],
            consumed: false,
            published: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn identity_round_trips() {
        let (_dir, db) = test_db();
        assert!(db.load_device_identity().unwrap().is_none());

        let identity = sample_identity();
        db.save_device_identity(&identity).unwrap();

        let loaded = db.load_device_identity().unwrap().unwrap();
        assert_eq!(loaded.device_id, identity.device_id);
        assert_eq!(loaded.signing_secret, identity.signing_secret);
        assert!(!loaded.published);

        db.set_identity_published(true).unwrap();
        assert!(db.load_device_identity().unwrap().unwrap().published);
    }

    #[test]
    fn prekey_id_blocks_do_not_overlap() {
        let (_dir, db) = test_db();
        db.save_device_identity(&sample_identity()).unwrap();

        let first = db.allocate_prekey_ids(100).unwrap();
        let second = db.allocate_prekey_ids(100).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 101);
    }

    #[test]
    fn one_time_prekey_is_consumed_at_most_once() {
        let (_dir, mut db) = test_db();
        db.save_one_time_prekeys(&[sample_prekey(7)]).unwrap();

        let taken = db.take_one_time_prekey(7).unwrap();
        assert!(taken.consumed);

        match db.take_one_time_prekey(7) {
            Err(StoreError::PreKeyConsumed(7)) => {}
            other => panic!("expected PreKeyConsumed, got {other:?}"),
        }
        match db.take_one_time_prekey(99) {
            Err(StoreError::NotFound) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn pool_counts_exclude_consumed() {
        let (_dir, mut db) = test_db();
        db.save_one_time_prekeys(&[sample_prekey(1), sample_prekey(2), sample_prekey(3)])
            .unwrap();
        assert_eq!(db.unconsumed_prekey_count().unwrap(), 3);

        db.take_one_time_prekey(2).unwrap();
        assert_eq!(db.unconsumed_prekey_count().unwrap(), 2);
    }

    #[test]
    fn publish_tracking() {
        let (_dir, mut db) = test_db();
        db.save_one_time_prekeys(&[sample_prekey(1), sample_prekey(2)])
            .unwrap();
        assert_eq!(db.unpublished_prekeys().unwrap().len(), 2);

        db.mark_prekeys_published(&[1]).unwrap();
        let remaining = db.unpublished_prekeys().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, 2);
    }

    #[test]
    fn signed_prekey_latest_wins() {
        let (_dir, db) = test_db();
        assert!(db.latest_signed_prekey().unwrap().is_none());

        for id in [1u32, 2, 3] {
            db.save_signed_prekey(&StoredSignedPreKey {
                id,
                public: [id as u8; 32],
                secret: [id as u8; 32],
                signature: [0u8; 64],
                created_at: Utc::now(),
            })
            .unwrap();
        }

        assert_eq!(db.latest_signed_prekey().unwrap().unwrap().id, 3);
        assert_eq!(db.get_signed_prekey(2).unwrap().id, 2);
        assert!(matches!(
            db.get_signed_prekey(9),
            Err(StoreError::NotFound)
        ));
    }
}
