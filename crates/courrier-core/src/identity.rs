//! Device identity lifecycle: create-or-load on startup, directory
//! registration, and one-time prekey pool upkeep.
//!
//! The secret material never leaves the local store.  Registration with
//! the directory is best-effort at startup; a device that came up offline
//! stays usable locally and registers on the next [`ensure_registered`]
//! call once the directory is reachable.
//!
//! [`ensure_registered`]: DeviceIdentityStore::ensure_registered

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use courrier_shared::keys::{
    self, DeviceRegistration, OneTimePreKeyPublic, PeerBundle, PreKeyPair, SignedPreKey,
    SignedPreKeyPublic,
};
use courrier_shared::types::{DeviceId, UserId};
use courrier_shared::{Identity, IdentityExport, SessionError};
use courrier_store::{Database, StoreError, StoredIdentity, StoredPreKey, StoredSignedPreKey};

use crate::config::CoreConfig;
use crate::directory::DirectoryClient;
use crate::error::{CoreError, DirectoryError, Result};

/// Owns the device's long-term identity and prekey pool.
pub struct DeviceIdentityStore {
    db: Arc<Mutex<Database>>,
    directory: Arc<dyn DirectoryClient>,
    identity: Identity,
    device_id: DeviceId,
    registration_id: u32,
    prekey_batch: u32,
    prekey_low_water: u32,
}

impl DeviceIdentityStore {
    /// Load the stored identity or mint a fresh one, then try to register
    /// it with the directory.  An unreachable directory is not fatal: the
    /// identity stays marked unpublished and registration is retried by
    /// [`ensure_registered`](Self::ensure_registered).
    pub async fn initialize(
        db: Arc<Mutex<Database>>,
        directory: Arc<dyn DirectoryClient>,
        config: &CoreConfig,
    ) -> Result<Self> {
        let stored = {
            let guard = db.lock().await;
            guard.load_device_identity()?
        };

        let (identity, device_id, registration_id, published) = match stored {
            Some(stored) => {
                let identity =
                    Identity::from_secret_bytes(&stored.signing_secret, &stored.exchange_secret);
                debug!(
                    user = %identity.user_id(),
                    device = %stored.device_id,
                    "loaded existing device identity"
                );
                (
                    identity,
                    stored.device_id,
                    stored.registration_id,
                    stored.published,
                )
            }
            None => {
                let identity = Identity::generate();
                let device_id = keys::generate_device_id();
                let registration_id = keys::generate_registration_id();
                info!(
                    user = %identity.user_id(),
                    device = %device_id,
                    "generated new device identity"
                );

                let guard = db.lock().await;
                guard.save_device_identity(&StoredIdentity {
                    device_id,
                    registration_id,
                    signing_secret: identity.to_export().signing_secret,
                    exchange_secret: identity.to_export().exchange_secret,
                    next_prekey_id: 1,
                    published: false,
                    created_at: Utc::now(),
                })?;
                drop(guard);

                mint_prekeys(&db, &identity, config.prekey_batch).await?;
                (identity, device_id, registration_id, false)
            }
        };

        let store = Self {
            db,
            directory,
            identity,
            device_id,
            registration_id,
            prekey_batch: config.prekey_batch,
            prekey_low_water: config.prekey_low_water,
        };

        if !published {
            if let Err(e) = store.register().await {
                warn!(error = %e, "directory registration deferred");
            }
        }
        Ok(store)
    }

    /// Adopt an exported identity on this device, then proceed as
    /// [`initialize`](Self::initialize) would.  The device keeps its own
    /// device id and prekey pool; only the long-term secrets are shared.
    /// Seeding is entirely local, so the directory does not need to be
    /// reachable.  A store that already holds a different identity is
    /// refused.
    pub async fn initialize_from_export(
        db: Arc<Mutex<Database>>,
        directory: Arc<dyn DirectoryClient>,
        config: &CoreConfig,
        export: &IdentityExport,
    ) -> Result<Self> {
        let imported = Identity::from_export(export);
        let existing = {
            let guard = db.lock().await;
            guard.load_device_identity()?
        };

        match existing {
            Some(stored) => {
                let current =
                    Identity::from_secret_bytes(&stored.signing_secret, &stored.exchange_secret);
                if current.user_id() != imported.user_id() {
                    return Err(CoreError::IdentityConflict);
                }
            }
            None => {
                let device_id = keys::generate_device_id();
                let registration_id = keys::generate_registration_id();
                info!(
                    user = %imported.user_id(),
                    device = %device_id,
                    "imported device identity"
                );

                let guard = db.lock().await;
                guard.save_device_identity(&StoredIdentity {
                    device_id,
                    registration_id,
                    signing_secret: export.signing_secret,
                    exchange_secret: export.exchange_secret,
                    next_prekey_id: 1,
                    published: false,
                    created_at: Utc::now(),
                })?;
                drop(guard);

                mint_prekeys(&db, &imported, config.prekey_batch).await?;
            }
        }

        Self::initialize(db, directory, config).await
    }

    pub fn user_id(&self) -> UserId {
        self.identity.user_id()
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    /// Secret export for device backup.  Handle with care.
    pub fn export(&self) -> IdentityExport {
        self.identity.to_export()
    }

    /// Registration retry plus prekey pool upkeep.  Called when the
    /// connection comes back and periodically by the delivery worker.
    pub async fn ensure_registered(&self) -> Result<()> {
        let published = {
            let guard = self.db.lock().await;
            guard
                .load_device_identity()?
                .map(|s| s.published)
                .unwrap_or(false)
        };
        if !published {
            self.register().await?;
        }
        self.replenish_prekeys().await
    }

    /// Fetch the peer's published bundles, dropping any whose signed
    /// prekey signature does not verify.
    pub async fn fetch_peer_bundles(&self, user: &UserId) -> Result<Vec<PeerBundle>> {
        let bundles = self.directory.fetch_bundles(user).await?;
        let mut valid = Vec::with_capacity(bundles.len());
        for bundle in bundles {
            match keys::verify_bundle(&bundle) {
                Ok(()) => valid.push(bundle),
                Err(e) => {
                    warn!(
                        peer = %bundle.user_id,
                        device = %bundle.device_id,
                        error = %e,
                        "discarding bundle with bad prekey signature"
                    );
                }
            }
        }
        if valid.is_empty() {
            return Err(DirectoryError::NoPreKeysAvailable.into());
        }
        Ok(valid)
    }

    /// Look up the private halves a handshake references, consuming the
    /// one-time prekey if one is named.  A handshake that names an
    /// already consumed key is a replayed or forged session opener.
    pub async fn handshake_keys(
        &self,
        signed_prekey_id: u32,
        one_time_prekey_id: Option<u32>,
    ) -> Result<(PreKeyPair, Option<PreKeyPair>)> {
        let guard = self.db.lock().await;
        let signed = match guard.get_signed_prekey(signed_prekey_id) {
            Ok(stored) => PreKeyPair::from_secret_bytes(stored.id, &stored.secret),
            Err(StoreError::NotFound) => {
                return Err(SessionError::UnknownSignedPreKey(signed_prekey_id).into())
            }
            Err(other) => return Err(other.into()),
        };
        let one_time = match one_time_prekey_id {
            None => None,
            Some(id) => match guard.take_one_time_prekey(id) {
                Ok(stored) => Some(PreKeyPair::from_secret_bytes(stored.id, &stored.secret)),
                Err(StoreError::PreKeyConsumed(id)) => {
                    return Err(SessionError::PreKeyReused(id).into())
                }
                Err(StoreError::NotFound) => {
                    // Key id we never generated; treat like a reuse so the
                    // sender is forced onto a fresh bundle.
                    return Err(SessionError::PreKeyReused(id).into());
                }
                Err(other) => return Err(other.into()),
            },
        };
        Ok((signed, one_time))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn register(&self) -> Result<()> {
        let registration = self.build_registration().await?;
        let prekey_ids: Vec<u32> = registration.one_time_prekeys.iter().map(|k| k.id).collect();
        self.directory.register_device(&registration).await?;

        let guard = self.db.lock().await;
        guard.set_identity_published(true)?;
        guard.mark_prekeys_published(&prekey_ids)?;
        info!(
            device = %self.device_id,
            prekeys = prekey_ids.len(),
            "registered device with directory"
        );
        Ok(())
    }

    async fn build_registration(&self) -> Result<DeviceRegistration> {
        let guard = self.db.lock().await;
        let signed = guard
            .latest_signed_prekey()?
            .ok_or(CoreError::NoIdentity)?;
        let unpublished = guard.unpublished_prekeys()?;
        Ok(DeviceRegistration {
            user_id: self.identity.user_id(),
            device_id: self.device_id,
            registration_id: self.registration_id,
            identity_signing: self.identity.public_key_bytes(),
            identity_exchange: self.identity.exchange_public().to_bytes(),
            signed_prekey: signed_prekey_public(&signed),
            one_time_prekeys: unpublished.iter().map(one_time_public).collect(),
        })
    }

    /// Top the pool back up once it drops below the low-water mark, and
    /// push any locally minted keys the directory has not seen.
    async fn replenish_prekeys(&self) -> Result<()> {
        let low = {
            let guard = self.db.lock().await;
            guard.unconsumed_prekey_count()? < self.prekey_low_water
        };
        if low {
            let minted = mint_prekeys(&self.db, &self.identity, self.prekey_batch).await?;
            debug!(count = minted, "minted replacement one-time prekeys");
        }

        let unpublished = {
            let guard = self.db.lock().await;
            guard.unpublished_prekeys()?
        };
        if unpublished.is_empty() {
            return Ok(());
        }

        let publics: Vec<OneTimePreKeyPublic> = unpublished.iter().map(one_time_public).collect();
        self.directory
            .publish_prekeys(&self.identity.user_id(), self.device_id, &publics)
            .await?;

        let ids: Vec<u32> = unpublished.iter().map(|k| k.id).collect();
        let guard = self.db.lock().await;
        guard.mark_prekeys_published(&ids)?;
        info!(count = ids.len(), "published one-time prekeys");
        Ok(())
    }
}

/// Generate and persist a batch of one-time prekeys, creating the signed
/// prekey alongside the first batch.  Returns how many were minted.
async fn mint_prekeys(
    db: &Arc<Mutex<Database>>,
    identity: &Identity,
    batch: u32,
) -> Result<u32> {
    let mut guard = db.lock().await;

    if guard.latest_signed_prekey()?.is_none() {
        let id = guard.allocate_prekey_ids(1)?;
        let signed = keys::generate_signed_prekey(identity, id);
        guard.save_signed_prekey(&stored_signed_prekey(&signed))?;
    }

    let start = guard.allocate_prekey_ids(batch)?;
    let pairs = keys::generate_one_time_prekeys(start, batch);
    let stored: Vec<StoredPreKey> = pairs
        .iter()
        .map(|pair| StoredPreKey {
            id: pair.id,
            public: pair.public,
            secret: pair.secret_bytes(),
            consumed: false,
            published: false,
            created_at: Utc::now(),
        })
        .collect();
    guard.save_one_time_prekeys(&stored)?;
    Ok(batch)
}

fn stored_signed_prekey(signed: &SignedPreKey) -> StoredSignedPreKey {
    StoredSignedPreKey {
        id: signed.pair.id,
        public: signed.pair.public,
        secret: signed.pair.secret_bytes(),
        signature: signed.signature.to_bytes(),
        created_at: Utc::now(),
    }
}

fn signed_prekey_public(stored: &StoredSignedPreKey) -> SignedPreKeyPublic {
    SignedPreKeyPublic {
        id: stored.id,
        public: stored.public,
        signature: stored.signature.to_vec(),
    }
}

fn one_time_public(stored: &StoredPreKey) -> OneTimePreKeyPublic {
    OneTimePreKeyPublic {
        id: stored.id,
        public: stored.public,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;

    fn test_setup() -> (tempfile::TempDir, Arc<Mutex<Database>>, Arc<InMemoryDirectory>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db"), &[0u8; 32]).unwrap();
        (dir, Arc::new(Mutex::new(db)), Arc::new(InMemoryDirectory::new()))
    }

    #[tokio::test]
    async fn initialize_creates_and_registers() {
        let (_dir, db, directory) = test_setup();
        let config = CoreConfig::default();

        let store = DeviceIdentityStore::initialize(db.clone(), directory.clone(), &config)
            .await
            .unwrap();

        let stored = db.lock().await.load_device_identity().unwrap().unwrap();
        assert!(stored.published);
        assert_eq!(stored.device_id, store.device_id());
        assert_eq!(
            directory.remaining_prekeys(&store.user_id(), store.device_id()),
            config.prekey_batch as usize
        );
    }

    #[tokio::test]
    async fn initialize_survives_offline_directory() {
        let (_dir, db, directory) = test_setup();
        directory.set_unavailable(true);
        let config = CoreConfig::default();

        let store = DeviceIdentityStore::initialize(db.clone(), directory.clone(), &config)
            .await
            .unwrap();
        assert!(!db.lock().await.load_device_identity().unwrap().unwrap().published);

        directory.set_unavailable(false);
        store.ensure_registered().await.unwrap();
        assert!(db.lock().await.load_device_identity().unwrap().unwrap().published);
        assert_eq!(
            directory.remaining_prekeys(&store.user_id(), store.device_id()),
            config.prekey_batch as usize
        );
    }

    #[tokio::test]
    async fn second_initialize_reuses_identity() {
        let (_dir, db, directory) = test_setup();
        let config = CoreConfig::default();

        let first = DeviceIdentityStore::initialize(db.clone(), directory.clone(), &config)
            .await
            .unwrap();
        let second = DeviceIdentityStore::initialize(db.clone(), directory.clone(), &config)
            .await
            .unwrap();
        assert_eq!(first.user_id(), second.user_id());
        assert_eq!(first.device_id(), second.device_id());
    }

    #[tokio::test]
    async fn import_reconstructs_user_id_without_directory() {
        let (_dir, db, directory) = test_setup();
        directory.set_unavailable(true);
        let config = CoreConfig::default();

        let original = Identity::generate();
        let export = IdentityExport::from_hex(&original.to_export().to_hex()).unwrap();

        let store =
            DeviceIdentityStore::initialize_from_export(db.clone(), directory, &config, &export)
                .await
                .unwrap();
        assert_eq!(store.user_id(), original.user_id());
        assert_eq!(store.fingerprint(), original.fingerprint());

        // Seeding is local: identity row and prekey pool exist, unpublished.
        let guard = db.lock().await;
        assert!(!guard.load_device_identity().unwrap().unwrap().published);
        assert_eq!(
            guard.unconsumed_prekey_count().unwrap(),
            config.prekey_batch
        );
    }

    #[tokio::test]
    async fn import_over_existing_store_checks_identity() {
        let (_dir, db, directory) = test_setup();
        let config = CoreConfig::default();

        let first = DeviceIdentityStore::initialize(db.clone(), directory.clone(), &config)
            .await
            .unwrap();

        // Same secrets: behaves like a plain reload.
        let again = DeviceIdentityStore::initialize_from_export(
            db.clone(),
            directory.clone(),
            &config,
            &first.export(),
        )
        .await
        .unwrap();
        assert_eq!(again.device_id(), first.device_id());

        // Different secrets: refused rather than silently overwritten.
        let other = Identity::generate().to_export();
        match DeviceIdentityStore::initialize_from_export(db, directory, &config, &other)
            .await
            .err()
        {
            Some(CoreError::IdentityConflict) => {}
            other => panic!("expected IdentityConflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn replenish_tops_up_below_low_water() {
        let (_dir, db, directory) = test_setup();
        let config = CoreConfig {
            prekey_batch: 8,
            prekey_low_water: 4,
            ..CoreConfig::default()
        };

        let store = DeviceIdentityStore::initialize(db.clone(), directory.clone(), &config)
            .await
            .unwrap();

        // Consume locally until under the low-water mark.
        {
            let guard = db.lock().await;
            for id in 2..=7 {
                guard.take_one_time_prekey(id).unwrap();
            }
            assert_eq!(guard.unconsumed_prekey_count().unwrap(), 2);
        }

        store.ensure_registered().await.unwrap();
        let count = db.lock().await.unconsumed_prekey_count().unwrap();
        assert_eq!(count, 10);
        assert_eq!(
            directory.remaining_prekeys(&store.user_id(), store.device_id()),
            16
        );
    }

    #[tokio::test]
    async fn handshake_keys_consume_one_time_prekey_once() {
        let (_dir, db, directory) = test_setup();
        let store = DeviceIdentityStore::initialize(db, directory, &CoreConfig::default())
            .await
            .unwrap();

        let (signed, one_time) = store.handshake_keys(1, Some(2)).await.unwrap();
        assert_eq!(signed.id, 1);
        assert_eq!(one_time.unwrap().id, 2);

        match store.handshake_keys(1, Some(2)).await.err() {
            Some(CoreError::Session(SessionError::PreKeyReused(2))) => {}
            other => panic!("expected PreKeyReused, got {other:?}"),
        }

        match store.handshake_keys(99, None).await.err() {
            Some(CoreError::Session(SessionError::UnknownSignedPreKey(99))) => {}
            other => panic!("expected UnknownSignedPreKey, got {other:?}"),
        }
    }
}
