//! The key directory seam.
//!
//! The directory holds every device's public key bundle.  The Device
//! Identity Store is the only caller.  [`InMemoryDirectory`] backs tests
//! and also serves as the reference for what a conforming server does:
//! one-time prekeys are popped server-side, so two fetches never return
//! the same key.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use courrier_shared::keys::{DeviceRegistration, OneTimePreKeyPublic, PeerBundle};
use courrier_shared::types::{DeviceId, UserId};

use crate::error::DirectoryError;

#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Publish or refresh a device's public bundle.
    async fn register_device(&self, registration: &DeviceRegistration)
        -> Result<(), DirectoryError>;

    /// Upload additional one-time prekeys for an already registered device.
    async fn publish_prekeys(
        &self,
        user: &UserId,
        device: DeviceId,
        prekeys: &[OneTimePreKeyPublic],
    ) -> Result<(), DirectoryError>;

    /// Fetch one bundle per registered device of `user`, each with at most
    /// one one-time prekey claimed from that device's pool.
    async fn fetch_bundles(&self, user: &UserId) -> Result<Vec<PeerBundle>, DirectoryError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct DirectoryRecord {
    registration: DeviceRegistration,
    pool: VecDeque<OneTimePreKeyPublic>,
}

/// Process-local directory, shared between clients in tests via `Arc`.
#[derive(Default)]
pub struct InMemoryDirectory {
    records: Mutex<HashMap<UserId, HashMap<DeviceId, DirectoryRecord>>>,
    unavailable: AtomicBool,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the directory being unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Unclaimed one-time prekeys left for one device.
    pub fn remaining_prekeys(&self, user: &UserId, device: DeviceId) -> usize {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .get(user)
            .and_then(|devices| devices.get(&device))
            .map(|r| r.pool.len())
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), DirectoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(DirectoryError::Unavailable("directory offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DirectoryClient for InMemoryDirectory {
    async fn register_device(
        &self,
        registration: &DeviceRegistration,
    ) -> Result<(), DirectoryError> {
        self.check_available()?;
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.entry(registration.user_id).or_default().insert(
            registration.device_id,
            DirectoryRecord {
                registration: registration.clone(),
                pool: registration.one_time_prekeys.iter().copied().collect(),
            },
        );
        Ok(())
    }

    async fn publish_prekeys(
        &self,
        user: &UserId,
        device: DeviceId,
        prekeys: &[OneTimePreKeyPublic],
    ) -> Result<(), DirectoryError> {
        self.check_available()?;
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records
            .get_mut(user)
            .and_then(|devices| devices.get_mut(&device))
            .ok_or(DirectoryError::NoDevicesRegistered)?;
        record.pool.extend(prekeys.iter().copied());
        Ok(())
    }

    async fn fetch_bundles(&self, user: &UserId) -> Result<Vec<PeerBundle>, DirectoryError> {
        self.check_available()?;
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let devices = records
            .get_mut(user)
            .filter(|d| !d.is_empty())
            .ok_or(DirectoryError::NoDevicesRegistered)?;

        let mut bundles = Vec::with_capacity(devices.len());
        for record in devices.values_mut() {
            let reg = &record.registration;
            bundles.push(PeerBundle {
                user_id: reg.user_id,
                device_id: reg.device_id,
                registration_id: reg.registration_id,
                identity_signing: reg.identity_signing,
                identity_exchange: reg.identity_exchange,
                signed_prekey: reg.signed_prekey.clone(),
                one_time_prekey: record.pool.pop_front(),
            });
        }
        Ok(bundles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courrier_shared::identity::Identity;
    use courrier_shared::keys;

    fn registration(identity: &Identity, device: DeviceId, prekeys: u32) -> DeviceRegistration {
        let signed = keys::generate_signed_prekey(identity, 1);
        DeviceRegistration {
            user_id: identity.user_id(),
            device_id: device,
            registration_id: keys::generate_registration_id(),
            identity_signing: identity.public_key_bytes(),
            identity_exchange: identity.exchange_public().to_bytes(),
            signed_prekey: signed.public_part(),
            one_time_prekeys: keys::generate_one_time_prekeys(10, prekeys)
                .iter()
                .map(|p| OneTimePreKeyPublic {
                    id: p.id,
                    public: p.public,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn unknown_user_has_no_devices() {
        let directory = InMemoryDirectory::new();
        let result = directory.fetch_bundles(&UserId([1u8; 32])).await;
        assert!(matches!(result, Err(DirectoryError::NoDevicesRegistered)));
    }

    #[tokio::test]
    async fn prekeys_are_claimed_exactly_once() {
        let directory = InMemoryDirectory::new();
        let identity = Identity::generate();
        directory
            .register_device(&registration(&identity, DeviceId(1), 2))
            .await
            .unwrap();

        let first = directory.fetch_bundles(&identity.user_id()).await.unwrap();
        let second = directory.fetch_bundles(&identity.user_id()).await.unwrap();
        let third = directory.fetch_bundles(&identity.user_id()).await.unwrap();

        let a = first[0].one_time_prekey.unwrap();
        let b = second[0].one_time_prekey.unwrap();
        assert_ne!(a.id, b.id);
        // pool exhausted: bundle still served, without a one-time key
        assert!(third[0].one_time_prekey.is_none());
    }

    #[tokio::test]
    async fn replenished_keys_join_the_pool() {
        let directory = InMemoryDirectory::new();
        let identity = Identity::generate();
        directory
            .register_device(&registration(&identity, DeviceId(1), 0))
            .await
            .unwrap();
        assert_eq!(directory.remaining_prekeys(&identity.user_id(), DeviceId(1)), 0);

        directory
            .publish_prekeys(
                &identity.user_id(),
                DeviceId(1),
                &[OneTimePreKeyPublic {
                    id: 50,
                    public: [9u8; 32],
                }],
            )
            .await
            .unwrap();

        let bundles = directory.fetch_bundles(&identity.user_id()).await.unwrap();
        assert_eq!(bundles[0].one_time_prekey.unwrap().id, 50);
    }

    #[tokio::test]
    async fn unavailable_directory_errors() {
        let directory = InMemoryDirectory::new();
        directory.set_unavailable(true);
        let identity = Identity::generate();
        let result = directory
            .register_device(&registration(&identity, DeviceId(1), 1))
            .await;
        assert!(matches!(result, Err(DirectoryError::Unavailable(_))));
    }
}
