//! Per-peer-device session management on top of the ratchet.
//!
//! One [`SessionSlot`] per (peer user, peer device) pair serializes all
//! ratchet operations for that device while leaving independent peers
//! free to run concurrently.  State is persisted after every successful
//! seal or open; a crash between seal and send loses the message, never
//! a key.
//!
//! Lock order is always slot, then database.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use courrier_shared::keys::{self, Handshake};
use courrier_shared::ratchet::{EncryptedEnvelope, SessionState};
use courrier_shared::types::{DeviceId, MessageId, UserId};
use courrier_shared::SessionError;
use courrier_store::Database;

use crate::error::Result;
use crate::identity::DeviceIdentityStore;

/// What a successful decrypt tells the caller beyond the plaintext.
pub struct InboundPlaintext {
    pub plaintext: Vec<u8>,
    /// A fresh responder session was installed for this device.  Worth
    /// re-attempting any ciphertexts parked as undecryptable.
    pub session_rebuilt: bool,
}

#[derive(Default)]
struct SessionSlot {
    state: Option<SessionState>,
    loaded: bool,
}

/// Ratchet sessions for every peer device, backed by the store.
pub struct SessionCipher {
    db: Arc<Mutex<Database>>,
    identity: Arc<DeviceIdentityStore>,
    slots: Mutex<HashMap<(UserId, DeviceId), Arc<Mutex<SessionSlot>>>>,
}

/// Binds a ciphertext to its routing so an envelope replayed under a
/// different sender, device or message id fails authentication.
pub fn frame_aad(
    sender: &UserId,
    sender_device: DeviceId,
    recipient: &UserId,
    recipient_device: DeviceId,
    message_id: &MessageId,
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(32 + 4 + 32 + 4 + 16);
    aad.extend_from_slice(&sender.0);
    aad.extend_from_slice(&sender_device.0.to_be_bytes());
    aad.extend_from_slice(&recipient.0);
    aad.extend_from_slice(&recipient_device.0.to_be_bytes());
    aad.extend_from_slice(message_id.0.as_bytes());
    aad
}

impl SessionCipher {
    pub fn new(db: Arc<Mutex<Database>>, identity: Arc<DeviceIdentityStore>) -> Self {
        Self {
            db,
            identity,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// The peer devices we can encrypt to, establishing sessions first if
    /// none exist yet.  Fetching bundles consumes one one-time prekey per
    /// peer device, so established sessions are always preferred.
    pub async fn sessions_for_peer(&self, peer: &UserId) -> Result<Vec<DeviceId>> {
        let existing: Vec<DeviceId> = {
            let guard = self.db.lock().await;
            guard
                .list_sessions()?
                .into_iter()
                .filter(|record| record.peer == *peer)
                .map(|record| record.peer_device)
                .collect()
        };
        if !existing.is_empty() {
            return Ok(existing);
        }

        let bundles = self.identity.fetch_peer_bundles(peer).await?;
        let mut devices = Vec::with_capacity(bundles.len());
        for bundle in bundles {
            let device = bundle.device_id;
            let (seed, handshake) = keys::initiate(self.identity.identity(), &bundle)?;
            let state = SessionState::initiate(&seed, handshake);

            let slot = self.slot(peer, device).await;
            let mut slot = slot.lock().await;
            self.persist(peer, device, &state).await?;
            slot.state = Some(state);
            slot.loaded = true;
            devices.push(device);
            info!(peer = %peer, device = %device, "established outbound session");
        }
        Ok(devices)
    }

    pub async fn has_session(&self, peer: &UserId, device: DeviceId) -> Result<bool> {
        let slot = self.slot(peer, device).await;
        let mut slot = slot.lock().await;
        self.ensure_loaded(peer, device, &mut slot).await?;
        Ok(slot.state.is_some())
    }

    /// Encrypt one payload for one peer device.  Fails with
    /// [`SessionError::NoSession`] when no session exists; callers
    /// establish via [`sessions_for_peer`](Self::sessions_for_peer) first.
    pub async fn encrypt_for_device(
        &self,
        peer: &UserId,
        device: DeviceId,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<EncryptedEnvelope> {
        let slot = self.slot(peer, device).await;
        let mut slot = slot.lock().await;
        self.ensure_loaded(peer, device, &mut slot).await?;

        let state = slot.state.as_mut().ok_or(SessionError::NoSession)?;
        let envelope = state.seal(plaintext, aad)?;
        // Persist before the envelope can leave: losing one message beats
        // reusing a chain position.
        self.persist(peer, device, state).await?;
        Ok(envelope)
    }

    /// Decrypt one envelope from one peer device, installing a responder
    /// session when the envelope carries a handshake we do not hold.
    pub async fn decrypt_from_device(
        &self,
        peer: &UserId,
        device: DeviceId,
        envelope: &EncryptedEnvelope,
        aad: &[u8],
    ) -> Result<InboundPlaintext> {
        let slot = self.slot(peer, device).await;
        let mut slot = slot.lock().await;
        self.ensure_loaded(peer, device, &mut slot).await?;

        if let Some(handshake) = &envelope.handshake {
            let known = slot
                .state
                .as_ref()
                .map(|s| s.matches_handshake(handshake))
                .unwrap_or(false);
            if !known {
                return self
                    .respond_and_open(peer, device, &mut slot, handshake, envelope, aad)
                    .await;
            }
        }

        let state = slot.state.as_mut().ok_or(SessionError::NoSession)?;
        let plaintext = state.open(envelope, aad)?;
        self.persist(peer, device, state).await?;
        Ok(InboundPlaintext {
            plaintext,
            session_rebuilt: false,
        })
    }

    /// Drop the session for one peer device, in memory and in the store.
    pub async fn tear_down(&self, peer: &UserId, device: DeviceId) -> Result<()> {
        let slot = self.slot(peer, device).await;
        let mut slot = slot.lock().await;
        slot.state = None;
        slot.loaded = true;
        let guard = self.db.lock().await;
        guard.delete_session(peer, device)?;
        info!(peer = %peer, device = %device, "session torn down");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn slot(&self, peer: &UserId, device: DeviceId) -> Arc<Mutex<SessionSlot>> {
        let mut slots = self.slots.lock().await;
        slots
            .entry((*peer, device))
            .or_insert_with(|| Arc::new(Mutex::new(SessionSlot::default())))
            .clone()
    }

    async fn ensure_loaded(
        &self,
        peer: &UserId,
        device: DeviceId,
        slot: &mut SessionSlot,
    ) -> Result<()> {
        if slot.loaded {
            return Ok(());
        }
        let record = {
            let guard = self.db.lock().await;
            guard.load_session(peer, device)?
        };
        slot.state = match record {
            Some(record) => match SessionState::from_bytes(&record.state) {
                Ok(state) => Some(state),
                Err(e) => {
                    // Corrupt state is unrecoverable; drop it and let the
                    // next handshake rebuild.
                    warn!(peer = %peer, device = %device, error = %e, "discarding corrupt session state");
                    let guard = self.db.lock().await;
                    guard.delete_session(peer, device)?;
                    None
                }
            },
            None => None,
        };
        slot.loaded = true;
        Ok(())
    }

    async fn persist(&self, peer: &UserId, device: DeviceId, state: &SessionState) -> Result<()> {
        let bytes = state.to_bytes()?;
        let guard = self.db.lock().await;
        guard.save_session(peer, device, &bytes)?;
        Ok(())
    }

    /// Build the responder side for an unknown handshake and try the
    /// envelope against it.  The old session (if any) is replaced only
    /// when the new one actually opens the envelope.
    async fn respond_and_open(
        &self,
        peer: &UserId,
        device: DeviceId,
        slot: &mut SessionSlot,
        handshake: &Handshake,
        envelope: &EncryptedEnvelope,
        aad: &[u8],
    ) -> Result<InboundPlaintext> {
        let (signed, one_time) = self
            .identity
            .handshake_keys(handshake.signed_prekey_id, handshake.one_time_prekey_id)
            .await?;
        let seed = keys::respond(
            self.identity.identity(),
            &signed,
            one_time.as_ref(),
            handshake,
        );
        let mut state = SessionState::respond(&seed, handshake);
        let plaintext = state.open(envelope, aad)?;

        let replaced = slot.state.is_some();
        if replaced {
            debug!(peer = %peer, device = %device, "peer re-established, replacing session");
        }
        self.persist(peer, device, &state).await?;
        slot.state = Some(state);
        slot.loaded = true;
        Ok(InboundPlaintext {
            plaintext,
            session_rebuilt: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::directory::InMemoryDirectory;
    use crate::error::CoreError;

    struct Device {
        _dir: tempfile::TempDir,
        identity: Arc<DeviceIdentityStore>,
        cipher: SessionCipher,
    }

    async fn device(directory: &Arc<InMemoryDirectory>) -> Device {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Mutex::new(
            Database::open_at(&dir.path().join("test.db"), &[0u8; 32]).unwrap(),
        ));
        let identity = Arc::new(
            DeviceIdentityStore::initialize(
                db.clone(),
                directory.clone() as Arc<dyn crate::directory::DirectoryClient>,
                &CoreConfig::default(),
            )
            .await
            .unwrap(),
        );
        Device {
            _dir: dir,
            cipher: SessionCipher::new(db, identity.clone()),
            identity,
        }
    }

    #[tokio::test]
    async fn establish_encrypt_decrypt_roundtrip() {
        let directory = Arc::new(InMemoryDirectory::new());
        let alice = device(&directory).await;
        let bob = device(&directory).await;

        let devices = alice
            .cipher
            .sessions_for_peer(&bob.identity.user_id())
            .await
            .unwrap();
        assert_eq!(devices, vec![bob.identity.device_id()]);

        let message_id = MessageId::new();
        let aad = frame_aad(
            &alice.identity.user_id(),
            alice.identity.device_id(),
            &bob.identity.user_id(),
            bob.identity.device_id(),
            &message_id,
        );
        let envelope = alice
            .cipher
            .encrypt_for_device(&bob.identity.user_id(), devices[0], b"salut", &aad)
            .await
            .unwrap();
        assert!(envelope.handshake.is_some());

        let inbound = bob
            .cipher
            .decrypt_from_device(
                &alice.identity.user_id(),
                alice.identity.device_id(),
                &envelope,
                &aad,
            )
            .await
            .unwrap();
        assert_eq!(inbound.plaintext, b"salut");
        assert!(inbound.session_rebuilt);

        // The responder now holds a session and no longer needs handshakes.
        assert!(bob
            .cipher
            .has_session(&alice.identity.user_id(), alice.identity.device_id())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn encrypt_without_session_refuses() {
        let directory = Arc::new(InMemoryDirectory::new());
        let alice = device(&directory).await;
        let bob = device(&directory).await;

        let err = alice
            .cipher
            .encrypt_for_device(&bob.identity.user_id(), bob.identity.device_id(), b"x", b"")
            .await
            .err();
        assert!(matches!(
            err,
            Some(CoreError::Session(SessionError::NoSession))
        ));
    }

    #[tokio::test]
    async fn replayed_handshake_consumes_prekey_once() {
        let directory = Arc::new(InMemoryDirectory::new());
        let alice = device(&directory).await;
        let bob = device(&directory).await;

        let devices = alice
            .cipher
            .sessions_for_peer(&bob.identity.user_id())
            .await
            .unwrap();
        let e0 = alice
            .cipher
            .encrypt_for_device(&bob.identity.user_id(), devices[0], b"first", b"")
            .await
            .unwrap();
        let e1 = alice
            .cipher
            .encrypt_for_device(&bob.identity.user_id(), devices[0], b"second", b"")
            .await
            .unwrap();
        // Handshake echoes until the first inbound message.
        assert!(e1.handshake.is_some());

        let alice_id = alice.identity.user_id();
        let alice_dev = alice.identity.device_id();
        assert_eq!(
            bob.cipher
                .decrypt_from_device(&alice_id, alice_dev, &e0, b"")
                .await
                .unwrap()
                .plaintext,
            b"first"
        );
        // Same handshake again: matches the session we built, so the
        // one-time prekey is not taken a second time.
        assert_eq!(
            bob.cipher
                .decrypt_from_device(&alice_id, alice_dev, &e1, b"")
                .await
                .unwrap()
                .plaintext,
            b"second"
        );
    }

    #[tokio::test]
    async fn sessions_survive_reload() {
        let directory = Arc::new(InMemoryDirectory::new());
        let alice = device(&directory).await;
        let bob = device(&directory).await;

        let devices = alice
            .cipher
            .sessions_for_peer(&bob.identity.user_id())
            .await
            .unwrap();
        let e0 = alice
            .cipher
            .encrypt_for_device(&bob.identity.user_id(), devices[0], b"before", b"")
            .await
            .unwrap();
        bob.cipher
            .decrypt_from_device(&alice.identity.user_id(), alice.identity.device_id(), &e0, b"")
            .await
            .unwrap();

        // Fresh cipher over the same store: state comes back from disk.
        let bob_cipher = SessionCipher::new(bob.cipher.db.clone(), bob.identity.clone());
        let e1 = alice
            .cipher
            .encrypt_for_device(&bob.identity.user_id(), devices[0], b"after", b"")
            .await
            .unwrap();
        let inbound = bob_cipher
            .decrypt_from_device(&alice.identity.user_id(), alice.identity.device_id(), &e1, b"")
            .await
            .unwrap();
        assert_eq!(inbound.plaintext, b"after");
        assert!(!inbound.session_rebuilt);
    }

    #[tokio::test]
    async fn wrong_aad_is_rejected_without_advancing() {
        let directory = Arc::new(InMemoryDirectory::new());
        let alice = device(&directory).await;
        let bob = device(&directory).await;

        let devices = alice
            .cipher
            .sessions_for_peer(&bob.identity.user_id())
            .await
            .unwrap();
        let envelope = alice
            .cipher
            .encrypt_for_device(&bob.identity.user_id(), devices[0], b"bound", b"route-a")
            .await
            .unwrap();

        let alice_id = alice.identity.user_id();
        let alice_dev = alice.identity.device_id();
        assert!(bob
            .cipher
            .decrypt_from_device(&alice_id, alice_dev, &envelope, b"route-b")
            .await
            .is_err());
        assert_eq!(
            bob.cipher
                .decrypt_from_device(&alice_id, alice_dev, &envelope, b"route-a")
                .await
                .unwrap()
                .plaintext,
            b"bound"
        );
    }
}
