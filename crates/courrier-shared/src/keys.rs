//! Pre-key material and session establishment.
//!
//! Devices publish a signed pre-key plus a batch of one-time pre-keys to the
//! directory.  A sender combines its identity key, a fresh ephemeral key and
//! the peer's published keys into a shared session seed; the receiver derives
//! the same seed from the handshake carried alongside the first ciphertext.

use ed25519_dalek::{Signature, VerifyingKey};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::KDF_CONTEXT_SESSION_ROOT;
use crate::crypto::kdf;
use crate::error::CryptoError;
use crate::identity::Identity;
use crate::types::{DeviceId, UserId};

/// An X25519 keypair with a device-local identifier.
#[derive(Clone)]
pub struct PreKeyPair {
    pub id: u32,
    secret: StaticSecret,
    pub public: [u8; 32],
}

impl PreKeyPair {
    pub fn generate(id: u32) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        Self { id, secret, public }
    }

    pub fn from_secret_bytes(id: u32, secret: &[u8; 32]) -> Self {
        let secret = StaticSecret::from(*secret);
        let public = PublicKey::from(&secret).to_bytes();
        Self { id, secret, public }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

/// A medium-term pre-key whose public half is signed by the identity key.
#[derive(Clone)]
pub struct SignedPreKey {
    pub pair: PreKeyPair,
    pub signature: Signature,
}

impl SignedPreKey {
    pub fn public_part(&self) -> SignedPreKeyPublic {
        SignedPreKeyPublic {
            id: self.pair.id,
            public: self.pair.public,
            signature: self.signature.to_bytes().to_vec(),
        }
    }
}

// ---------------------------------------------------------------------------
// Public projections (what leaves the device)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedPreKeyPublic {
    pub id: u32,
    pub public: [u8; 32],
    /// Ed25519 signature over `public` (64 bytes, length-checked on verify).
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OneTimePreKeyPublic {
    pub id: u32,
    pub public: [u8; 32],
}

/// The public projection a device registers with the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub registration_id: u32,
    pub identity_signing: [u8; 32],
    pub identity_exchange: [u8; 32],
    pub signed_prekey: SignedPreKeyPublic,
    pub one_time_prekeys: Vec<OneTimePreKeyPublic>,
}

/// One peer device's published keys, with at most one claimed one-time
/// pre-key attached.  This is everything a sender needs to open a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerBundle {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub registration_id: u32,
    pub identity_signing: [u8; 32],
    pub identity_exchange: [u8; 32],
    pub signed_prekey: SignedPreKeyPublic,
    pub one_time_prekey: Option<OneTimePreKeyPublic>,
}

/// Session-establishment data carried alongside the first ciphertexts,
/// until the sender has proof the peer derived the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Handshake {
    pub initiator_signing: [u8; 32],
    pub initiator_exchange: [u8; 32],
    pub ephemeral: [u8; 32],
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
}

/// The shared secret both sides derive; everything else in the session
/// (chain keys, message keys) is derived from this.
pub struct SessionSeed {
    pub root_key: [u8; 32],
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

pub fn generate_signed_prekey(identity: &Identity, id: u32) -> SignedPreKey {
    let pair = PreKeyPair::generate(id);
    let signature = identity.sign(&pair.public);
    SignedPreKey { pair, signature }
}

pub fn generate_one_time_prekeys(start_id: u32, count: u32) -> Vec<PreKeyPair> {
    (0..count)
        .map(|i| PreKeyPair::generate(start_id + i))
        .collect()
}

/// Random 14-bit registration id, never zero.
pub fn generate_registration_id() -> u32 {
    OsRng.gen_range(1..=0x3FFF)
}

/// Random device id, never zero.
pub fn generate_device_id() -> DeviceId {
    DeviceId(OsRng.gen_range(1..=0xFFFF))
}

// ---------------------------------------------------------------------------
// Agreement
// ---------------------------------------------------------------------------

/// Check that the bundle's signed pre-key really was signed by the
/// identity key it claims to belong to.
pub fn verify_bundle(bundle: &PeerBundle) -> Result<(), CryptoError> {
    let verifying = VerifyingKey::from_bytes(&bundle.identity_signing)
        .map_err(|_| CryptoError::InvalidKeyLength)?;
    let sig_bytes: [u8; 64] = bundle
        .signed_prekey
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    let sig = Signature::from_bytes(&sig_bytes);
    verifying
        .verify_strict(&bundle.signed_prekey.public, &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Initiator side: derive the session seed from the peer's bundle and a
/// fresh ephemeral key.  Consumes the bundle's one-time pre-key if present.
pub fn initiate(
    identity: &Identity,
    bundle: &PeerBundle,
) -> Result<(SessionSeed, Handshake), CryptoError> {
    verify_bundle(bundle)?;

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();

    let spk = PublicKey::from(bundle.signed_prekey.public);
    let peer_identity = PublicKey::from(bundle.identity_exchange);

    let dh1 = identity.exchange_secret().diffie_hellman(&spk);
    let dh2 = ephemeral.diffie_hellman(&peer_identity);
    let dh3 = ephemeral.diffie_hellman(&spk);
    let dh4 = bundle
        .one_time_prekey
        .as_ref()
        .map(|opk| ephemeral.diffie_hellman(&PublicKey::from(opk.public)));

    let initiator_exchange = identity.exchange_public().to_bytes();
    let root_key = derive_root(
        dh1.as_bytes(),
        dh2.as_bytes(),
        dh3.as_bytes(),
        dh4.as_ref().map(|d| *d.as_bytes()),
        &initiator_exchange,
        &bundle.identity_exchange,
    );

    let handshake = Handshake {
        initiator_signing: identity.public_key_bytes(),
        initiator_exchange,
        ephemeral: ephemeral_public,
        signed_prekey_id: bundle.signed_prekey.id,
        one_time_prekey_id: bundle.one_time_prekey.as_ref().map(|opk| opk.id),
    };

    Ok((SessionSeed { root_key }, handshake))
}

/// Responder side: mirror the initiator's DH set using our private keys
/// and the handshake's public ones.
pub fn respond(
    identity: &Identity,
    signed_prekey: &PreKeyPair,
    one_time_prekey: Option<&PreKeyPair>,
    handshake: &Handshake,
) -> SessionSeed {
    let initiator_identity = PublicKey::from(handshake.initiator_exchange);
    let ephemeral = PublicKey::from(handshake.ephemeral);

    let dh1 = signed_prekey.secret.diffie_hellman(&initiator_identity);
    let dh2 = identity.exchange_secret().diffie_hellman(&ephemeral);
    let dh3 = signed_prekey.secret.diffie_hellman(&ephemeral);
    let dh4 = one_time_prekey.map(|opk| opk.secret.diffie_hellman(&ephemeral));

    let root_key = derive_root(
        dh1.as_bytes(),
        dh2.as_bytes(),
        dh3.as_bytes(),
        dh4.as_ref().map(|d| *d.as_bytes()),
        &handshake.initiator_exchange,
        &identity.exchange_public().to_bytes(),
    );

    SessionSeed { root_key }
}

/// Stable identifier for a handshake, used to tell a retransmission of the
/// session-opening message apart from a genuine re-establishment.
pub fn handshake_id(handshake: &Handshake) -> [u8; 32] {
    kdf(
        crate::constants::KDF_CONTEXT_HANDSHAKE_ID,
        &[
            &handshake.initiator_exchange,
            &handshake.ephemeral,
            &handshake.signed_prekey_id.to_be_bytes(),
            &handshake
                .one_time_prekey_id
                .unwrap_or_default()
                .to_be_bytes(),
        ],
    )
}

fn derive_root(
    dh1: &[u8],
    dh2: &[u8],
    dh3: &[u8],
    dh4: Option<[u8; 32]>,
    initiator_exchange: &[u8; 32],
    responder_exchange: &[u8; 32],
) -> [u8; 32] {
    let dh4_bytes = dh4.unwrap_or_default();
    let dh4_slice: &[u8] = if dh4.is_some() { &dh4_bytes } else { &[] };
    kdf(
        KDF_CONTEXT_SESSION_ROOT,
        &[dh1, dh2, dh3, dh4_slice, initiator_exchange, responder_exchange],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_for(
        identity: &Identity,
        signed: &SignedPreKey,
        one_time: Option<&PreKeyPair>,
    ) -> PeerBundle {
        PeerBundle {
            user_id: identity.user_id(),
            device_id: DeviceId(1),
            registration_id: generate_registration_id(),
            identity_signing: identity.public_key_bytes(),
            identity_exchange: identity.exchange_public().to_bytes(),
            signed_prekey: signed.public_part(),
            one_time_prekey: one_time.map(|opk| OneTimePreKeyPublic {
                id: opk.id,
                public: opk.public,
            }),
        }
    }

    #[test]
    fn test_both_sides_derive_same_root() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let bob_spk = generate_signed_prekey(&bob, 1);
        let bob_opk = PreKeyPair::generate(10);

        let bundle = bundle_for(&bob, &bob_spk, Some(&bob_opk));
        let (seed_a, handshake) = initiate(&alice, &bundle).unwrap();
        let seed_b = respond(&bob, &bob_spk.pair, Some(&bob_opk), &handshake);

        assert_eq!(seed_a.root_key, seed_b.root_key);
        assert_eq!(handshake.one_time_prekey_id, Some(10));
    }

    #[test]
    fn test_agreement_without_one_time_prekey() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let bob_spk = generate_signed_prekey(&bob, 1);

        let bundle = bundle_for(&bob, &bob_spk, None);
        let (seed_a, handshake) = initiate(&alice, &bundle).unwrap();
        let seed_b = respond(&bob, &bob_spk.pair, None, &handshake);

        assert_eq!(seed_a.root_key, seed_b.root_key);
        assert!(handshake.one_time_prekey_id.is_none());
    }

    #[test]
    fn test_tampered_prekey_signature_rejected() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let bob_spk = generate_signed_prekey(&bob, 1);

        let mut bundle = bundle_for(&bob, &bob_spk, None);
        bundle.signed_prekey.signature[0] ^= 0xFF;

        assert!(initiate(&alice, &bundle).is_err());
    }

    #[test]
    fn test_prekey_signed_by_someone_else_rejected() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mallory = Identity::generate();
        let forged_spk = generate_signed_prekey(&mallory, 1);

        let mut bundle = bundle_for(&bob, &forged_spk, None);
        // identity claims to be Bob, pre-key signed by Mallory
        bundle.identity_signing = bob.public_key_bytes();

        assert!(initiate(&alice, &bundle).is_err());
    }

    #[test]
    fn test_distinct_ephemerals_give_distinct_roots() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let bob_spk = generate_signed_prekey(&bob, 1);
        let bundle = bundle_for(&bob, &bob_spk, None);

        let (seed1, _) = initiate(&alice, &bundle).unwrap();
        let (seed2, _) = initiate(&alice, &bundle).unwrap();
        assert_ne!(seed1.root_key, seed2.root_key);
    }

    #[test]
    fn test_handshake_id_distinguishes_establishments() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let bob_spk = generate_signed_prekey(&bob, 1);
        let bundle = bundle_for(&bob, &bob_spk, None);

        let (_, h1) = initiate(&alice, &bundle).unwrap();
        let (_, h2) = initiate(&alice, &bundle).unwrap();

        assert_eq!(handshake_id(&h1), handshake_id(&h1));
        assert_ne!(handshake_id(&h1), handshake_id(&h2));
    }

    #[test]
    fn test_prekey_ids_allocated_sequentially() {
        let batch = generate_one_time_prekeys(50, 4);
        let ids: Vec<u32> = batch.iter().map(|k| k.id).collect();
        assert_eq!(ids, vec![50, 51, 52, 53]);
    }
}
