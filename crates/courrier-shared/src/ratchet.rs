//! Per-session key ratchet.
//!
//! Each session runs two KDF chains derived from the shared seed: the
//! initiator's sending chain is the responder's receiving chain and vice
//! versa.  Every message consumes one chain step, so old message keys are
//! unrecoverable once the chain has advanced past them.  Keys for messages
//! that arrive out of order are parked in a bounded cache and each can be
//! used exactly once.
//!
//! State mutates only after a successful seal or open; a failed decrypt
//! leaves the session exactly as it was, so the same ciphertext can be
//! retried after a session rebuild.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{
    KDF_CONTEXT_CHAIN_INIT, KDF_CONTEXT_CHAIN_STEP, KDF_CONTEXT_MESSAGE_KEY,
    MAX_SKIPPED_MESSAGE_KEYS,
};
use crate::crypto::{self, kdf, SymmetricKey};
use crate::error::SessionError;
use crate::keys::{self, Handshake, SessionSeed};

/// Which side of the handshake this device was on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Responder,
}

impl SessionRole {
    fn send_label(self) -> &'static [u8] {
        match self {
            SessionRole::Initiator => b"initiator",
            SessionRole::Responder => b"responder",
        }
    }

    fn recv_label(self) -> &'static [u8] {
        match self {
            SessionRole::Initiator => b"responder",
            SessionRole::Responder => b"initiator",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChainState {
    key: SymmetricKey,
    /// Index of the next message on this chain.
    counter: u64,
}

impl ChainState {
    fn new(root_key: &[u8; 32], label: &[u8]) -> Self {
        Self {
            key: kdf(KDF_CONTEXT_CHAIN_INIT, &[root_key, label]),
            counter: 0,
        }
    }

    fn message_key(&self) -> SymmetricKey {
        kdf(KDF_CONTEXT_MESSAGE_KEY, &[&self.key])
    }

    fn advance(&mut self) {
        self.key = kdf(KDF_CONTEXT_CHAIN_STEP, &[&self.key]);
        self.counter += 1;
    }
}

/// The ciphertext unit a session produces, carried inside a wire frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Present until the sender has proof the peer derived the session.
    pub handshake: Option<Handshake>,
    pub counter: u64,
    pub ciphertext: Vec<u8>,
}

/// Durable ratchet state for one (peer user, peer device) pair.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    role: SessionRole,
    handshake_id: [u8; 32],
    send: ChainState,
    recv: ChainState,
    skipped: BTreeMap<u64, SymmetricKey>,
    pending_handshake: Option<Handshake>,
    pub established_at: DateTime<Utc>,
}

impl SessionState {
    /// Build the initiator-side session.  The handshake is echoed on every
    /// outgoing envelope until an inbound message proves the peer holds
    /// the session.
    pub fn initiate(seed: &SessionSeed, handshake: Handshake) -> Self {
        let role = SessionRole::Initiator;
        Self {
            role,
            handshake_id: keys::handshake_id(&handshake),
            send: ChainState::new(&seed.root_key, role.send_label()),
            recv: ChainState::new(&seed.root_key, role.recv_label()),
            skipped: BTreeMap::new(),
            pending_handshake: Some(handshake),
            established_at: Utc::now(),
        }
    }

    /// Build the responder-side session from a received handshake.
    pub fn respond(seed: &SessionSeed, handshake: &Handshake) -> Self {
        let role = SessionRole::Responder;
        Self {
            role,
            handshake_id: keys::handshake_id(handshake),
            send: ChainState::new(&seed.root_key, role.send_label()),
            recv: ChainState::new(&seed.root_key, role.recv_label()),
            skipped: BTreeMap::new(),
            pending_handshake: None,
            established_at: Utc::now(),
        }
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// True if `handshake` is the same establishment this session came from
    /// (a retransmission), false if the peer re-established.
    pub fn matches_handshake(&self, handshake: &Handshake) -> bool {
        self.handshake_id == keys::handshake_id(handshake)
    }

    /// Encrypt one message, advancing the sending chain.
    pub fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<EncryptedEnvelope, SessionError> {
        let counter = self.send.counter;
        let message_key = self.send.message_key();
        let ciphertext = crypto::encrypt_with_aad(&message_key, plaintext, &bind(aad, counter))
            .map_err(|_| SessionError::Corrupted("encryption failed".into()))?;
        self.send.advance();
        Ok(EncryptedEnvelope {
            handshake: self.pending_handshake.clone(),
            counter,
            ciphertext,
        })
    }

    /// Decrypt one envelope.  Handles out-of-order arrival by parking
    /// skipped message keys; a cached key decrypts its counter exactly once.
    /// On any failure the session state is left untouched.
    pub fn open(&mut self, envelope: &EncryptedEnvelope, aad: &[u8]) -> Result<Vec<u8>, SessionError> {
        let counter = envelope.counter;
        let aad_bound = bind(aad, counter);

        if counter < self.recv.counter {
            // Late arrival: only a parked key can open it.
            let Some(message_key) = self.skipped.get(&counter).copied() else {
                return Err(SessionError::StaleCounter(counter));
            };
            let plaintext = crypto::decrypt_with_aad(&message_key, &envelope.ciphertext, &aad_bound)
                .map_err(|_| SessionError::DecryptFailed(counter))?;
            self.skipped.remove(&counter);
            self.pending_handshake = None;
            return Ok(plaintext);
        }

        let gap = counter - self.recv.counter;
        let cached = self.skipped.len() as u64;
        if cached + gap > MAX_SKIPPED_MESSAGE_KEYS {
            return Err(SessionError::TooManySkipped {
                counter,
                skipped: cached + gap,
                limit: MAX_SKIPPED_MESSAGE_KEYS,
            });
        }

        // Walk the chain forward on a scratch copy; commit only on success.
        let mut chain = self.recv.clone();
        let mut parked: Vec<(u64, SymmetricKey)> = Vec::new();
        while chain.counter < counter {
            parked.push((chain.counter, chain.message_key()));
            chain.advance();
        }
        let message_key = chain.message_key();
        let plaintext = crypto::decrypt_with_aad(&message_key, &envelope.ciphertext, &aad_bound)
            .map_err(|_| SessionError::DecryptFailed(counter))?;
        chain.advance();

        self.skipped.extend(parked);
        self.recv = chain;
        self.pending_handshake = None;
        Ok(plaintext)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SessionError> {
        bincode::serialize(self).map_err(|e| SessionError::Corrupted(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, SessionError> {
        bincode::deserialize(data).map_err(|e| SessionError::Corrupted(e.to_string()))
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("SessionState")
            .field("role", &self.role)
            .field("send_counter", &self.send.counter)
            .field("recv_counter", &self.recv.counter)
            .field("skipped", &self.skipped.len())
            .field("established_at", &self.established_at)
            .finish()
    }
}

fn bind(aad: &[u8], counter: u64) -> Vec<u8> {
    let mut bound = Vec::with_capacity(aad.len() + 8);
    bound.extend_from_slice(aad);
    bound.extend_from_slice(&counter.to_be_bytes());
    bound
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::keys::{generate_signed_prekey, initiate, PeerBundle, PreKeyPair};
    use crate::types::DeviceId;

    fn session_pair() -> (SessionState, SessionState) {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let bob_spk = generate_signed_prekey(&bob, 1);
        let bob_opk = PreKeyPair::generate(7);

        let bundle = PeerBundle {
            user_id: bob.user_id(),
            device_id: DeviceId(1),
            registration_id: 42,
            identity_signing: bob.public_key_bytes(),
            identity_exchange: bob.exchange_public().to_bytes(),
            signed_prekey: bob_spk.public_part(),
            one_time_prekey: Some(crate::keys::OneTimePreKeyPublic {
                id: bob_opk.id,
                public: bob_opk.public,
            }),
        };

        let (seed_a, handshake) = initiate(&alice, &bundle).unwrap();
        let seed_b = crate::keys::respond(&bob, &bob_spk.pair, Some(&bob_opk), &handshake);

        (
            SessionState::initiate(&seed_a, handshake.clone()),
            SessionState::respond(&seed_b, &handshake),
        )
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (mut alice, mut bob) = session_pair();
        let envelope = alice.seal(b"bonjour", b"aad").unwrap();
        assert!(envelope.handshake.is_some());

        let plaintext = bob.open(&envelope, b"aad").unwrap();
        assert_eq!(plaintext, b"bonjour");
    }

    #[test]
    fn test_both_directions() {
        let (mut alice, mut bob) = session_pair();

        let to_bob = alice.seal(b"ping", b"").unwrap();
        assert_eq!(bob.open(&to_bob, b"").unwrap(), b"ping");

        let to_alice = bob.seal(b"pong", b"").unwrap();
        assert_eq!(alice.open(&to_alice, b"").unwrap(), b"pong");
        // A successful inbound message stops the handshake echo.
        assert!(alice.seal(b"again", b"").unwrap().handshake.is_none());
    }

    #[test]
    fn test_out_of_order_arrival() {
        let (mut alice, mut bob) = session_pair();
        let e0 = alice.seal(b"zero", b"").unwrap();
        let e1 = alice.seal(b"one", b"").unwrap();
        let e2 = alice.seal(b"two", b"").unwrap();

        assert_eq!(bob.open(&e0, b"").unwrap(), b"zero");
        assert_eq!(bob.open(&e2, b"").unwrap(), b"two");
        assert_eq!(bob.open(&e1, b"").unwrap(), b"one");
    }

    #[test]
    fn test_skipped_key_single_use() {
        let (mut alice, mut bob) = session_pair();
        let e0 = alice.seal(b"zero", b"").unwrap();
        let e1 = alice.seal(b"one", b"").unwrap();

        assert_eq!(bob.open(&e1, b"").unwrap(), b"one");
        assert_eq!(bob.open(&e0, b"").unwrap(), b"zero");
        // Replay: the parked key is gone.
        assert!(matches!(
            bob.open(&e0, b""),
            Err(SessionError::StaleCounter(0))
        ));
    }

    #[test]
    fn test_tampered_envelope_leaves_state_intact() {
        let (mut alice, mut bob) = session_pair();
        let good = alice.seal(b"intact", b"").unwrap();

        let mut bad = good.clone();
        let len = bad.ciphertext.len();
        bad.ciphertext[len - 1] ^= 0xFF;

        assert!(matches!(
            bob.open(&bad, b""),
            Err(SessionError::DecryptFailed(0))
        ));
        // The original still decrypts: nothing advanced on failure.
        assert_eq!(bob.open(&good, b"").unwrap(), b"intact");
    }

    #[test]
    fn test_aad_binding() {
        let (mut alice, mut bob) = session_pair();
        let envelope = alice.seal(b"bound", b"sender-a").unwrap();
        assert!(bob.open(&envelope, b"sender-b").is_err());
        assert_eq!(bob.open(&envelope, b"sender-a").unwrap(), b"bound");
    }

    #[test]
    fn test_skip_limit_enforced() {
        let (mut alice, mut bob) = session_pair();
        for _ in 0..MAX_SKIPPED_MESSAGE_KEYS + 1 {
            let _ = alice.seal(b"x", b"").unwrap();
        }
        let far = alice.seal(b"far", b"").unwrap();
        assert!(matches!(
            bob.open(&far, b""),
            Err(SessionError::TooManySkipped { .. })
        ));
    }

    #[test]
    fn test_survives_serialization() {
        let (mut alice, mut bob) = session_pair();
        let e0 = alice.seal(b"before", b"").unwrap();
        assert_eq!(bob.open(&e0, b"").unwrap(), b"before");

        // Simulated restart on both ends mid-conversation.
        let mut alice = SessionState::from_bytes(&alice.to_bytes().unwrap()).unwrap();
        let mut bob = SessionState::from_bytes(&bob.to_bytes().unwrap()).unwrap();

        let e1 = alice.seal(b"after", b"").unwrap();
        assert_eq!(bob.open(&e1, b"").unwrap(), b"after");

        let reply = bob.seal(b"ack", b"").unwrap();
        assert_eq!(alice.open(&reply, b"").unwrap(), b"ack");
    }

    #[test]
    fn test_matches_handshake() {
        let (alice, _bob) = session_pair();
        let echoed = alice
            .pending_handshake
            .clone()
            .expect("initiator keeps handshake until first inbound");
        assert!(alice.matches_handshake(&echoed));

        let mut other = echoed.clone();
        other.ephemeral[0] ^= 1;
        assert!(!alice.matches_handshake(&other));
    }
}
