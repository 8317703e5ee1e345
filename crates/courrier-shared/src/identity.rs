use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::IdentityError;
use crate::types::UserId;

/// A device's cryptographic identity: an Ed25519 signing key whose public
/// half doubles as the user ID, plus an X25519 key for pre-key agreement.
/// No email, no phone number.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    exchange_key: StaticSecret,
}

/// Serializable format for storing/exporting identity
#[derive(Serialize, Deserialize)]
pub struct IdentityExport {
    pub signing_secret: [u8; 32],
    pub exchange_secret: [u8; 32],
    pub public_key: [u8; 32],
}

impl IdentityExport {
    /// Render the secret material as one hex string, for enrolling the
    /// same account on another device.
    pub fn to_hex(&self) -> String {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.signing_secret);
        bytes[32..].copy_from_slice(&self.exchange_secret);
        hex::encode(bytes)
    }

    /// Parse the hex form produced by [`IdentityExport::to_hex`].
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s.trim()).map_err(|_| IdentityError::InvalidKeyBytes)?;
        if bytes.len() != 64 {
            return Err(IdentityError::InvalidKeyBytes);
        }
        let mut signing = [0u8; 32];
        let mut exchange = [0u8; 32];
        signing.copy_from_slice(&bytes[..32]);
        exchange.copy_from_slice(&bytes[32..]);
        let identity = Identity::from_secret_bytes(&signing, &exchange);
        Ok(Self {
            signing_secret: signing,
            exchange_secret: exchange,
            public_key: identity.public_key_bytes(),
        })
    }
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let exchange_key = StaticSecret::random_from_rng(OsRng);
        Self {
            signing_key,
            exchange_key,
        }
    }

    /// Restore identity from secret key bytes
    pub fn from_secret_bytes(signing: &[u8; 32], exchange: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(signing),
            exchange_key: StaticSecret::from(*exchange),
        }
    }

    /// Restore identity from a serialized export
    pub fn from_export(export: &IdentityExport) -> Self {
        Self::from_secret_bytes(&export.signing_secret, &export.exchange_secret)
    }

    /// Get the user ID (signing public key)
    pub fn user_id(&self) -> UserId {
        UserId(self.signing_key.verifying_key().to_bytes())
    }

    /// Raw signing public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// X25519 public key used as this device's identity in key agreement
    pub fn exchange_public(&self) -> PublicKey {
        PublicKey::from(&self.exchange_key)
    }

    /// X25519 secret, needed when responding to a session handshake
    pub fn exchange_secret(&self) -> &StaticSecret {
        &self.exchange_key
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Get the verifying (public) key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Export identity for serialization
    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            signing_secret: *self.signing_key.as_bytes(),
            exchange_secret: self.exchange_key.to_bytes(),
            public_key: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Short human-checkable fingerprint of the public identity
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.public_key_bytes());
        hex::encode(&hash.as_bytes()[..8])
    }

    /// Derive a database encryption key from the identity using BLAKE3
    pub fn derive_db_key(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_derive_key(crate::constants::KDF_CONTEXT_DB_KEY);
        hasher.update(self.signing_key.as_bytes());
        let hash = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&hash.as_bytes()[..32]);
        key
    }
}

/// Verify a signature against a public key
pub fn verify_signature(
    pubkey_bytes: &[u8; 32],
    message: &[u8],
    signature: &Signature,
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(pubkey_bytes).map_err(|_| IdentityError::InvalidKeyBytes)?;
    verifying_key
        .verify(message, signature)
        .map_err(|_| IdentityError::InvalidKeyBytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generation() {
        let id = Identity::generate();
        let user_id = id.user_id();
        assert_eq!(user_id.0.len(), 32);
    }

    #[test]
    fn test_identity_roundtrip() {
        let id = Identity::generate();
        let export = id.to_export();
        let restored = Identity::from_export(&export);
        assert_eq!(id.user_id(), restored.user_id());
        assert_eq!(
            id.exchange_public().as_bytes(),
            restored.exchange_public().as_bytes()
        );
    }

    #[test]
    fn test_sign_verify() {
        let id = Identity::generate();
        let message = b"Hello, Courrier!";
        let signature = id.sign(message);

        assert!(verify_signature(&id.public_key_bytes(), message, &signature).is_ok());

        // Wrong message should fail
        assert!(verify_signature(&id.public_key_bytes(), b"wrong", &signature).is_err());
    }

    #[test]
    fn test_db_key_derivation_deterministic() {
        let id = Identity::generate();
        let key1 = id.derive_db_key();
        let key2 = id.derive_db_key();
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let id = Identity::generate();
        assert_eq!(id.fingerprint(), id.fingerprint());
        assert_eq!(id.fingerprint().len(), 16);
    }

    #[test]
    fn test_hex_export_roundtrip() {
        let id = Identity::generate();
        let hex = id.to_export().to_hex();
        assert_eq!(hex.len(), 128);

        let restored = Identity::from_export(&IdentityExport::from_hex(&hex).unwrap());
        assert_eq!(id.user_id(), restored.user_id());
        assert_eq!(id.fingerprint(), restored.fingerprint());

        assert!(IdentityExport::from_hex("deadbeef").is_err());
        assert!(IdentityExport::from_hex("not hex at all").is_err());
    }
}
