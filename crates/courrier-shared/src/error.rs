use thiserror::Error;

#[derive(Error, Debug)]
pub enum CourrierError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid signature")]
    InvalidSignature,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Failed to generate keypair")]
    GenerationFailed,
}

/// Failures of the per-peer-device ratchet session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No session established for this peer device")]
    NoSession,

    #[error("Message counter {0} is behind the chain and no cached key remains")]
    StaleCounter(u64),

    #[error("Ciphertext did not authenticate at counter {0}")]
    DecryptFailed(u64),

    #[error("Message counter {counter} would skip {skipped} keys (limit {limit})")]
    TooManySkipped {
        counter: u64,
        skipped: u64,
        limit: u64,
    },

    #[error("One-time pre-key {0} was already consumed")]
    PreKeyReused(u32),

    #[error("Signed pre-key {0} is unknown to this device")]
    UnknownSignedPreKey(u32),

    #[error("Session state is corrupted: {0}")]
    Corrupted(String),
}
