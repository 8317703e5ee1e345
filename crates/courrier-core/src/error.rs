use courrier_shared::types::MessageStatus;
use courrier_shared::{CryptoError, SessionError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Store error: {0}")]
    Store(#[from] courrier_store::StoreError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("No device identity; call initialize first")]
    NoIdentity,

    #[error("Store already holds a different identity")]
    IdentityConflict,

    #[error("Message is {0}, only pending sends can be cancelled")]
    CancelRefused(MessageStatus),

    #[error("Message is {0}, only failed or cancelled sends can be resent")]
    ResendRefused(MessageStatus),

    #[error("Message cannot be modified (not ours, or already deleted)")]
    ImmutableMessage,

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Failures talking to the key directory.
///
/// `NoDevicesRegistered` and `NoPreKeysAvailable` are expected conditions
/// for a peer who has never published keys, and callers degrade rather
/// than abort on them.
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Directory unreachable: {0}")]
    Unavailable(String),

    #[error("Peer has no registered devices")]
    NoDevicesRegistered,

    #[error("Peer has no published prekeys")]
    NoPreKeysAvailable,

    #[error("Directory rejected the request (status {status})")]
    Rejected { status: u16 },
}

impl DirectoryError {
    /// Peer-side absence of key material, as opposed to our failure to
    /// reach the directory.
    pub fn is_missing_keys(&self) -> bool {
        matches!(
            self,
            DirectoryError::NoDevicesRegistered | DirectoryError::NoPreKeysAvailable
        )
    }
}

/// Failures on the relayed delivery path.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Relay unreachable: {0}")]
    Unavailable(String),

    #[error("Relay rejected the frame (status {status})")]
    Rejected { status: u16 },
}

impl RelayError {
    /// Whether retrying later can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RelayError::Rejected { .. })
    }
}
