/// Application name
pub const APP_NAME: &str = "Courrier";

/// Wire protocol / envelope version
pub const PROTOCOL_VERSION: u8 = 1;

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Ed25519 / X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Maximum message body size in bytes (64 KiB)
pub const MAX_MESSAGE_SIZE: usize = 65_536;

/// Default number of one-time pre-keys published per batch
pub const DEFAULT_PREKEY_BATCH: u32 = 100;

/// How many message keys a receiving chain will cache for
/// out-of-order arrival before refusing to advance further.
pub const MAX_SKIPPED_MESSAGE_KEYS: u64 = 512;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_DB_KEY: &str = "courrier-db-key-v1";
pub const KDF_CONTEXT_SESSION_ROOT: &str = "courrier-session-root-v1";
pub const KDF_CONTEXT_CHAIN_INIT: &str = "courrier-chain-init-v1";
pub const KDF_CONTEXT_CHAIN_STEP: &str = "courrier-chain-step-v1";
pub const KDF_CONTEXT_MESSAGE_KEY: &str = "courrier-message-key-v1";
pub const KDF_CONTEXT_HANDSHAKE_ID: &str = "courrier-handshake-id-v1";
