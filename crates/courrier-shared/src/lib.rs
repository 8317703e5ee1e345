//! # courrier-shared
//!
//! Protocol-level building blocks for the Courrier delivery core: identifiers,
//! key material, the pre-key handshake, the per-session ratchet, and the wire
//! frames exchanged over relay or direct channels.  No I/O lives here.

pub mod constants;
pub mod crypto;
pub mod identity;
pub mod keys;
pub mod protocol;
pub mod ratchet;
pub mod types;

mod error;

pub use error::{CourrierError, CryptoError, IdentityError, SessionError};
pub use identity::{Identity, IdentityExport};
pub use types::{ConnectionStatus, ConversationId, DeviceId, MessageId, MessageStatus, UserId};
