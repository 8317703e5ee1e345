//! Domain model structs persisted in the local database.
//!
//! Message and conversation structs derive `Serialize` / `Deserialize` so the
//! embedding application can hand them to a UI layer unchanged.  Key-material
//! rows deliberately do not: their secrets never cross a serialization
//! boundary.

use chrono::{DateTime, Utc};
use courrier_shared::protocol::FrameKind;
use courrier_shared::types::{ConversationId, DeviceId, MessageId, MessageStatus, UserId};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One entry of the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Unique message identifier, assigned by the sending client.
    pub id: MessageId,
    /// The conversation this message belongs to.
    pub conversation_id: ConversationId,
    /// Public key of the sender.
    pub sender: UserId,
    /// Which of the sender's devices authored it.
    pub sender_device: DeviceId,
    /// Display text.  `None` while the ciphertext could not be decrypted;
    /// the UI shows a placeholder for such rows.
    pub body: Option<String>,
    /// Original ciphertext, kept until a decryption has succeeded so the
    /// row can be re-decrypted after a crash or session rebuild.
    pub ciphertext: Option<Vec<u8>>,
    /// False only for deliberate plaintext delivery (peer had no keys).
    pub is_encrypted: bool,
    /// True when this device authored the message.
    pub is_outgoing: bool,
    /// Message this one replies to, if any.
    pub reply_to: Option<MessageId>,
    /// Sender-assigned timestamp; the log orders by this.
    pub timestamp: DateTime<Utc>,
    /// Delivery lifecycle state.
    pub status: MessageStatus,
    /// Set when an edit has been applied.
    pub edited_at: Option<DateTime<Utc>>,
    /// Soft-delete marker; rows are never physically removed on delete.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Cancelled before any channel acknowledged it; never propagated.
    pub local_only: bool,
}

impl Message {
    /// Whether the stored ciphertext still awaits a successful decryption.
    pub fn needs_decryption(&self) -> bool {
        self.body.is_none() && self.ciphertext.is_some()
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A one-to-one conversation with a peer user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    /// The correspondent's public key.
    pub peer: UserId,
    pub created_at: DateTime<Utc>,
    pub archived: bool,
    /// High-water mark for unread accounting.
    pub last_read_at: Option<DateTime<Utc>>,
}

/// Derived, non-authoritative view used for conversation lists.
/// Recomputed by folding over the log; never hand-edited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub peer: UserId,
    pub last_message_preview: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
    pub archived: bool,
}

// ---------------------------------------------------------------------------
// Reaction
// ---------------------------------------------------------------------------

/// One (message, emoji, user) reaction row.  The composite primary key gives
/// set semantics: re-adding is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reaction {
    pub message_id: MessageId,
    pub emoji: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Ratchet session
// ---------------------------------------------------------------------------

/// Serialized ratchet state for one (peer user, peer device) pair.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub peer: UserId,
    pub peer_device: DeviceId,
    /// Opaque serialized `SessionState`.
    pub state: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Device identity & pre-keys
// ---------------------------------------------------------------------------

/// The single device identity row (id = 1).
#[derive(Clone)]
pub struct StoredIdentity {
    pub device_id: DeviceId,
    pub registration_id: u32,
    pub signing_secret: [u8; 32],
    pub exchange_secret: [u8; 32],
    /// Next pre-key id to allocate; ids are never reused.
    pub next_prekey_id: u32,
    /// Whether the directory has accepted a registration at least once.
    pub published: bool,
    pub created_at: DateTime<Utc>,
}

/// A stored signed pre-key (medium-term).
#[derive(Clone)]
pub struct StoredSignedPreKey {
    pub id: u32,
    pub public: [u8; 32],
    pub secret: [u8; 32],
    pub signature: [u8; 64],
    pub created_at: DateTime<Utc>,
}

/// A stored one-time pre-key.  `consumed` flips exactly once, when the key
/// is used to answer a session handshake.
#[derive(Clone, Debug)]
pub struct StoredPreKey {
    pub id: u32,
    pub public: [u8; 32],
    pub secret: [u8; 32],
    pub consumed: bool,
    pub published: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// One durable entry of the retry queue.  `body` is the unencrypted payload
/// (so preparation can happen on a later attempt when the first one ran
/// offline); `prepared` caches the per-device frames once built so retries
/// do not advance the ratchet again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub recipient: UserId,
    pub kind: FrameKind,
    pub body: Vec<u8>,
    pub prepared: Option<Vec<u8>>,
    pub created_at_ms: i64,
    pub next_retry_ms: i64,
    pub tries: u32,
}
