use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ratchet::EncryptedEnvelope;
use crate::types::{ConversationId, DeviceId, MessageId, MessageStatus, UserId};

/// What a frame carries, visible to the relay so it can route and translate.
///
/// `Text`/`Edit`/`Delete` bodies are end-to-end encrypted (or explicit
/// plaintext when the peer has no keys).  `Reaction`, `Receipt` and `Typing`
/// are structural metadata the relay must read to emit the matching
/// conversation events, so they are never encrypted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Text,
    Edit,
    Delete,
    Reaction,
    Receipt,
    Typing,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Text => "text",
            FrameKind::Edit => "edit",
            FrameKind::Delete => "delete",
            FrameKind::Reaction => "reaction",
            FrameKind::Receipt => "receipt",
            FrameKind::Typing => "typing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(FrameKind::Text),
            "edit" => Some(FrameKind::Edit),
            "delete" => Some(FrameKind::Delete),
            "reaction" => Some(FrameKind::Reaction),
            "receipt" => Some(FrameKind::Receipt),
            "typing" => Some(FrameKind::Typing),
            _ => None,
        }
    }
}

/// The delivery unit pushed to a relay or direct channel, one per
/// recipient device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Wire/encryption scheme version
    pub version: u8,
    pub kind: FrameKind,
    /// Message UUID for deduplication
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub sender_device: DeviceId,
    pub recipient: UserId,
    pub recipient_device: DeviceId,
    /// Sender-assigned timestamp; merge order follows this, not arrival.
    pub sent_at: DateTime<Utc>,
    pub content: FrameContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FrameContent {
    /// Session-encrypted body (XChaCha20-Poly1305 under a ratchet key)
    Encrypted(EncryptedEnvelope),
    /// Deliberate plaintext: peer had no published key material, or the
    /// body is relay-readable metadata (reactions, receipts, typing).
    Plain(MessageBody),
}

impl Frame {
    pub fn is_encrypted(&self) -> bool {
        matches!(self.content, FrameContent::Encrypted(_))
    }

    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// The decrypted (or plaintext) payload of a frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageBody {
    Text {
        text: String,
        reply_to: Option<MessageId>,
    },
    Edit {
        target: MessageId,
        new_text: String,
    },
    Delete {
        target: MessageId,
    },
    Reaction {
        target: MessageId,
        emoji: String,
        add: bool,
    },
    Receipt {
        ids: Vec<MessageId>,
        status: MessageStatus,
    },
    Typing,
}

impl MessageBody {
    pub fn kind(&self) -> FrameKind {
        match self {
            MessageBody::Text { .. } => FrameKind::Text,
            MessageBody::Edit { .. } => FrameKind::Edit,
            MessageBody::Delete { .. } => FrameKind::Delete,
            MessageBody::Reaction { .. } => FrameKind::Reaction,
            MessageBody::Receipt { .. } => FrameKind::Receipt,
            MessageBody::Typing => FrameKind::Typing,
        }
    }

    /// Whether this body must be session-encrypted when a session exists.
    pub fn wants_encryption(&self) -> bool {
        matches!(
            self,
            MessageBody::Text { .. } | MessageBody::Edit { .. } | MessageBody::Delete { .. }
        )
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Real-time events the relay pushes to subscribed conversations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RelayEvent {
    /// A frame addressed to this device arrived.
    NewMessage(Frame),
    /// Lifecycle change for one or more messages (single or bulk receipt).
    MessageUpdated {
        conversation_id: ConversationId,
        ids: Vec<MessageId>,
        status: MessageStatus,
        updated_at: DateTime<Utc>,
    },
    /// A reaction was toggled on a message.
    ReactionUpdated {
        conversation_id: ConversationId,
        target: MessageId,
        emoji: String,
        user_id: UserId,
        added: bool,
    },
    /// A peer is typing; never persisted.
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
    },
}

impl RelayEvent {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            RelayEvent::NewMessage(frame) => frame.conversation_id,
            RelayEvent::MessageUpdated {
                conversation_id, ..
            } => *conversation_id,
            RelayEvent::ReactionUpdated {
                conversation_id, ..
            } => *conversation_id,
            RelayEvent::Typing {
                conversation_id, ..
            } => *conversation_id,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
