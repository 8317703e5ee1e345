//! Events the core pushes to the embedding application (UI layer).
//!
//! A tokio broadcast channel fans events out to any number of listeners;
//! emitting with no listeners attached is fine and simply drops the event.

use serde::Serialize;
use tokio::sync::broadcast;

use courrier_shared::types::{
    ConnectionStatus, ConversationId, MessageId, MessageStatus, UserId,
};

/// Why a delivery ran with reduced guarantees.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DegradationKind {
    /// Peer had no published key material; body went out in the clear.
    PlaintextFallback,
    /// Direct channel failed or was unavailable; fell back to the relay.
    RelayFallback,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    MessageAdded {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageStatusChanged {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
        status: MessageStatus,
    },
    MessageEdited {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    ReactionChanged {
        conversation_id: ConversationId,
        message_id: MessageId,
        emoji: String,
        user_id: UserId,
        added: bool,
    },
    /// A message arrived whose ciphertext could not be decrypted; the UI
    /// shows a placeholder for it.
    MessageUndecryptable {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    /// A confidentiality or path downgrade happened.  Always accompanied
    /// by a warn-level log line.
    DeliveryDegraded {
        message_id: MessageId,
        kind: DegradationKind,
    },
    ConnectionChanged {
        status: ConnectionStatus,
    },
    TypingReceived {
        conversation_id: ConversationId,
        user_id: UserId,
    },
}

/// Fan-out handle for [`ClientEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ClientEvent) {
        tracing::trace!(event = ?event, "Emitting client event");
        // Err just means nobody is listening right now.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_all_subscribers() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(ClientEvent::ConnectionChanged {
            status: ConnectionStatus::Online,
        });

        assert!(matches!(
            a.recv().await.unwrap(),
            ClientEvent::ConnectionChanged { .. }
        ));
        assert!(matches!(
            b.recv().await.unwrap(),
            ClientEvent::ConnectionChanged { .. }
        ));
    }

    #[test]
    fn emit_without_subscribers_is_a_noop() {
        let bus = EventBus::new(8);
        bus.emit(ClientEvent::ConnectionChanged {
            status: ConnectionStatus::Offline,
        });
    }

    // The UI consumes events as tagged JSON; field and tag names are a
    // contract with the embedding application.
    #[test]
    fn events_serialize_with_kebab_case_tags() {
        let value = serde_json::to_value(ClientEvent::ConnectionChanged {
            status: ConnectionStatus::Online,
        })
        .unwrap();
        assert_eq!(value["event"], "connection-changed");
        assert_eq!(value["status"], "online");

        let value = serde_json::to_value(ClientEvent::DeliveryDegraded {
            message_id: MessageId::new(),
            kind: DegradationKind::PlaintextFallback,
        })
        .unwrap();
        assert_eq!(value["event"], "delivery-degraded");
        assert_eq!(value["kind"], "plaintextfallback");
    }
}
