//! The relay channel seam: server-mediated delivery.
//!
//! A subscription is a value whose drop leaves the conversation topic, so
//! a closed conversation can never leak a live listener.  The in-memory
//! relay mirrors the server contract: frames whose plaintext metadata the
//! relay can read (receipts, reactions, typing) are translated into their
//! event form before fan-out; everything else is forwarded as
//! [`RelayEvent::NewMessage`] for the recipient to decrypt.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::debug;

use courrier_shared::protocol::{Frame, FrameContent, MessageBody, RelayEvent};
use courrier_shared::types::ConversationId;

use crate::error::RelayError;

#[async_trait]
pub trait RelayChannel: Send + Sync {
    /// Hand one frame to the relay.  `Ok` is the relay acknowledgement
    /// that drives `pending -> sent`.
    async fn publish(&self, frame: &Frame) -> Result<(), RelayError>;

    /// Join a conversation's event stream.
    async fn subscribe(&self, conversation: ConversationId) -> Result<Subscription, RelayError>;
}

/// A live conversation subscription.  Dropping it leaves the topic.
pub struct Subscription {
    conversation_id: ConversationId,
    rx: mpsc::UnboundedReceiver<RelayEvent>,
    _guard: Box<dyn Any + Send>,
}

impl Subscription {
    pub fn new(
        conversation_id: ConversationId,
        rx: mpsc::UnboundedReceiver<RelayEvent>,
        guard: Box<dyn Any + Send>,
    ) -> Self {
        Self {
            conversation_id,
            rx,
            _guard: guard,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Next event, or `None` once the relay side has gone away.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        self.rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct Topic {
    subscribers: Vec<(u64, mpsc::UnboundedSender<RelayEvent>)>,
    /// Events retained server-side; replayed to late subscribers.  Client
    /// merges are idempotent, so replay is always safe.
    backlog: Vec<RelayEvent>,
}

#[derive(Default)]
struct RelayInner {
    topics: HashMap<ConversationId, Topic>,
}

/// Process-local relay, shared between clients in tests via `Arc`.
pub struct InMemoryRelay {
    inner: Arc<Mutex<RelayInner>>,
    next_subscriber_id: AtomicU64,
    unavailable: AtomicBool,
    fail_next: AtomicU32,
    accepted: AtomicU32,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RelayInner::default())),
            next_subscriber_id: AtomicU64::new(1),
            unavailable: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            accepted: AtomicU32::new(0),
        }
    }

    /// Simulate an unreachable relay until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` publish calls, then recover.
    pub fn fail_next_publishes(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Frames accepted so far.
    pub fn accepted_count(&self) -> u32 {
        self.accepted.load(Ordering::SeqCst)
    }

    /// What the relay understands from a frame without decrypting it.
    fn translate(frame: &Frame) -> RelayEvent {
        if let FrameContent::Plain(body) = &frame.content {
            match body {
                MessageBody::Receipt { ids, status } => {
                    return RelayEvent::MessageUpdated {
                        conversation_id: frame.conversation_id,
                        ids: ids.clone(),
                        status: *status,
                        updated_at: Utc::now(),
                    };
                }
                MessageBody::Reaction { target, emoji, add } => {
                    return RelayEvent::ReactionUpdated {
                        conversation_id: frame.conversation_id,
                        target: *target,
                        emoji: emoji.clone(),
                        user_id: frame.sender,
                        added: *add,
                    };
                }
                MessageBody::Typing => {
                    return RelayEvent::Typing {
                        conversation_id: frame.conversation_id,
                        user_id: frame.sender,
                    };
                }
                _ => {}
            }
        }
        RelayEvent::NewMessage(frame.clone())
    }
}

impl Default for InMemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayChannel for InMemoryRelay {
    async fn publish(&self, frame: &Frame) -> Result<(), RelayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RelayError::Unavailable("relay offline".into()));
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RelayError::Unavailable("injected failure".into()));
        }

        let event = Self::translate(frame);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let topic = inner
            .topics
            .entry(frame.conversation_id)
            .or_insert_with(|| Topic {
                subscribers: Vec::new(),
                backlog: Vec::new(),
            });

        topic
            .subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
        // typing is ephemeral; everything else is retained for replay
        if !matches!(event, RelayEvent::Typing { .. }) {
            topic.backlog.push(event);
        }

        self.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, conversation: ConversationId) -> Result<Subscription, RelayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RelayError::Unavailable("relay offline".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);

        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let topic = inner.topics.entry(conversation).or_insert_with(|| Topic {
                subscribers: Vec::new(),
                backlog: Vec::new(),
            });
            for event in &topic.backlog {
                let _ = tx.send(event.clone());
            }
            topic.subscribers.push((id, tx));
        }
        debug!(conversation = %conversation, subscriber = id, "Subscribed to topic");

        let guard = TopicGuard {
            conversation,
            subscriber_id: id,
            inner: self.inner.clone(),
        };
        Ok(Subscription::new(conversation, rx, Box::new(guard)))
    }
}

/// Removes the subscriber from its topic when the subscription drops.
struct TopicGuard {
    conversation: ConversationId,
    subscriber_id: u64,
    inner: Arc<Mutex<RelayInner>>,
}

impl Drop for TopicGuard {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(topic) = inner.topics.get_mut(&self.conversation) {
            topic
                .subscribers
                .retain(|(id, _)| *id != self.subscriber_id);
        }
        debug!(
            conversation = %self.conversation,
            subscriber = self.subscriber_id,
            "Unsubscribed from topic"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courrier_shared::constants::PROTOCOL_VERSION;
    use courrier_shared::types::{DeviceId, MessageId, MessageStatus, UserId};

    fn plain_frame(conversation: ConversationId, body: MessageBody) -> Frame {
        Frame {
            version: PROTOCOL_VERSION,
            kind: body.kind(),
            message_id: MessageId::new(),
            conversation_id: conversation,
            sender: UserId([1u8; 32]),
            sender_device: DeviceId(1),
            recipient: UserId([2u8; 32]),
            recipient_device: DeviceId(0),
            sent_at: Utc::now(),
            content: FrameContent::Plain(body),
        }
    }

    #[tokio::test]
    async fn text_frames_fan_out_as_new_message() {
        let relay = InMemoryRelay::new();
        let conversation = ConversationId::new();
        let mut sub = relay.subscribe(conversation).await.unwrap();

        let frame = plain_frame(
            conversation,
            MessageBody::Text {
                text: "bonjour".into(),
                reply_to: None,
            },
        );
        relay.publish(&frame).await.unwrap();

        match sub.recv().await.unwrap() {
            RelayEvent::NewMessage(received) => assert_eq!(received.message_id, frame.message_id),
            other => panic!("expected NewMessage, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn receipt_frames_become_status_events() {
        let relay = InMemoryRelay::new();
        let conversation = ConversationId::new();
        let mut sub = relay.subscribe(conversation).await.unwrap();

        let target = MessageId::new();
        let frame = plain_frame(
            conversation,
            MessageBody::Receipt {
                ids: vec![target],
                status: MessageStatus::Delivered,
            },
        );
        relay.publish(&frame).await.unwrap();

        match sub.recv().await.unwrap() {
            RelayEvent::MessageUpdated { ids, status, .. } => {
                assert_eq!(ids, vec![target]);
                assert_eq!(status, MessageStatus::Delivered);
            }
            other => panic!("expected MessageUpdated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn backlog_replays_to_late_subscriber() {
        let relay = InMemoryRelay::new();
        let conversation = ConversationId::new();

        let frame = plain_frame(
            conversation,
            MessageBody::Text {
                text: "en retard".into(),
                reply_to: None,
            },
        );
        relay.publish(&frame).await.unwrap();

        let mut sub = relay.subscribe(conversation).await.unwrap();
        assert!(matches!(
            sub.recv().await.unwrap(),
            RelayEvent::NewMessage(_)
        ));
    }

    #[tokio::test]
    async fn dropping_subscription_leaves_topic() {
        let relay = InMemoryRelay::new();
        let conversation = ConversationId::new();
        {
            let _sub = relay.subscribe(conversation).await.unwrap();
        }
        let inner = relay.inner.lock().unwrap();
        assert!(inner.topics[&conversation].subscribers.is_empty());
    }

    #[tokio::test]
    async fn injected_failures_then_recovery() {
        let relay = InMemoryRelay::new();
        let conversation = ConversationId::new();
        let frame = plain_frame(conversation, MessageBody::Typing);

        relay.fail_next_publishes(2);
        assert!(relay.publish(&frame).await.is_err());
        assert!(relay.publish(&frame).await.is_err());
        assert!(relay.publish(&frame).await.is_ok());
        assert_eq!(relay.accepted_count(), 1);
    }
}
