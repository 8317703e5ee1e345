//! Applies relay events to the local log.
//!
//! Every application is idempotent: message inserts are keyed upserts,
//! status changes go through the monotonic guard, reactions are
//! set-semantics.  Replaying a backlog after reconnect therefore
//! converges to the same state as live delivery, in any arrival order.
//!
//! Frames whose ciphertext cannot be opened are kept as placeholder rows
//! and re-attempted whenever a session rebuild for that peer device
//! succeeds.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use courrier_shared::protocol::{Frame, FrameContent, FrameKind, MessageBody, RelayEvent};
use courrier_shared::ratchet::EncryptedEnvelope;
use courrier_shared::types::{ConversationId, DeviceId, MessageId, MessageStatus, UserId};
use courrier_shared::SessionError;
use courrier_store::{Conversation, Database, Message};

use crate::error::{CoreError, Result};
use crate::events::{ClientEvent, EventBus};
use crate::identity::DeviceIdentityStore;
use crate::session::{frame_aad, SessionCipher};

/// What the caller owes the network after applying one event.
#[derive(Default)]
pub struct Applied {
    /// Send a `Delivered` receipt for these inbound messages.  Present
    /// for duplicates too: a resend means our earlier receipt was lost.
    pub confirm_delivered: Option<(UserId, ConversationId, Vec<MessageId>)>,
}

/// Merges inbound relay events into the store and emits UI events for
/// whatever actually changed.
pub struct SyncReconciler {
    db: Arc<Mutex<Database>>,
    cipher: Arc<SessionCipher>,
    identity: Arc<DeviceIdentityStore>,
    events: EventBus,
}

impl SyncReconciler {
    pub fn new(
        db: Arc<Mutex<Database>>,
        cipher: Arc<SessionCipher>,
        identity: Arc<DeviceIdentityStore>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            cipher,
            identity,
            events,
        }
    }

    /// Apply one event.  Safe to call with duplicates or out of order.
    pub async fn apply(&self, event: RelayEvent) -> Result<Applied> {
        match event {
            RelayEvent::NewMessage(frame) => self.apply_frame(frame).await,
            RelayEvent::MessageUpdated {
                conversation_id,
                ids,
                status,
                ..
            } => {
                self.apply_status(conversation_id, &ids, status).await?;
                Ok(Applied::default())
            }
            RelayEvent::ReactionUpdated {
                conversation_id,
                target,
                emoji,
                user_id,
                added,
            } => {
                self.apply_reaction(conversation_id, target, &emoji, &user_id, added)
                    .await?;
                Ok(Applied::default())
            }
            RelayEvent::Typing {
                conversation_id,
                user_id,
            } => {
                if user_id != self.identity.user_id() {
                    self.events.emit(ClientEvent::TypingReceived {
                        conversation_id,
                        user_id,
                    });
                }
                Ok(Applied::default())
            }
        }
    }

    async fn apply_frame(&self, frame: Frame) -> Result<Applied> {
        let self_user = self.identity.user_id();
        let self_device = self.identity.device_id();

        // Our own echo: the send path already wrote this message.
        if frame.sender == self_user && frame.sender_device == self_device {
            return Ok(Applied::default());
        }

        // Structural bodies arrive as plaintext frames over the direct
        // channel; the relay translates them to events instead.
        if let FrameContent::Plain(body) = &frame.content {
            if !body.wants_encryption() {
                let body = body.clone();
                return self.apply_structural(&frame, body).await;
            }
        }

        // Encrypted copies are per recipient device; copies for the peer
        // or for sibling devices of ours are not addressed to us.  Device 0
        // is the broadcast sentinel used by plaintext fallback sends.
        let addressed_here =
            frame.recipient_device == self_device || frame.recipient_device == DeviceId(0);
        if frame.recipient != self_user || !addressed_here {
            return Ok(Applied::default());
        }

        self.adopt_conversation(&frame).await?;

        let (body, rebuilt) = match &frame.content {
            FrameContent::Plain(body) => (body.clone(), false),
            FrameContent::Encrypted(envelope) => {
                let aad = frame_aad(
                    &frame.sender,
                    frame.sender_device,
                    &frame.recipient,
                    frame.recipient_device,
                    &frame.message_id,
                );
                match self
                    .cipher
                    .decrypt_from_device(&frame.sender, frame.sender_device, envelope, &aad)
                    .await
                {
                    Ok(inbound) => match MessageBody::from_bytes(&inbound.plaintext) {
                        Ok(body) => (body, inbound.session_rebuilt),
                        Err(e) => {
                            warn!(
                                message = %frame.message_id,
                                error = %e,
                                "decrypted body failed to parse, dropping frame"
                            );
                            return Ok(Applied::default());
                        }
                    },
                    Err(e) => {
                        warn!(
                            message = %frame.message_id,
                            peer = %frame.sender,
                            error = %e,
                            "could not decrypt inbound frame"
                        );
                        // A handshake we cannot honor means the peer has
                        // restarted from a bundle we no longer hold.  Any
                        // session we kept for them is dead weight; drop it
                        // so the next send opens a fresh exchange.
                        if matches!(
                            e,
                            CoreError::Session(
                                SessionError::PreKeyReused(_)
                                    | SessionError::UnknownSignedPreKey(_)
                            )
                        ) {
                            self.cipher
                                .tear_down(&frame.sender, frame.sender_device)
                                .await?;
                        }
                        return self.park_undecryptable(&frame, envelope).await;
                    }
                }
            }
        };

        let applied = self.apply_body(&frame, body).await?;
        if rebuilt {
            self.retry_undecrypted(&frame.sender, frame.sender_device)
                .await?;
        }
        Ok(applied)
    }

    /// Plaintext reaction / receipt / typing frames, as pushed over the
    /// direct channel.
    async fn apply_structural(&self, frame: &Frame, body: MessageBody) -> Result<Applied> {
        match body {
            MessageBody::Receipt { ids, status } => {
                self.apply_status(frame.conversation_id, &ids, status).await?;
            }
            MessageBody::Reaction { target, emoji, add } => {
                self.apply_reaction(frame.conversation_id, target, &emoji, &frame.sender, add)
                    .await?;
            }
            MessageBody::Typing => {
                self.events.emit(ClientEvent::TypingReceived {
                    conversation_id: frame.conversation_id,
                    user_id: frame.sender,
                });
            }
            other => {
                debug!(kind = ?other.kind(), "ignoring unexpected plaintext body");
            }
        }
        Ok(Applied::default())
    }

    async fn apply_body(&self, frame: &Frame, body: MessageBody) -> Result<Applied> {
        match body {
            MessageBody::Text { text, reply_to } => {
                self.apply_text(frame, text, reply_to).await
            }
            MessageBody::Edit { target, new_text } => {
                let changed = {
                    let guard = self.db.lock().await;
                    guard.apply_edit(target, &new_text, frame.sent_at)?
                };
                if changed {
                    self.events.emit(ClientEvent::MessageEdited {
                        conversation_id: frame.conversation_id,
                        message_id: target,
                    });
                }
                Ok(Applied::default())
            }
            MessageBody::Delete { target } => {
                let changed = {
                    let guard = self.db.lock().await;
                    guard.apply_delete(target, frame.sent_at)?
                };
                if changed {
                    self.events.emit(ClientEvent::MessageDeleted {
                        conversation_id: frame.conversation_id,
                        message_id: target,
                    });
                }
                Ok(Applied::default())
            }
            other => self.apply_structural(frame, other).await,
        }
    }

    async fn apply_text(
        &self,
        frame: &Frame,
        text: String,
        reply_to: Option<MessageId>,
    ) -> Result<Applied> {
        let ciphertext = match &frame.content {
            FrameContent::Encrypted(envelope) => Some(bincode::serialize(envelope)?),
            FrameContent::Plain(_) => None,
        };
        let message = Message {
            id: frame.message_id,
            conversation_id: frame.conversation_id,
            sender: frame.sender,
            sender_device: frame.sender_device,
            body: Some(text.clone()),
            ciphertext,
            is_encrypted: frame.is_encrypted(),
            is_outgoing: false,
            reply_to,
            timestamp: frame.sent_at,
            status: MessageStatus::Delivered,
            edited_at: None,
            deleted_at: None,
            local_only: false,
        };

        let guard = self.db.lock().await;
        let inserted = guard.upsert_message(&message)?;
        if inserted {
            drop(guard);
            self.events.emit(ClientEvent::MessageAdded {
                conversation_id: frame.conversation_id,
                message_id: frame.message_id,
            });
        } else {
            // Duplicate.  If the stored row is an unread placeholder we
            // now hold the plaintext for, fill it in.
            let existing = guard.get_message(frame.message_id)?;
            drop(guard);
            if existing.body.is_none() && existing.deleted_at.is_none() {
                let guard = self.db.lock().await;
                guard.set_decrypted_body(frame.message_id, &text)?;
                drop(guard);
                self.events.emit(ClientEvent::MessageAdded {
                    conversation_id: frame.conversation_id,
                    message_id: frame.message_id,
                });
            }
        }

        Ok(Applied {
            confirm_delivered: Some((
                frame.sender,
                frame.conversation_id,
                vec![frame.message_id],
            )),
        })
    }

    async fn apply_status(
        &self,
        conversation_id: ConversationId,
        ids: &[MessageId],
        status: MessageStatus,
    ) -> Result<()> {
        let changed = {
            let guard = self.db.lock().await;
            guard.advance_status_bulk(ids, status)?
        };
        if !changed.is_empty() {
            self.events.emit(ClientEvent::MessageStatusChanged {
                conversation_id,
                message_ids: changed,
                status,
            });
        }
        Ok(())
    }

    async fn apply_reaction(
        &self,
        conversation_id: ConversationId,
        target: MessageId,
        emoji: &str,
        user: &UserId,
        added: bool,
    ) -> Result<()> {
        let changed = {
            let guard = self.db.lock().await;
            if added {
                guard.add_reaction(target, emoji, user)?
            } else {
                guard.remove_reaction(target, emoji, user)?
            }
        };
        if changed {
            self.events.emit(ClientEvent::ReactionChanged {
                conversation_id,
                message_id: target,
                emoji: emoji.to_string(),
                user_id: *user,
                added,
            });
        }
        Ok(())
    }

    /// First frame from a new peer: adopt the sender's conversation id so
    /// both sides log under the same key.
    async fn adopt_conversation(&self, frame: &Frame) -> Result<()> {
        let guard = self.db.lock().await;
        guard.upsert_conversation(&Conversation {
            id: frame.conversation_id,
            peer: frame.sender,
            created_at: frame.sent_at,
            archived: false,
            last_read_at: None,
        })?;
        Ok(())
    }

    /// Store the sealed frame as a placeholder row so the log keeps its
    /// position, and surface it to the UI.  Only text frames are parked;
    /// a lost edit or delete leaves the target at its previous state.
    async fn park_undecryptable(
        &self,
        frame: &Frame,
        envelope: &EncryptedEnvelope,
    ) -> Result<Applied> {
        if frame.kind != FrameKind::Text {
            warn!(
                message = %frame.message_id,
                kind = ?frame.kind,
                "dropping undecryptable control frame"
            );
            return Ok(Applied::default());
        }

        let message = Message {
            id: frame.message_id,
            conversation_id: frame.conversation_id,
            sender: frame.sender,
            sender_device: frame.sender_device,
            body: None,
            ciphertext: Some(bincode::serialize(envelope)?),
            is_encrypted: true,
            is_outgoing: false,
            reply_to: None,
            timestamp: frame.sent_at,
            status: MessageStatus::Delivered,
            edited_at: None,
            deleted_at: None,
            local_only: false,
        };
        let inserted = {
            let guard = self.db.lock().await;
            guard.upsert_message(&message)?
        };
        if inserted {
            self.events.emit(ClientEvent::MessageUndecryptable {
                conversation_id: frame.conversation_id,
                message_id: frame.message_id,
            });
        }

        // The frame still reached this device; confirm delivery so the
        // sender does not keep resending a body we cannot read yet.
        Ok(Applied {
            confirm_delivered: Some((
                frame.sender,
                frame.conversation_id,
                vec![frame.message_id],
            )),
        })
    }

    /// Re-attempt parked ciphertexts from one peer device after its
    /// session was rebuilt.
    async fn retry_undecrypted(&self, peer: &UserId, device: DeviceId) -> Result<()> {
        let parked = {
            let guard = self.db.lock().await;
            guard.undecrypted_from_peer(peer, device)?
        };
        if parked.is_empty() {
            return Ok(());
        }
        debug!(peer = %peer, count = parked.len(), "retrying parked ciphertexts");

        let self_user = self.identity.user_id();
        let self_device = self.identity.device_id();
        for message in parked {
            let Some(ciphertext) = &message.ciphertext else {
                continue;
            };
            let envelope: EncryptedEnvelope = match bincode::deserialize(ciphertext) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(message = %message.id, error = %e, "parked ciphertext is unreadable");
                    continue;
                }
            };
            let aad = frame_aad(peer, device, &self_user, self_device, &message.id);
            match self
                .cipher
                .decrypt_from_device(peer, device, &envelope, &aad)
                .await
            {
                Ok(inbound) => {
                    if let Ok(MessageBody::Text { text, .. }) =
                        MessageBody::from_bytes(&inbound.plaintext)
                    {
                        let guard = self.db.lock().await;
                        guard.set_decrypted_body(message.id, &text)?;
                        drop(guard);
                        self.events.emit(ClientEvent::MessageAdded {
                            conversation_id: message.conversation_id,
                            message_id: message.id,
                        });
                    }
                }
                Err(e) => {
                    debug!(message = %message.id, error = %e, "parked ciphertext still undecryptable");
                }
            }
        }
        Ok(())
    }
}
