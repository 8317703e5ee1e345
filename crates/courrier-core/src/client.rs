//! The client facade.
//!
//! One `Courrier` value owns the store, the device identity, the ratchet
//! sessions, the delivery worker and the per-conversation event pumps.
//! Every user-facing operation follows the same shape: apply locally
//! first, emit the UI event, then queue the frame with a rollback that
//! undoes the local change if delivery fails for good.  The UI never
//! waits on the network.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use courrier_shared::constants::MAX_MESSAGE_SIZE;
use courrier_shared::identity::IdentityExport;
use courrier_shared::protocol::{Frame, MessageBody, RelayEvent};
use courrier_shared::types::{
    ConnectionStatus, ConversationId, DeviceId, MessageId, MessageStatus, UserId,
};
use courrier_store::{Conversation, ConversationSummary, Database, Message};

use crate::config::CoreConfig;
use crate::delivery::DeliveryCoordinator;
use crate::direct::DirectChannel;
use crate::directory::DirectoryClient;
use crate::error::{CoreError, Result};
use crate::events::{ClientEvent, EventBus};
use crate::identity::DeviceIdentityStore;
use crate::ledger::{EntrySnapshot, OptimisticLedger, Rollback};
use crate::monitor::ConnectionMonitor;
use crate::reconcile::{Applied, SyncReconciler};
use crate::relay::{RelayChannel, Subscription};
use crate::session::SessionCipher;

pub struct Courrier {
    db: Arc<Mutex<Database>>,
    identity: Arc<DeviceIdentityStore>,
    reconciler: Arc<SyncReconciler>,
    delivery: Arc<DeliveryCoordinator>,
    relay: Arc<dyn RelayChannel>,
    monitor: Arc<ConnectionMonitor>,
    ledger: Arc<OptimisticLedger>,
    events: EventBus,
    /// One event pump task per open conversation.
    pumps: StdMutex<HashMap<ConversationId, JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl Courrier {
    /// Open the local store, load or create the device identity, and
    /// start the delivery worker.  The client comes up offline; the
    /// embedding application reports reachability through
    /// [`Courrier::set_connection_status`].
    pub async fn start(
        db_path: &Path,
        db_key: &[u8; 32],
        directory: Arc<dyn DirectoryClient>,
        relay: Arc<dyn RelayChannel>,
        direct: Arc<dyn DirectChannel>,
        config: CoreConfig,
    ) -> Result<Self> {
        Self::start_inner(db_path, db_key, None, directory, relay, direct, config).await
    }

    /// Like [`Courrier::start`], but adopt an exported identity on a
    /// fresh store instead of minting one.  Pairs with
    /// [`Courrier::export_identity`] to enroll the same account on a new
    /// device.
    pub async fn start_with_identity(
        db_path: &Path,
        db_key: &[u8; 32],
        export: &IdentityExport,
        directory: Arc<dyn DirectoryClient>,
        relay: Arc<dyn RelayChannel>,
        direct: Arc<dyn DirectChannel>,
        config: CoreConfig,
    ) -> Result<Self> {
        Self::start_inner(db_path, db_key, Some(export), directory, relay, direct, config).await
    }

    async fn start_inner(
        db_path: &Path,
        db_key: &[u8; 32],
        imported: Option<&IdentityExport>,
        directory: Arc<dyn DirectoryClient>,
        relay: Arc<dyn RelayChannel>,
        direct: Arc<dyn DirectChannel>,
        config: CoreConfig,
    ) -> Result<Self> {
        let db = Arc::new(Mutex::new(Database::open_at(db_path, db_key)?));
        let events = EventBus::new(256);
        let monitor = Arc::new(ConnectionMonitor::new(ConnectionStatus::Offline));
        let ledger = Arc::new(OptimisticLedger::new(config.ledger_grace));

        let identity = Arc::new(match imported {
            Some(export) => {
                DeviceIdentityStore::initialize_from_export(db.clone(), directory, &config, export)
                    .await?
            }
            None => DeviceIdentityStore::initialize(db.clone(), directory, &config).await?,
        });
        let cipher = Arc::new(SessionCipher::new(db.clone(), identity.clone()));
        let reconciler = Arc::new(SyncReconciler::new(
            db.clone(),
            cipher.clone(),
            identity.clone(),
            events.clone(),
        ));
        let delivery = Arc::new(DeliveryCoordinator::new(
            db.clone(),
            cipher,
            identity.clone(),
            relay.clone(),
            direct,
            monitor.clone(),
            ledger.clone(),
            events.clone(),
            config,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(delivery.clone().run(shutdown_rx));
        info!(
            user = %identity.user_id().short(),
            device = %identity.device_id(),
            "client started"
        );

        Ok(Self {
            db,
            identity,
            reconciler,
            delivery,
            relay,
            monitor,
            ledger,
            events,
            pumps: StdMutex::new(HashMap::new()),
            shutdown_tx,
            worker: StdMutex::new(Some(worker)),
        })
    }

    /// Stop the delivery worker and all conversation pumps.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let pumps: Vec<JoinHandle<()>> = {
            let mut map = self.pumps.lock().unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(_, handle)| handle).collect()
        };
        for handle in pumps {
            handle.abort();
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        info!("client stopped");
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Write the message locally as `pending` and queue it for delivery.
    /// Returns as soon as the row is durable; the worker does the rest.
    pub async fn send_text(
        &self,
        recipient: UserId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId> {
        let body = MessageBody::Text {
            text: text.to_string(),
            reply_to,
        };
        check_size(&body)?;

        let conversation_id = self.ensure_conversation(recipient).await?;
        let message_id = MessageId::new();
        let message = Message {
            id: message_id,
            conversation_id,
            sender: self.identity.user_id(),
            sender_device: self.identity.device_id(),
            body: Some(text.to_string()),
            ciphertext: None,
            is_encrypted: true,
            is_outgoing: true,
            reply_to,
            timestamp: Utc::now(),
            status: MessageStatus::Pending,
            edited_at: None,
            deleted_at: None,
            local_only: false,
        };
        {
            let guard = self.db.lock().await;
            guard.upsert_message(&message)?;
        }
        self.events.emit(ClientEvent::MessageAdded {
            conversation_id,
            message_id,
        });

        let rollback = self.fail_rollback(conversation_id, message_id);
        self.delivery
            .submit(message_id, conversation_id, recipient, &body, Some(rollback))
            .await?;
        info!(message = %message_id, peer = %recipient.short(), "text message queued");
        Ok(message_id)
    }

    /// Replace the body of one of our own messages, optimistically.
    pub async fn edit_message(&self, message_id: MessageId, new_text: &str) -> Result<()> {
        let body = MessageBody::Edit {
            target: message_id,
            new_text: new_text.to_string(),
        };
        check_size(&body)?;

        let (conversation_id, peer, previous_body, previous_edited) = {
            let guard = self.db.lock().await;
            let message = guard.get_message(message_id)?;
            if !message.is_outgoing || message.deleted_at.is_some() {
                return Err(CoreError::ImmutableMessage);
            }
            let conversation = guard.get_conversation(message.conversation_id)?;
            if !guard.apply_edit(message_id, new_text, Utc::now())? {
                return Err(CoreError::ImmutableMessage);
            }
            (
                message.conversation_id,
                conversation.peer,
                message.body,
                message.edited_at,
            )
        };
        self.events.emit(ClientEvent::MessageEdited {
            conversation_id,
            message_id,
        });

        let rollback = self.restore_rollback(conversation_id, message_id, previous_body, previous_edited);
        // The edit travels under its own frame id; the target id stays
        // with the original message.
        self.delivery
            .submit(MessageId::new(), conversation_id, peer, &body, Some(rollback))
            .await?;
        Ok(())
    }

    /// Soft-delete one of our own messages; peers blank it on receipt.
    pub async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        let (conversation_id, peer, previous_body, previous_edited) = {
            let guard = self.db.lock().await;
            let message = guard.get_message(message_id)?;
            if !message.is_outgoing {
                return Err(CoreError::ImmutableMessage);
            }
            if !guard.apply_delete(message_id, Utc::now())? {
                return Err(CoreError::ImmutableMessage);
            }
            let conversation = guard.get_conversation(message.conversation_id)?;
            (
                message.conversation_id,
                conversation.peer,
                message.body,
                message.edited_at,
            )
        };
        self.events.emit(ClientEvent::MessageDeleted {
            conversation_id,
            message_id,
        });

        let rollback = self.restore_rollback(conversation_id, message_id, previous_body, previous_edited);
        self.delivery
            .submit(
                MessageId::new(),
                conversation_id,
                peer,
                &MessageBody::Delete { target: message_id },
                Some(rollback),
            )
            .await?;
        Ok(())
    }

    /// Toggle our reaction on a message.  Returns whether the reaction is
    /// now present.
    pub async fn toggle_reaction(&self, message_id: MessageId, emoji: &str) -> Result<bool> {
        let user = self.identity.user_id();
        let (conversation_id, peer, added) = {
            let guard = self.db.lock().await;
            let message = guard.get_message(message_id)?;
            let conversation = guard.get_conversation(message.conversation_id)?;
            let added = if guard.remove_reaction(message_id, emoji, &user)? {
                false
            } else {
                guard.add_reaction(message_id, emoji, &user)?;
                true
            };
            (message.conversation_id, conversation.peer, added)
        };
        self.events.emit(ClientEvent::ReactionChanged {
            conversation_id,
            message_id,
            emoji: emoji.to_string(),
            user_id: user,
            added,
        });

        let rollback = self.reaction_rollback(conversation_id, message_id, emoji.to_string(), added);
        self.delivery
            .submit(
                MessageId::new(),
                conversation_id,
                peer,
                &MessageBody::Reaction {
                    target: message_id,
                    emoji: emoji.to_string(),
                    add: added,
                },
                Some(rollback),
            )
            .await?;
        Ok(added)
    }

    /// Notify the peer that we are typing.  Best effort, never queued.
    pub async fn send_typing(&self, conversation_id: ConversationId) -> Result<()> {
        let conversation = {
            let guard = self.db.lock().await;
            guard.get_conversation(conversation_id)?
        };
        self.delivery
            .send_transient(conversation_id, conversation.peer, MessageBody::Typing)
            .await
    }

    // ------------------------------------------------------------------
    // Cancel / resend
    // ------------------------------------------------------------------

    /// Pull a pending send out of the queue.  The message stays in the
    /// log as a local-only draft.
    pub async fn cancel_send(&self, message_id: MessageId) -> Result<()> {
        let message = {
            let guard = self.db.lock().await;
            guard.get_message(message_id)?
        };
        if message.status != MessageStatus::Pending {
            return Err(CoreError::CancelRefused(message.status));
        }
        if !self.delivery.cancel(message_id).await? {
            // A drain picked it up between our check and the removal.
            return Err(CoreError::CancelRefused(message.status));
        }
        {
            let guard = self.db.lock().await;
            guard.set_local_only(message_id, true)?;
        }
        info!(message = %message_id, "send cancelled, message kept locally");
        Ok(())
    }

    /// Put a failed or cancelled message back into the pipeline, under
    /// its original id so the recipient deduplicates.
    pub async fn resend_message(&self, message_id: MessageId) -> Result<()> {
        let message = {
            let guard = self.db.lock().await;
            guard.get_message(message_id)?
        };
        if !message.is_outgoing || message.deleted_at.is_some() {
            return Err(CoreError::ImmutableMessage);
        }
        if message.status != MessageStatus::Failed && !message.local_only {
            return Err(CoreError::ResendRefused(message.status));
        }
        let text = match message.body {
            Some(text) => text,
            None => return Err(CoreError::ImmutableMessage),
        };
        let peer = {
            let guard = self.db.lock().await;
            guard.get_conversation(message.conversation_id)?.peer
        };

        {
            let guard = self.db.lock().await;
            guard.reset_for_resend(message_id)?;
        }
        self.events.emit(ClientEvent::MessageStatusChanged {
            conversation_id: message.conversation_id,
            message_ids: vec![message_id],
            status: MessageStatus::Pending,
        });

        let rollback = self.fail_rollback(message.conversation_id, message_id);
        self.delivery
            .submit(
                message_id,
                message.conversation_id,
                peer,
                &MessageBody::Text {
                    text,
                    reply_to: message.reply_to,
                },
                Some(rollback),
            )
            .await?;
        info!(message = %message_id, "message requeued");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Subscribe to a conversation's relay stream and start merging its
    /// events.  Idempotent; a second open is a no-op.
    pub async fn open_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        {
            let pumps = self.pumps.lock().unwrap_or_else(|e| e.into_inner());
            if pumps.contains_key(&conversation_id) {
                return Ok(());
            }
        }
        let subscription = self.relay.subscribe(conversation_id).await?;
        let handle = tokio::spawn(pump_subscription(
            subscription,
            self.reconciler.clone(),
            self.delivery.clone(),
        ));
        let mut pumps = self.pumps.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = pumps.insert(conversation_id, handle) {
            previous.abort();
        }
        debug!(conversation = %conversation_id, "conversation opened");
        Ok(())
    }

    /// Stop the conversation's pump; dropping the subscription leaves
    /// the relay topic.
    pub fn close_conversation(&self, conversation_id: ConversationId) {
        let handle = {
            let mut pumps = self.pumps.lock().unwrap_or_else(|e| e.into_inner());
            pumps.remove(&conversation_id)
        };
        if let Some(handle) = handle {
            handle.abort();
            debug!(conversation = %conversation_id, "conversation closed");
        }
    }

    /// Merge a frame that arrived over the direct channel.  Same path as
    /// relayed events, so ordering and duplicates behave identically.
    pub async fn receive_direct(&self, frame: Frame) -> Result<()> {
        let applied = self.reconciler.apply(RelayEvent::NewMessage(frame)).await?;
        forward_receipts(&self.delivery, applied).await;
        Ok(())
    }

    /// Mark everything received in a conversation as read and send the
    /// peer one read receipt covering all of it.
    pub async fn mark_conversation_read(&self, conversation_id: ConversationId) -> Result<()> {
        let (peer, unread, changed) = {
            let guard = self.db.lock().await;
            let conversation = guard.get_conversation(conversation_id)?;
            let unread = guard.unread_inbound_ids(conversation_id)?;
            guard.set_last_read_at(conversation_id, Utc::now())?;
            let changed = guard.advance_status_bulk(&unread, MessageStatus::Read)?;
            (conversation.peer, unread, changed)
        };
        if !changed.is_empty() {
            self.events.emit(ClientEvent::MessageStatusChanged {
                conversation_id,
                message_ids: changed,
                status: MessageStatus::Read,
            });
        }
        if !unread.is_empty() {
            self.delivery
                .submit(
                    MessageId::new(),
                    conversation_id,
                    peer,
                    &MessageBody::Receipt {
                        ids: unread,
                        status: MessageStatus::Read,
                    },
                    None,
                )
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn conversations(&self, include_archived: bool) -> Result<Vec<ConversationSummary>> {
        let guard = self.db.lock().await;
        Ok(guard.conversation_summaries(include_archived)?)
    }

    /// Page through a conversation's log, newest first.
    pub async fn messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let guard = self.db.lock().await;
        Ok(guard.get_messages_for_conversation(conversation_id, limit, offset)?)
    }

    pub async fn reactions(
        &self,
        message_id: MessageId,
    ) -> Result<BTreeMap<String, BTreeSet<UserId>>> {
        let guard = self.db.lock().await;
        Ok(guard.reactions_for_message(message_id)?)
    }

    /// [`Courrier::messages`] with each message's reactions attached, so
    /// rendering a page of history costs two queries rather than one per
    /// row.
    pub async fn messages_with_reactions(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<(Message, BTreeMap<String, BTreeSet<UserId>>)>> {
        let guard = self.db.lock().await;
        let messages = guard.get_messages_for_conversation(conversation_id, limit, offset)?;
        let ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
        let mut grouped = guard.reactions_for_messages(&ids)?;
        Ok(messages
            .into_iter()
            .map(|message| {
                let reactions = grouped.remove(&message.id).unwrap_or_default();
                (message, reactions)
            })
            .collect())
    }

    pub async fn archive_conversation(
        &self,
        conversation_id: ConversationId,
        archived: bool,
    ) -> Result<()> {
        let guard = self.db.lock().await;
        Ok(guard.set_archived(conversation_id, archived)?)
    }

    /// Mutations applied locally but not yet confirmed by the network.
    pub fn pending_mutations(&self) -> Vec<EntrySnapshot> {
        self.ledger.snapshot()
    }

    // ------------------------------------------------------------------
    // Connection & identity
    // ------------------------------------------------------------------

    pub fn connection_status(&self) -> ConnectionStatus {
        self.monitor.status()
    }

    /// Called by the embedding application's reachability probe.
    pub fn set_connection_status(&self, status: ConnectionStatus) {
        if self.monitor.status() == status {
            return;
        }
        self.monitor.set_status(status);
        self.events.emit(ClientEvent::ConnectionChanged { status });
    }

    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        self.monitor.wait_for_connection(timeout).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn user_id(&self) -> UserId {
        self.identity.user_id()
    }

    pub fn device_id(&self) -> DeviceId {
        self.identity.device_id()
    }

    pub fn fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    /// Secret key material for enrolling another device.  Handle with care.
    pub fn export_identity(&self) -> IdentityExport {
        self.identity.export()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// The direct conversation with a peer; created on first contact.
    async fn ensure_conversation(&self, peer: UserId) -> Result<ConversationId> {
        let id = ConversationId::direct(&self.identity.user_id(), &peer);
        let conversation = Conversation {
            id,
            peer,
            created_at: Utc::now(),
            archived: false,
            last_read_at: None,
        };
        {
            let guard = self.db.lock().await;
            guard.upsert_conversation(&conversation)?;
        }
        Ok(id)
    }

    /// Rollback for a failed text send: mark the row failed.
    fn fail_rollback(&self, conversation_id: ConversationId, message_id: MessageId) -> Rollback {
        let db = self.db.clone();
        let events = self.events.clone();
        Box::new(move || {
            tokio::spawn(async move {
                let changed = {
                    let guard = db.lock().await;
                    guard.advance_status(message_id, MessageStatus::Failed)
                };
                if let Ok(Some(status)) = changed {
                    events.emit(ClientEvent::MessageStatusChanged {
                        conversation_id,
                        message_ids: vec![message_id],
                        status,
                    });
                }
            });
        })
    }

    /// Rollback for a rejected edit or delete: restore the prior content.
    fn restore_rollback(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        previous_body: Option<String>,
        previous_edited: Option<chrono::DateTime<Utc>>,
    ) -> Rollback {
        let db = self.db.clone();
        let events = self.events.clone();
        Box::new(move || {
            tokio::spawn(async move {
                let result = {
                    let guard = db.lock().await;
                    guard.restore_message_content(
                        message_id,
                        previous_body.as_deref(),
                        previous_edited,
                    )
                };
                match result {
                    Ok(()) => events.emit(ClientEvent::MessageEdited {
                        conversation_id,
                        message_id,
                    }),
                    Err(e) => warn!(
                        message = %message_id,
                        error = %e,
                        "failed to restore message after rejected mutation"
                    ),
                }
            });
        })
    }

    /// Rollback for a rejected reaction toggle: apply the inverse toggle.
    fn reaction_rollback(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        emoji: String,
        added: bool,
    ) -> Rollback {
        let db = self.db.clone();
        let events = self.events.clone();
        let user = self.identity.user_id();
        Box::new(move || {
            tokio::spawn(async move {
                let undone = {
                    let guard = db.lock().await;
                    if added {
                        guard.remove_reaction(message_id, &emoji, &user)
                    } else {
                        guard.add_reaction(message_id, &emoji, &user)
                    }
                };
                match undone {
                    Ok(true) => events.emit(ClientEvent::ReactionChanged {
                        conversation_id,
                        message_id,
                        emoji,
                        user_id: user,
                        added: !added,
                    }),
                    Ok(false) => {}
                    Err(e) => warn!(
                        message = %message_id,
                        error = %e,
                        "failed to undo reaction after rejected toggle"
                    ),
                }
            });
        })
    }
}

/// Drives one conversation subscription until it closes or is aborted.
async fn pump_subscription(
    mut subscription: Subscription,
    reconciler: Arc<SyncReconciler>,
    delivery: Arc<DeliveryCoordinator>,
) {
    let conversation = subscription.conversation_id();
    debug!(conversation = %conversation, "event pump started");
    while let Some(event) = subscription.recv().await {
        match reconciler.apply(event).await {
            Ok(applied) => forward_receipts(&delivery, applied).await,
            Err(e) => {
                warn!(conversation = %conversation, error = %e, "failed to apply relay event")
            }
        }
    }
    debug!(conversation = %conversation, "event pump ended");
}

/// Queue the delivery receipts a merge asked for.
async fn forward_receipts(delivery: &DeliveryCoordinator, applied: Applied) {
    if let Some((peer, conversation_id, ids)) = applied.confirm_delivered {
        let receipt = MessageBody::Receipt {
            ids,
            status: MessageStatus::Delivered,
        };
        if let Err(e) = delivery
            .submit(MessageId::new(), conversation_id, peer, &receipt, None)
            .await
        {
            warn!(conversation = %conversation_id, error = %e, "failed to queue delivery receipt");
        }
    }
}

fn check_size(body: &MessageBody) -> Result<()> {
    let size = body.to_bytes()?.len();
    if size > MAX_MESSAGE_SIZE {
        return Err(CoreError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}
