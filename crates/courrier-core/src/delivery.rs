//! The delivery coordinator.
//!
//! Sends never talk to the network synchronously: every outbound frame is
//! written to the durable outbox first and a worker drains due entries
//! whenever the connection is up.  Each attempt tries the direct peer
//! channel, then the relay behind a circuit breaker.  Failures are either
//! retried on a backoff schedule or, when the budget runs out or the
//! relay refuses the frame outright, resolved through the optimistic
//! ledger so the local state rolls back.
//!
//! Encryption happens at most once per message: the sealed frames are
//! cached on the outbox entry, so retries republish the same envelopes
//! instead of advancing the ratchet again.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use courrier_shared::constants::{MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
use courrier_shared::protocol::{Frame, FrameContent, FrameKind, MessageBody};
use courrier_shared::types::{ConversationId, DeviceId, MessageId, MessageStatus, UserId};
use courrier_store::{Database, OutboxEntry};

use crate::breaker::CircuitBreaker;
use crate::config::CoreConfig;
use crate::direct::DirectChannel;
use crate::error::{CoreError, DirectoryError, Result};
use crate::events::{ClientEvent, DegradationKind, EventBus};
use crate::identity::DeviceIdentityStore;
use crate::ledger::{OptimisticLedger, Rollback};
use crate::monitor::ConnectionMonitor;
use crate::relay::RelayChannel;
use crate::session::{frame_aad, SessionCipher};

/// What preparing an outbox entry produced.
enum Prepared {
    Frames(Vec<Frame>),
    /// Directory unreachable; worth retrying.
    DirectoryDown(String),
    /// No way this entry can ever be delivered.
    Refused(String),
}

pub struct DeliveryCoordinator {
    db: Arc<Mutex<Database>>,
    cipher: Arc<SessionCipher>,
    identity: Arc<DeviceIdentityStore>,
    relay: Arc<dyn RelayChannel>,
    direct: Arc<dyn DirectChannel>,
    monitor: Arc<ConnectionMonitor>,
    breaker: CircuitBreaker,
    ledger: Arc<OptimisticLedger>,
    events: EventBus,
    config: CoreConfig,
    wake: Notify,
    /// Outbox entries with a live ledger entry to resolve.  In-memory
    /// only: after a restart, terminal failures fall back to marking the
    /// message row directly.
    tracked: StdMutex<HashMap<MessageId, Uuid>>,
}

impl DeliveryCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Mutex<Database>>,
        cipher: Arc<SessionCipher>,
        identity: Arc<DeviceIdentityStore>,
        relay: Arc<dyn RelayChannel>,
        direct: Arc<dyn DirectChannel>,
        monitor: Arc<ConnectionMonitor>,
        ledger: Arc<OptimisticLedger>,
        events: EventBus,
        config: CoreConfig,
    ) -> Self {
        Self {
            breaker: CircuitBreaker::new(config.breaker.clone()),
            db,
            cipher,
            identity,
            relay,
            direct,
            monitor,
            ledger,
            events,
            config,
            wake: Notify::new(),
            tracked: StdMutex::new(HashMap::new()),
        }
    }

    /// Queue one frame body for durable delivery.  The caller has already
    /// applied the optimistic local state; `rollback` undoes it if
    /// delivery fails for good.
    pub async fn submit(
        &self,
        message_id: MessageId,
        conversation_id: ConversationId,
        recipient: UserId,
        body: &MessageBody,
        rollback: Option<Rollback>,
    ) -> Result<()> {
        let bytes = body.to_bytes()?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(CoreError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let now = Utc::now().timestamp_millis();
        let entry = OutboxEntry {
            message_id,
            conversation_id,
            recipient,
            kind: body.kind(),
            body: bytes,
            prepared: None,
            created_at_ms: now,
            next_retry_ms: now,
            tries: 0,
        };
        let inserted = {
            let guard = self.db.lock().await;
            guard.outbox_enqueue(&entry)?
        };
        if !inserted {
            debug!(message = %message_id, "already queued, ignoring duplicate submit");
            return Ok(());
        }

        if let Some(rollback) = rollback {
            let ledger_id = self.ledger.add(entry.kind.as_str(), rollback);
            self.tracked
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(message_id, ledger_id);
        }
        debug!(message = %message_id, kind = entry.kind.as_str(), "queued for delivery");
        self.wake.notify_one();
        Ok(())
    }

    /// Fire-and-forget delivery for ephemeral frames (typing).  Never
    /// queued, never retried; silently dropped when nothing is reachable.
    pub async fn send_transient(
        &self,
        conversation_id: ConversationId,
        recipient: UserId,
        body: MessageBody,
    ) -> Result<()> {
        let frame = self.build_frame(
            body.kind(),
            MessageId::new(),
            conversation_id,
            recipient,
            DeviceId(0),
            Utc::now(),
            FrameContent::Plain(body),
        );
        if self.direct_enabled() && self.direct.send_direct(&recipient, &frame).await {
            return Ok(());
        }
        if !self.breaker.try_acquire().await {
            debug!("relay circuit open, dropping transient frame");
            return Ok(());
        }
        match self.relay.publish(&frame).await {
            Ok(()) => self.breaker.record_success().await,
            Err(e) if e.is_retryable() => {
                self.breaker.record_failure().await;
                debug!(error = %e, "transient frame dropped");
            }
            Err(e) => {
                self.breaker.record_success().await;
                debug!(error = %e, "transient frame refused");
            }
        }
        Ok(())
    }

    /// Pull a message out of the queue before it reaches the network.
    /// Returns whether an entry was still there to remove.
    pub async fn cancel(&self, message_id: MessageId) -> Result<bool> {
        let removed = {
            let guard = self.db.lock().await;
            guard.outbox_remove(message_id)?
        };
        if removed {
            // The optimistic state stays as the caller leaves it; resolve
            // the ledger entry without running its rollback.
            if let Some(ledger_id) = self.take_tracking(message_id) {
                self.ledger.confirm(ledger_id);
            }
            debug!(message = %message_id, "send cancelled before delivery");
        }
        Ok(removed)
    }

    /// Worker loop: drain due outbox entries while online, re-register
    /// identity material after reconnects, stop on shutdown signal.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut connection = self.monitor.subscribe();
        info!("delivery worker started");
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.outbox_tick) => {}
                _ = self.wake.notified() => {}
                res = connection.changed() => {
                    if res.is_err() {
                        break;
                    }
                    if self.monitor.status().is_online() {
                        if let Err(e) = self.identity.ensure_registered().await {
                            warn!(error = %e, "post-reconnect key upkeep failed");
                        }
                    }
                }
            }
            if !self.monitor.status().is_online() {
                continue;
            }
            if let Err(e) = self.drain().await {
                warn!(error = %e, "outbox drain failed");
            }
        }
        info!("delivery worker stopped");
    }

    // ------------------------------------------------------------------
    // Attempt pipeline
    // ------------------------------------------------------------------

    async fn drain(&self) -> Result<()> {
        let due = {
            let guard = self.db.lock().await;
            guard.outbox_due(Utc::now().timestamp_millis(), self.config.outbox_batch)?
        };
        for entry in due {
            let id = entry.message_id;
            if let Err(e) = self.attempt(entry).await {
                warn!(message = %id, error = %e, "delivery attempt errored");
            }
        }
        Ok(())
    }

    async fn attempt(&self, entry: OutboxEntry) -> Result<()> {
        let frames = if let Some(prepared) = &entry.prepared {
            bincode::deserialize::<Vec<Frame>>(prepared)?
        } else {
            match self.prepare(&entry).await? {
                Prepared::Frames(frames) => frames,
                Prepared::DirectoryDown(reason) => {
                    debug!(message = %entry.message_id, reason, "directory unreachable");
                    return self.bump_or_fail(&entry).await;
                }
                Prepared::Refused(reason) => {
                    return self.fail_terminal(&entry, &reason).await;
                }
            }
        };

        let direct_attempted = self.direct_enabled();
        let mut relay_queue = Vec::new();
        let mut direct_sent = 0usize;
        for frame in &frames {
            if direct_attempted && self.direct.send_direct(&entry.recipient, frame).await {
                direct_sent += 1;
            } else {
                relay_queue.push(frame);
            }
        }

        if relay_queue.is_empty() {
            debug!(
                message = %entry.message_id,
                frames = direct_sent,
                "delivered via direct channel"
            );
            return self.finish_success(&entry, 0, direct_attempted).await;
        }

        if !self.breaker.try_acquire().await {
            let hold = self
                .breaker
                .until_trial()
                .await
                .unwrap_or(self.config.breaker.reset_timeout);
            let until = Utc::now().timestamp_millis() + hold.as_millis() as i64;
            {
                let guard = self.db.lock().await;
                guard.outbox_defer(entry.message_id, until)?;
            }
            debug!(
                message = %entry.message_id,
                hold_ms = hold.as_millis() as u64,
                "relay circuit open, deferring"
            );
            return Ok(());
        }

        let relayed = relay_queue.len();
        for frame in relay_queue {
            match self.relay.publish(frame).await {
                Ok(()) => self.breaker.record_success().await,
                Err(e) if e.is_retryable() => {
                    self.breaker.record_failure().await;
                    debug!(message = %entry.message_id, error = %e, "relay publish failed");
                    return self.bump_or_fail(&entry).await;
                }
                Err(e) => {
                    // The relay answered; its refusal is not an outage.
                    self.breaker.record_success().await;
                    return self.fail_terminal(&entry, &e.to_string()).await;
                }
            }
        }
        self.finish_success(&entry, relayed, direct_attempted).await
    }

    /// Build (or refuse to build) the per-device frames for one entry,
    /// caching them on success so retries skip straight to publishing.
    async fn prepare(&self, entry: &OutboxEntry) -> Result<Prepared> {
        let body = match MessageBody::from_bytes(&entry.body) {
            Ok(body) => body,
            Err(e) => return Ok(Prepared::Refused(format!("outbox body unreadable: {e}"))),
        };
        // Retries keep the original send time so the peer's merge order
        // does not shift.
        let sent_at =
            DateTime::from_timestamp_millis(entry.created_at_ms).unwrap_or_else(Utc::now);

        let frames = if body.wants_encryption() {
            match self.cipher.sessions_for_peer(&entry.recipient).await {
                Ok(devices) => {
                    let mut frames = Vec::with_capacity(devices.len());
                    for device in devices {
                        let aad = frame_aad(
                            &self.identity.user_id(),
                            self.identity.device_id(),
                            &entry.recipient,
                            device,
                            &entry.message_id,
                        );
                        let envelope = self
                            .cipher
                            .encrypt_for_device(&entry.recipient, device, &entry.body, &aad)
                            .await?;
                        frames.push(self.build_frame(
                            entry.kind,
                            entry.message_id,
                            entry.conversation_id,
                            entry.recipient,
                            device,
                            sent_at,
                            FrameContent::Encrypted(envelope),
                        ));
                    }
                    frames
                }
                Err(CoreError::Directory(e)) => match e {
                    e if e.is_missing_keys() && self.config.allow_plaintext_fallback => {
                        self.degrade_to_plaintext(entry).await?;
                        vec![self.build_frame(
                            entry.kind,
                            entry.message_id,
                            entry.conversation_id,
                            entry.recipient,
                            DeviceId(0),
                            sent_at,
                            FrameContent::Plain(body),
                        )]
                    }
                    DirectoryError::Unavailable(reason) => {
                        return Ok(Prepared::DirectoryDown(reason))
                    }
                    other => return Ok(Prepared::Refused(other.to_string())),
                },
                Err(other) => return Err(other),
            }
        } else {
            // Structural metadata goes out readable, one frame per peer.
            vec![self.build_frame(
                entry.kind,
                entry.message_id,
                entry.conversation_id,
                entry.recipient,
                DeviceId(0),
                sent_at,
                FrameContent::Plain(body),
            )]
        };

        {
            let guard = self.db.lock().await;
            guard.outbox_set_prepared(entry.message_id, &bincode::serialize(&frames)?)?;
        }
        Ok(Prepared::Frames(frames))
    }

    async fn degrade_to_plaintext(&self, entry: &OutboxEntry) -> Result<()> {
        warn!(
            message = %entry.message_id,
            peer = %entry.recipient,
            "peer has no published keys, sending in the clear"
        );
        self.events.emit(ClientEvent::DeliveryDegraded {
            message_id: entry.message_id,
            kind: DegradationKind::PlaintextFallback,
        });
        if entry.kind == FrameKind::Text {
            let guard = self.db.lock().await;
            guard.set_message_encrypted(entry.message_id, false)?;
        }
        Ok(())
    }

    async fn finish_success(
        &self,
        entry: &OutboxEntry,
        relayed: usize,
        direct_attempted: bool,
    ) -> Result<()> {
        {
            let guard = self.db.lock().await;
            guard.outbox_remove(entry.message_id)?;
        }
        if let Some(ledger_id) = self.take_tracking(entry.message_id) {
            self.ledger.confirm(ledger_id);
        }

        if direct_attempted && relayed > 0 {
            warn!(
                message = %entry.message_id,
                "direct channel refused frame, delivered via relay"
            );
            self.events.emit(ClientEvent::DeliveryDegraded {
                message_id: entry.message_id,
                kind: DegradationKind::RelayFallback,
            });
        }

        if entry.kind == FrameKind::Text {
            let changed = {
                let guard = self.db.lock().await;
                match guard.advance_status(entry.message_id, MessageStatus::Sent) {
                    Ok(changed) => changed,
                    Err(courrier_store::StoreError::NotFound) => None,
                    Err(e) => return Err(e.into()),
                }
            };
            if changed.is_some() {
                self.events.emit(ClientEvent::MessageStatusChanged {
                    conversation_id: entry.conversation_id,
                    message_ids: vec![entry.message_id],
                    status: MessageStatus::Sent,
                });
            }
        }
        info!(message = %entry.message_id, kind = entry.kind.as_str(), "frame delivered");
        Ok(())
    }

    async fn bump_or_fail(&self, entry: &OutboxEntry) -> Result<()> {
        let attempt = entry.tries + 1;
        if attempt >= self.config.retry.max_attempts {
            return self.fail_terminal(entry, "retry budget exhausted").await;
        }
        let delay = self.config.retry.delay_for(attempt);
        let next = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let tries = {
            let guard = self.db.lock().await;
            guard.outbox_bump_retry(entry.message_id, next)?
        };
        debug!(
            message = %entry.message_id,
            tries,
            retry_in_ms = delay.as_millis() as u64,
            "delivery attempt failed, queued for retry"
        );
        Ok(())
    }

    async fn fail_terminal(&self, entry: &OutboxEntry, reason: &str) -> Result<()> {
        warn!(
            message = %entry.message_id,
            tries = entry.tries,
            reason,
            "delivery failed permanently"
        );
        {
            let guard = self.db.lock().await;
            guard.outbox_remove(entry.message_id)?;
        }
        match self.take_tracking(entry.message_id) {
            Some(ledger_id) => self.ledger.fail(ledger_id),
            // Restart lost the ledger entry; resolve the row directly.
            None => {
                if entry.kind == FrameKind::Text {
                    let changed = {
                        let guard = self.db.lock().await;
                        match guard.advance_status(entry.message_id, MessageStatus::Failed) {
                            Ok(changed) => changed,
                            Err(courrier_store::StoreError::NotFound) => None,
                            Err(e) => return Err(e.into()),
                        }
                    };
                    if changed.is_some() {
                        self.events.emit(ClientEvent::MessageStatusChanged {
                            conversation_id: entry.conversation_id,
                            message_ids: vec![entry.message_id],
                            status: MessageStatus::Failed,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn direct_enabled(&self) -> bool {
        self.config.direct_enabled && self.direct.is_available()
    }

    fn take_tracking(&self, message_id: MessageId) -> Option<Uuid> {
        self.tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&message_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_frame(
        &self,
        kind: FrameKind,
        message_id: MessageId,
        conversation_id: ConversationId,
        recipient: UserId,
        recipient_device: DeviceId,
        sent_at: DateTime<Utc>,
        content: FrameContent,
    ) -> Frame {
        Frame {
            version: PROTOCOL_VERSION,
            kind,
            message_id,
            conversation_id,
            sender: self.identity.user_id(),
            sender_device: self.identity.device_id(),
            recipient,
            recipient_device,
            sent_at,
            content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direct::{LoopbackDirectChannel, NullDirectChannel};
    use crate::directory::{DirectoryClient, InMemoryDirectory};
    use crate::relay::InMemoryRelay;
    use courrier_shared::types::ConnectionStatus;
    use courrier_store::{Conversation, Message};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        db: Arc<Mutex<Database>>,
        directory: Arc<InMemoryDirectory>,
        relay: Arc<InMemoryRelay>,
        monitor: Arc<ConnectionMonitor>,
        ledger: Arc<OptimisticLedger>,
        events: EventBus,
        identity: Arc<DeviceIdentityStore>,
        coordinator: Arc<DeliveryCoordinator>,
    }

    async fn harness(config: CoreConfig, direct: Arc<dyn DirectChannel>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Mutex::new(
            Database::open_at(&dir.path().join("test.db"), &[0u8; 32]).unwrap(),
        ));
        let directory = Arc::new(InMemoryDirectory::new());
        let relay = Arc::new(InMemoryRelay::new());
        let monitor = Arc::new(ConnectionMonitor::new(ConnectionStatus::Online));
        let ledger = Arc::new(OptimisticLedger::new(config.ledger_grace));
        let events = EventBus::new(64);
        let identity = Arc::new(
            DeviceIdentityStore::initialize(
                db.clone(),
                directory.clone() as Arc<dyn DirectoryClient>,
                &config,
            )
            .await
            .unwrap(),
        );
        let cipher = Arc::new(SessionCipher::new(db.clone(), identity.clone()));
        let coordinator = Arc::new(DeliveryCoordinator::new(
            db.clone(),
            cipher,
            identity.clone(),
            relay.clone() as Arc<dyn RelayChannel>,
            direct,
            monitor.clone(),
            ledger.clone(),
            events.clone(),
            config,
        ));
        Harness {
            _dir: dir,
            db,
            directory,
            relay,
            monitor,
            ledger,
            events,
            identity,
            coordinator,
        }
    }

    /// Register a standalone peer device in the directory and return its
    /// user id.  Its local store is throwaway; only the published bundle
    /// matters to these tests.
    async fn register_peer(directory: &Arc<InMemoryDirectory>) -> UserId {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Mutex::new(
            Database::open_at(&dir.path().join("peer.db"), &[0u8; 32]).unwrap(),
        ));
        let identity = DeviceIdentityStore::initialize(
            db,
            directory.clone() as Arc<dyn DirectoryClient>,
            &CoreConfig::default(),
        )
        .await
        .unwrap();
        identity.user_id()
    }

    async fn queue_text(
        h: &Harness,
        recipient: UserId,
        flag: Option<Arc<AtomicBool>>,
    ) -> (MessageId, ConversationId) {
        let id = MessageId::new();
        let conversation = ConversationId::direct(&h.identity.user_id(), &recipient);
        {
            let guard = h.db.lock().await;
            guard
                .upsert_conversation(&Conversation {
                    id: conversation,
                    peer: recipient,
                    created_at: Utc::now(),
                    archived: false,
                    last_read_at: None,
                })
                .unwrap();
            guard
                .upsert_message(&Message {
                    id,
                    conversation_id: conversation,
                    sender: h.identity.user_id(),
                    sender_device: h.identity.device_id(),
                    body: Some("salut".into()),
                    ciphertext: None,
                    is_encrypted: true,
                    is_outgoing: true,
                    reply_to: None,
                    timestamp: Utc::now(),
                    status: MessageStatus::Pending,
                    edited_at: None,
                    deleted_at: None,
                    local_only: false,
                })
                .unwrap();
        }
        let rollback: Option<Rollback> = flag.map(|flag| {
            Box::new(move || {
                flag.store(true, Ordering::SeqCst);
            }) as Rollback
        });
        h.coordinator
            .submit(
                id,
                conversation,
                recipient,
                &MessageBody::Text {
                    text: "salut".into(),
                    reply_to: None,
                },
                rollback,
            )
            .await
            .unwrap();
        (id, conversation)
    }

    #[tokio::test]
    async fn queued_offline_drains_after_reconnect() {
        let config = CoreConfig {
            outbox_tick: Duration::from_millis(20),
            ..CoreConfig::default()
        };
        let h = harness(config, Arc::new(NullDirectChannel)).await;
        h.monitor.set_status(ConnectionStatus::Offline);
        let peer = register_peer(&h.directory).await;

        let (id, _) = queue_text(&h, peer, None).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(h.coordinator.clone().run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(h.relay.accepted_count(), 0);
        assert_eq!(h.db.lock().await.outbox_len().unwrap(), 1);

        h.monitor.set_status(ConnectionStatus::Online);
        for _ in 0..100 {
            if h.db.lock().await.outbox_len().unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.db.lock().await.outbox_len().unwrap(), 0);
        assert_eq!(h.relay.accepted_count(), 1);
        assert_eq!(
            h.db.lock().await.get_message(id).unwrap().status,
            MessageStatus::Sent
        );

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn keyless_peer_falls_back_to_plaintext() {
        let h = harness(CoreConfig::default(), Arc::new(NullDirectChannel)).await;
        let stranger = UserId([77u8; 32]);
        let mut rx = h.events.subscribe();

        let (id, _) = queue_text(&h, stranger, None).await;
        h.coordinator.drain().await.unwrap();

        let stored = h.db.lock().await.get_message(id).unwrap();
        assert!(!stored.is_encrypted);
        assert_eq!(stored.status, MessageStatus::Sent);
        assert_eq!(h.relay.accepted_count(), 1);

        let mut saw_degradation = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(
                event,
                ClientEvent::DeliveryDegraded {
                    kind: DegradationKind::PlaintextFallback,
                    ..
                }
            ) {
                saw_degradation = true;
            }
        }
        assert!(saw_degradation);
    }

    #[tokio::test]
    async fn keyless_peer_without_fallback_fails() {
        let config = CoreConfig {
            allow_plaintext_fallback: false,
            ..CoreConfig::default()
        };
        let h = harness(config, Arc::new(NullDirectChannel)).await;
        let stranger = UserId([78u8; 32]);
        let rolled_back = Arc::new(AtomicBool::new(false));

        queue_text(&h, stranger, Some(rolled_back.clone())).await;
        h.coordinator.drain().await.unwrap();

        assert!(rolled_back.load(Ordering::SeqCst));
        assert_eq!(h.db.lock().await.outbox_len().unwrap(), 0);
        assert_eq!(h.relay.accepted_count(), 0);
    }

    #[tokio::test]
    async fn relay_outage_trips_breaker_without_eating_retries() {
        let config = CoreConfig {
            retry: crate::config::RetryPolicy {
                base_delay_ms: 1,
                jitter_pct: 0,
                max_attempts: 20,
                ..Default::default()
            },
            breaker: crate::config::BreakerPolicy {
                failure_threshold: 5,
                reset_timeout: Duration::from_millis(150),
            },
            ..CoreConfig::default()
        };
        let h = harness(config, Arc::new(NullDirectChannel)).await;
        let peer = register_peer(&h.directory).await;
        h.relay.set_unavailable(true);

        let (id, _) = queue_text(&h, peer, None).await;

        // Five failed attempts open the circuit.
        for _ in 0..5 {
            h.coordinator.drain().await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let entry = h.db.lock().await.outbox_get(id).unwrap().unwrap();
        assert_eq!(entry.tries, 5);

        // With the circuit open the attempt is deferred, not counted.
        h.coordinator.drain().await.unwrap();
        let entry = h.db.lock().await.outbox_get(id).unwrap().unwrap();
        assert_eq!(entry.tries, 5);
        assert!(entry.next_retry_ms > Utc::now().timestamp_millis());

        // After the reset timeout the half-open trial goes through and
        // the queue drains.
        h.relay.set_unavailable(false);
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.coordinator.drain().await.unwrap();
        assert_eq!(h.db.lock().await.outbox_len().unwrap(), 0);
        assert_eq!(
            h.db.lock().await.get_message(id).unwrap().status,
            MessageStatus::Sent
        );
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_rolls_back() {
        let config = CoreConfig {
            retry: crate::config::RetryPolicy {
                base_delay_ms: 1,
                jitter_pct: 0,
                max_attempts: 2,
                ..Default::default()
            },
            breaker: crate::config::BreakerPolicy {
                failure_threshold: 50,
                reset_timeout: Duration::from_secs(30),
            },
            ..CoreConfig::default()
        };
        let h = harness(config, Arc::new(NullDirectChannel)).await;
        let peer = register_peer(&h.directory).await;
        h.relay.set_unavailable(true);
        let rolled_back = Arc::new(AtomicBool::new(false));

        let (id, _) = queue_text(&h, peer, Some(rolled_back.clone())).await;

        h.coordinator.drain().await.unwrap();
        assert!(!rolled_back.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(5)).await;

        h.coordinator.drain().await.unwrap();
        assert!(rolled_back.load(Ordering::SeqCst));
        assert_eq!(h.db.lock().await.outbox_len().unwrap(), 0);
        assert!(h.db.lock().await.outbox_get(id).unwrap().is_none());
    }

    #[tokio::test]
    async fn direct_channel_bypasses_relay() {
        let direct = Arc::new(LoopbackDirectChannel::new());
        let h = harness(CoreConfig::default(), direct.clone()).await;
        let peer = register_peer(&h.directory).await;
        let mut inbox = direct.register(peer);

        let (id, _) = queue_text(&h, peer, None).await;
        h.coordinator.drain().await.unwrap();

        assert_eq!(h.relay.accepted_count(), 0);
        assert_eq!(direct.delivered_count(), 1);
        let frame = inbox.recv().await.unwrap();
        assert_eq!(frame.message_id, id);
        assert!(frame.is_encrypted());
        assert_eq!(
            h.db.lock().await.get_message(id).unwrap().status,
            MessageStatus::Sent
        );
    }

    #[tokio::test]
    async fn direct_refusal_falls_back_to_relay_with_event() {
        let direct = Arc::new(LoopbackDirectChannel::new());
        let h = harness(CoreConfig::default(), direct.clone()).await;
        let peer = register_peer(&h.directory).await;
        // Peer never registers an inbox: direct is up but refuses.
        let mut rx = h.events.subscribe();

        let (id, _) = queue_text(&h, peer, None).await;
        h.coordinator.drain().await.unwrap();

        assert_eq!(h.relay.accepted_count(), 1);
        assert_eq!(
            h.db.lock().await.get_message(id).unwrap().status,
            MessageStatus::Sent
        );

        let mut saw_fallback = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(
                event,
                ClientEvent::DeliveryDegraded {
                    kind: DegradationKind::RelayFallback,
                    ..
                }
            ) {
                saw_fallback = true;
            }
        }
        assert!(saw_fallback);
    }

    #[tokio::test]
    async fn cancel_removes_entry_without_rollback() {
        let h = harness(CoreConfig::default(), Arc::new(NullDirectChannel)).await;
        h.monitor.set_status(ConnectionStatus::Offline);
        let peer = register_peer(&h.directory).await;
        let rolled_back = Arc::new(AtomicBool::new(false));

        let (id, _) = queue_text(&h, peer, Some(rolled_back.clone())).await;
        assert_eq!(h.ledger.pending_count(), 1);

        assert!(h.coordinator.cancel(id).await.unwrap());
        assert_eq!(h.db.lock().await.outbox_len().unwrap(), 0);
        assert!(!rolled_back.load(Ordering::SeqCst));
        assert_eq!(h.ledger.pending_count(), 0);

        // Nothing left to cancel.
        assert!(!h.coordinator.cancel(id).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_submit_is_ignored() {
        let h = harness(CoreConfig::default(), Arc::new(NullDirectChannel)).await;
        h.monitor.set_status(ConnectionStatus::Offline);
        let peer = register_peer(&h.directory).await;

        let (id, conversation) = queue_text(&h, peer, None).await;
        h.coordinator
            .submit(
                id,
                conversation,
                peer,
                &MessageBody::Text {
                    text: "salut".into(),
                    reply_to: None,
                },
                Some(Box::new(|| {})),
            )
            .await
            .unwrap();

        assert_eq!(h.db.lock().await.outbox_len().unwrap(), 1);
        // The duplicate never reached the ledger.
        assert_eq!(h.ledger.pending_count(), 0);
    }

    #[tokio::test]
    async fn oversized_body_is_refused() {
        let h = harness(CoreConfig::default(), Arc::new(NullDirectChannel)).await;
        let peer = register_peer(&h.directory).await;

        let err = h
            .coordinator
            .submit(
                MessageId::new(),
                ConversationId::new(),
                peer,
                &MessageBody::Text {
                    text: "x".repeat(MAX_MESSAGE_SIZE + 1),
                    reply_to: None,
                },
                None,
            )
            .await
            .err();
        assert!(matches!(err, Some(CoreError::MessageTooLarge { .. })));
        assert_eq!(h.db.lock().await.outbox_len().unwrap(), 0);
    }
}
