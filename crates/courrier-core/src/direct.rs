//! The direct peer channel seam.
//!
//! Direct delivery is strictly best-effort: `false` from
//! [`DirectChannel::send_direct`] means "did not get there", and the
//! delivery coordinator falls back to the relay without treating it as an
//! error.  The offer/answer negotiation that would establish a real
//! point-to-point transport is not part of this core; [`NullDirectChannel`]
//! is the production default until one exists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use courrier_shared::protocol::Frame;
use courrier_shared::types::UserId;

#[async_trait]
pub trait DirectChannel: Send + Sync {
    /// Whether a direct transport exists at all.  When `false` the
    /// delivery coordinator goes straight to the relay and does not count
    /// that as a degradation.
    fn is_available(&self) -> bool {
        false
    }

    /// Push a frame straight to a peer device.  `true` only when the peer
    /// channel accepted it; any failure mode returns `false`.
    async fn send_direct(&self, peer: &UserId, frame: &Frame) -> bool;
}

/// No direct transport available; every send falls back to the relay.
#[derive(Default)]
pub struct NullDirectChannel;

#[async_trait]
impl DirectChannel for NullDirectChannel {
    async fn send_direct(&self, _peer: &UserId, _frame: &Frame) -> bool {
        false
    }
}

/// In-process direct channel for tests: peers register an inbox and
/// frames are handed over without any relay involvement.
#[derive(Default)]
pub struct LoopbackDirectChannel {
    inboxes: Mutex<HashMap<UserId, mpsc::UnboundedSender<Frame>>>,
    delivered: AtomicU32,
}

impl LoopbackDirectChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `peer` reachable and return the receiving end of its inbox.
    pub fn register(&self, peer: UserId) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer, tx);
        rx
    }

    /// Simulate the peer going offline.
    pub fn unregister(&self, peer: &UserId) {
        self.inboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer);
    }

    pub fn delivered_count(&self) -> u32 {
        self.delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectChannel for LoopbackDirectChannel {
    fn is_available(&self) -> bool {
        true
    }

    async fn send_direct(&self, peer: &UserId, frame: &Frame) -> bool {
        let sent = {
            let inboxes = self.inboxes.lock().unwrap_or_else(|e| e.into_inner());
            match inboxes.get(peer) {
                Some(tx) => tx.send(frame.clone()).is_ok(),
                None => false,
            }
        };
        if sent {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
        sent
    }
}
