//! Connection monitor: holds the platform-reported reachability state and
//! lets tasks park until connectivity returns.
//!
//! Built on a tokio watch channel, so waiters suspend instead of polling.
//! The monitor never touches message state; the delivery worker observes
//! it and drives the queue itself.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::info;

use courrier_shared::types::ConnectionStatus;

#[derive(Debug, Clone, Copy)]
pub struct TransitionTimes {
    /// When the current status was entered.
    pub current_since: DateTime<Utc>,
    pub last_online_at: Option<DateTime<Utc>>,
    pub last_offline_at: Option<DateTime<Utc>>,
}

pub struct ConnectionMonitor {
    tx: watch::Sender<ConnectionStatus>,
    transitions: Mutex<TransitionTimes>,
}

impl ConnectionMonitor {
    pub fn new(initial: ConnectionStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            tx,
            transitions: Mutex::new(TransitionTimes {
                current_since: Utc::now(),
                last_online_at: initial.is_online().then(Utc::now),
                last_offline_at: (!initial.is_online()).then(Utc::now),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    pub fn transitions(&self) -> TransitionTimes {
        *self.transitions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a status change reported by the platform's reachability
    /// sensor.  No-op if the status is unchanged.
    pub fn set_status(&self, next: ConnectionStatus) {
        let previous = self.status();
        if previous == next {
            return;
        }

        {
            let mut times = self.transitions.lock().unwrap_or_else(|e| e.into_inner());
            let now = Utc::now();
            times.current_since = now;
            if next.is_online() {
                times.last_online_at = Some(now);
            } else {
                times.last_offline_at = Some(now);
            }
        }

        info!(from = %previous, to = %next, "Connection status changed");
        let _ = self.tx.send(next);
    }

    /// Watch handle for tasks that react to every transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }

    /// Resolve `true` as soon as the status is online, or `false` once
    /// `timeout` elapses.  Returns immediately when already online.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        if self.status().is_online() {
            return true;
        }
        let mut rx = self.tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| s.is_online()))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}
