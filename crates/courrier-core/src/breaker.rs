//! Circuit breaker guarding the relay channel.
//!
//! After a run of consecutive failures the circuit opens and delivery
//! attempts are refused without touching the network, so a degraded relay
//! is not hammered by every queued message at once.  When the reset
//! timeout elapses a single half-open trial is allowed through; its
//! outcome decides whether the circuit closes again or reopens.

use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::BreakerPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    policy: BreakerPolicy,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Ask to make one relay attempt.  `false` means the circuit is open
    /// (or a half-open trial is already out) and the caller must requeue
    /// without touching the network.
    pub async fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(self.policy.reset_timeout);
                if elapsed >= self.policy.reset_timeout {
                    info!("Relay circuit half-open, allowing one trial");
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != BreakerState::Closed {
            info!("Relay circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures += 1;
        inner.trial_in_flight = false;

        match inner.state {
            BreakerState::HalfOpen => {
                warn!("Relay trial failed, circuit reopened");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Closed
                if inner.consecutive_failures >= self.policy.failure_threshold =>
            {
                warn!(
                    failures = inner.consecutive_failures,
                    "Relay circuit opened"
                );
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            _ => {}
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    /// Time left until a half-open trial would be allowed, while open.
    pub async fn until_trial(&self) -> Option<std::time::Duration> {
        let inner = self.inner.lock().await;
        match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(at)) => Some(
                self.policy
                    .reset_timeout
                    .saturating_sub(at.elapsed()),
            ),
            _ => None,
        }
    }
}
