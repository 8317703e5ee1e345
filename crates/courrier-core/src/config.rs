//! Runtime configuration for the delivery core.
//!
//! Everything has a usable default; embedding applications override only
//! what they need (typically the plaintext fallback switch and the retry
//! policy in tests).

use std::time::Duration;

use rand::Rng;

use courrier_shared::constants::DEFAULT_PREKEY_BATCH;

/// Backoff schedule for the durable retry queue.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Multiplier applied per attempt.
    pub multiplier: u64,
    /// Ceiling for the computed delay.
    pub max_delay_ms: u64,
    /// Jitter applied to every delay, in percent of the delay.
    pub jitter_pct: u64,
    /// Attempts before a message is marked failed.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 2,
            max_delay_ms: 30_000,
            jitter_pct: 20,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay after `tries` failed attempts, jittered so queued
    /// messages do not retry in lockstep.
    pub fn delay_for(&self, tries: u32) -> Duration {
        let mut delay = self.base_delay_ms;
        for _ in 1..tries.max(1) {
            delay = (delay.saturating_mul(self.multiplier)).min(self.max_delay_ms);
        }
        delay = delay.min(self.max_delay_ms);

        let jitter_span = delay * self.jitter_pct / 100;
        let jittered = if jitter_span > 0 {
            rand::thread_rng().gen_range(delay - jitter_span..=delay + jitter_span)
        } else {
            delay
        };
        Duration::from_millis(jittered)
    }
}

/// Circuit breaker settings for the relay channel.
#[derive(Debug, Clone)]
pub struct BreakerPolicy {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open trial.
    pub reset_timeout: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// One-time prekeys generated per replenishment batch.
    pub prekey_batch: u32,
    /// Replenish the pool when unconsumed prekeys drop below this.
    pub prekey_low_water: u32,
    pub retry: RetryPolicy,
    pub breaker: BreakerPolicy,
    /// How long confirmed/failed optimistic entries stay visible.
    pub ledger_grace: Duration,
    /// Send in the clear when the peer has no published keys.  The
    /// degradation is always logged and surfaced as an event.
    pub allow_plaintext_fallback: bool,
    /// Try the direct peer channel before the relay.
    pub direct_enabled: bool,
    /// Outbox scan interval while online.
    pub outbox_tick: Duration,
    /// Entries drained per outbox scan.
    pub outbox_batch: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            prekey_batch: DEFAULT_PREKEY_BATCH,
            prekey_low_water: 20,
            retry: RetryPolicy::default(),
            breaker: BreakerPolicy::default(),
            ledger_grace: Duration::from_millis(1_500),
            allow_plaintext_fallback: true,
            direct_enabled: true,
            outbox_tick: Duration::from_millis(500),
            outbox_batch: 16,
        }
    }
}
