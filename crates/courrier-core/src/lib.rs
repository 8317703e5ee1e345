//! # courrier-core
//!
//! The message delivery engine: device identity and pre-key upkeep,
//! per-device ratchet sessions, a durable outbox drained by a retrying
//! delivery worker, and an idempotent reconciler that merges relay events
//! into the local log.  [`client::Courrier`] ties it all together behind
//! one offline-first facade; everything network-facing sits behind the
//! [`directory::DirectoryClient`], [`relay::RelayChannel`] and
//! [`direct::DirectChannel`] seams so tests run against in-memory fakes
//! and production against the HTTP implementations in [`http`].

pub mod breaker;
pub mod client;
pub mod config;
pub mod delivery;
pub mod direct;
pub mod directory;
pub mod events;
pub mod http;
pub mod identity;
pub mod ledger;
pub mod monitor;
pub mod reconcile;
pub mod relay;
pub mod session;

mod error;

use tracing_subscriber::{fmt, EnvFilter};

pub use breaker::{BreakerState, CircuitBreaker};
pub use client::Courrier;
pub use config::{BreakerPolicy, CoreConfig, RetryPolicy};
pub use delivery::DeliveryCoordinator;
pub use direct::{DirectChannel, LoopbackDirectChannel, NullDirectChannel};
pub use directory::{DirectoryClient, InMemoryDirectory};
pub use error::{CoreError, DirectoryError, RelayError, Result};
pub use events::{ClientEvent, DegradationKind, EventBus};
pub use http::{HttpDirectoryClient, HttpRelayChannel};
pub use identity::DeviceIdentityStore;
pub use ledger::{EntrySnapshot, EntryStatus, OptimisticLedger, Rollback};
pub use monitor::ConnectionMonitor;
pub use reconcile::{Applied, SyncReconciler};
pub use relay::{InMemoryRelay, RelayChannel, Subscription};
pub use session::SessionCipher;

/// Install the default tracing subscriber.  `RUST_LOG` overrides the
/// built-in filter; call once, early.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("courrier_core=debug,courrier_store=info,warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
