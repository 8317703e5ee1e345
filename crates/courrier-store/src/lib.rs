//! # courrier-store
//!
//! Local durable storage for the Courrier delivery core, backed by SQLite
//! (optionally SQLCipher).  The crate exposes a synchronous [`Database`]
//! handle that wraps a `rusqlite::Connection` and provides typed CRUD helpers
//! for every domain model: the conversation log, reactions, ratchet sessions,
//! device key material, and the durable outbox that backs retry delivery.
//!
//! Writes that the delivery core and the sync reconciler may race on (the
//! message log) are expressed as upserts keyed by message id, so replaying an
//! event is always safe.

pub mod conversations;
pub mod database;
pub mod identity;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod outbox;
pub mod reactions;
pub mod sessions;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
