//! v001 -- Initial schema creation.
//!
//! Creates the conversation log (`conversations`, `messages`, `reactions`),
//! the session and key-material tables (`sessions`, `device_identity`,
//! `signed_prekeys`, `one_time_prekeys`), and the durable retry queue
//! (`outbox`).

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    peer         TEXT NOT NULL,               -- hex-encoded 32-byte pubkey
    created_at   TEXT NOT NULL,               -- ISO-8601 / RFC-3339
    archived     INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    last_read_at TEXT                         -- nullable RFC-3339
);

CREATE INDEX IF NOT EXISTS idx_conversations_peer ON conversations(peer);

-- ----------------------------------------------------------------
-- Messages
-- The log keeps plaintext for display and ciphertext until a
-- decryption has succeeded; rows are soft-deleted via deleted_at.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT NOT NULL,              -- FK -> conversations(id)
    sender          TEXT NOT NULL,              -- hex-encoded pubkey
    sender_device   INTEGER NOT NULL,
    body            TEXT,                       -- decrypted/plain text, NULL while undecryptable
    ciphertext      BLOB,                       -- retained until decryption succeeds
    is_encrypted    INTEGER NOT NULL DEFAULT 1, -- boolean 0/1
    is_outgoing     INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    reply_to        TEXT,                       -- nullable message UUID
    timestamp       TEXT NOT NULL,              -- sender-assigned, RFC-3339
    status          TEXT NOT NULL,              -- pending|sent|delivered|read|failed
    edited_at       TEXT,                       -- nullable RFC-3339
    deleted_at      TEXT,                       -- nullable RFC-3339 (soft delete)
    local_only      INTEGER NOT NULL DEFAULT 0, -- cancelled before any ack

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_messages_status
    ON messages(conversation_id, status);

-- ----------------------------------------------------------------
-- Reactions
-- Set semantics: the primary key makes add idempotent.
-- No FK: a reaction may arrive before its message.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS reactions (
    message_id TEXT NOT NULL,                 -- message UUID
    emoji      TEXT NOT NULL,
    user_id    TEXT NOT NULL,                 -- hex-encoded pubkey
    created_at TEXT NOT NULL,

    PRIMARY KEY (message_id, emoji, user_id)
);

CREATE INDEX IF NOT EXISTS idx_reactions_message ON reactions(message_id);

-- ----------------------------------------------------------------
-- Ratchet sessions, one per (peer user, peer device)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sessions (
    peer         TEXT NOT NULL,               -- hex-encoded pubkey
    peer_device  INTEGER NOT NULL,
    state        BLOB NOT NULL,               -- serialized ratchet state
    created_at   TEXT NOT NULL,
    last_used_at TEXT NOT NULL,

    PRIMARY KEY (peer, peer_device)
);

-- ----------------------------------------------------------------
-- Device identity (single row, id = 1)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS device_identity (
    id              INTEGER PRIMARY KEY CHECK (id = 1),
    device_id       INTEGER NOT NULL,
    registration_id INTEGER NOT NULL,
    signing_secret  BLOB NOT NULL,            -- 32 bytes
    exchange_secret BLOB NOT NULL,            -- 32 bytes
    next_prekey_id  INTEGER NOT NULL,         -- never reused, monotonic
    published       INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Pre-keys
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS signed_prekeys (
    id         INTEGER PRIMARY KEY NOT NULL,
    public     BLOB NOT NULL,                 -- 32 bytes
    secret     BLOB NOT NULL,                 -- 32 bytes
    signature  BLOB NOT NULL,                 -- 64 bytes
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS one_time_prekeys (
    id         INTEGER PRIMARY KEY NOT NULL,
    public     BLOB NOT NULL,                 -- 32 bytes
    secret     BLOB NOT NULL,                 -- 32 bytes
    consumed   INTEGER NOT NULL DEFAULT 0,    -- boolean 0/1, set once
    published  INTEGER NOT NULL DEFAULT 0,    -- boolean 0/1
    created_at TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Outbox (durable retry queue, drained by the delivery worker)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS outbox (
    message_id      TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT NOT NULL,
    recipient       TEXT NOT NULL,              -- hex-encoded pubkey
    kind            TEXT NOT NULL,              -- text|edit|delete|reaction|receipt
    body            BLOB NOT NULL,              -- serialized MessageBody (pre-encryption)
    prepared        BLOB,                       -- serialized frames once encrypted
    created_at_ms   INTEGER NOT NULL,
    next_retry_ms   INTEGER NOT NULL,
    tries           INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_outbox_due ON outbox(next_retry_ms);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
