//! v001 -- Initial schema creation.
//!
//! Identity Directory tables (`users`, `blocks`) and the message log
//! (`conversations`, `conversation_participants`, `messages`, `receipts`).

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    username     TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    avatar_url   TEXT,
    role         TEXT NOT NULL DEFAULT 'user',
    is_online    INTEGER NOT NULL DEFAULT 0,  -- cached, presence is authoritative
    last_seen    TEXT NOT NULL,               -- RFC-3339
    created_at   TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Block relations (directional)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS blocks (
    blocker_id TEXT NOT NULL,
    blocked_id TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (blocker_id, blocked_id),
    FOREIGN KEY (blocker_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (blocked_id) REFERENCES users(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id              TEXT PRIMARY KEY NOT NULL,  -- sorted pair or group-<uuid>
    kind            TEXT NOT NULL,              -- 'direct' | 'group'
    name            TEXT,
    created_at      TEXT NOT NULL,
    last_activity   TEXT NOT NULL,
    last_message_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_conversations_activity
    ON conversations(last_activity DESC);

CREATE TABLE IF NOT EXISTS conversation_participants (
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    is_admin        INTEGER NOT NULL DEFAULT 0,
    joined_at       TEXT NOT NULL,

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_participants_user
    ON conversation_participants(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT NOT NULL,
    seq             INTEGER NOT NULL,           -- per-conversation order key
    sender_id       TEXT NOT NULL,
    content         TEXT NOT NULL,
    kind            TEXT NOT NULL,
    file_json       TEXT,                       -- serialized FileRef
    status          INTEGER NOT NULL DEFAULT 0, -- min over receipts
    deleted         INTEGER NOT NULL DEFAULT 0,
    client_ref      TEXT,
    created_at      TEXT NOT NULL,

    UNIQUE (conversation_id, seq),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    FOREIGN KEY (sender_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
    ON messages(conversation_id, seq DESC);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_client_ref
    ON messages(sender_id, client_ref) WHERE client_ref IS NOT NULL;

-- ----------------------------------------------------------------
-- Receipts: one row per (message, recipient)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS receipts (
    message_id   TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    status       INTEGER NOT NULL DEFAULT 0,    -- 0 sent, 1 delivered, 2 read
    updated_at   TEXT NOT NULL,

    PRIMARY KEY (message_id, recipient_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE,
    FOREIGN KEY (recipient_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_receipts_recipient
    ON receipts(recipient_id, status);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
