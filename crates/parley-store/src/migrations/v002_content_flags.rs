//! v002 -- Moderation flags raised by the keyword hook.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS content_flags (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    message_id      TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    keyword         TEXT NOT NULL,
    severity        TEXT NOT NULL DEFAULT 'medium',
    reviewed        INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,

    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_content_flags_reviewed
    ON content_flags(reviewed, created_at DESC);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
