//! Identity Directory: user records, `last_seen` and block relations.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use parley_shared::types::{Role, UserId};

use crate::database::{now, text_conversion, ts_from_sql, ts_to_sql, uuid_from_sql, Database};
use crate::error::{Result, StoreError};
use crate::models::{NewUser, User};

const USER_COLUMNS: &str =
    "id, username, display_name, avatar_url, role, is_online, last_seen, created_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Register a user. Fails with [`StoreError::Conflict`] if the username
    /// is taken.
    pub fn create_user(&self, new: &NewUser) -> Result<User> {
        let username = new.username.trim();
        if username.is_empty() || new.display_name.trim().is_empty() {
            return Err(StoreError::Invalid(
                "username and display name are required".into(),
            ));
        }

        let user = User {
            id: UserId::new(),
            username: username.to_string(),
            display_name: new.display_name.trim().to_string(),
            avatar_url: new.avatar_url.clone(),
            role: new.role,
            is_online: false,
            last_seen: now(),
            created_at: now(),
        };

        self.conn()
            .execute(
                "INSERT INTO users (id, username, display_name, avatar_url, role, is_online, last_seen, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)",
                params![
                    user.id.to_string(),
                    user.username,
                    user.display_name,
                    user.avatar_url,
                    user.role.as_str(),
                    ts_to_sql(&user.last_seen),
                    ts_to_sql(&user.created_at),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::Conflict(format!("username '{username}' is already taken"))
                }
                other => StoreError::Sqlite(other),
            })?;

        tracing::debug!(user = %user.id, username = %user.username, "user created");
        Ok(user)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn find_user(&self, id: UserId) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.to_string()],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                params![username],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    /// Case-insensitive substring search over username and display name.
    pub fn search_users(&self, query: &str, limit: u32) -> Result<Vec<User>> {
        let pattern = format!("%{}%", escape_like(query.trim()));
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE username LIKE ?1 ESCAPE '\\' OR display_name LIKE ?1 ESCAPE '\\'
             ORDER BY username ASC
             LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![pattern, limit], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    // ------------------------------------------------------------------
    // Presence bookkeeping
    // ------------------------------------------------------------------

    pub fn update_last_seen(&self, id: UserId, at: DateTime<Utc>) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE users SET last_seen = ?2 WHERE id = ?1",
            params![id.to_string(), ts_to_sql(&at)],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Refresh the cached online flag and stamp `last_seen` with `at`.
    pub fn set_online(&self, id: UserId, online: bool, at: DateTime<Utc>) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE users SET is_online = ?2 WHERE id = ?1",
            params![id.to_string(), online],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        self.update_last_seen(id, at)
    }

    /// Clear every cached online flag. Run at startup: nobody is connected
    /// to a fresh process.
    pub fn reset_presence(&self) -> Result<usize> {
        let affected = self
            .conn()
            .execute("UPDATE users SET is_online = 0 WHERE is_online = 1", [])?;
        Ok(affected)
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    /// Returns `true` if a new relation was recorded.
    pub fn block_user(&self, blocker: UserId, blocked: UserId) -> Result<bool> {
        if blocker == blocked {
            return Err(StoreError::Invalid("users cannot block themselves".into()));
        }
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO blocks (blocker_id, blocked_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![blocker.to_string(), blocked.to_string(), ts_to_sql(&now())],
        )?;
        Ok(affected > 0)
    }

    pub fn unblock_user(&self, blocker: UserId, blocked: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM blocks WHERE blocker_id = ?1 AND blocked_id = ?2",
            params![blocker.to_string(), blocked.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Whether `blocker` has blocked `blocked` (one direction only).
    pub fn is_blocked(&self, blocker: UserId, blocked: UserId) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM blocks WHERE blocker_id = ?1 AND blocked_id = ?2)",
            params![blocker.to_string(), blocked.to_string()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Whether a block exists in either direction between `a` and `b`.
    pub fn is_blocked_either(&self, a: UserId, b: UserId) -> Result<bool> {
        Ok(self.is_blocked(a, b)? || self.is_blocked(b, a)?)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id_str: String = row.get(0)?;
    let role_str: String = row.get(4)?;
    let last_seen_str: String = row.get(6)?;
    let created_str: String = row.get(7)?;

    Ok(User {
        id: UserId(uuid_from_sql(0, &id_str)?),
        username: row.get(1)?,
        display_name: row.get(2)?,
        avatar_url: row.get(3)?,
        role: role_str
            .parse::<Role>()
            .map_err(|e| text_conversion(4, e))?,
        is_online: row.get(5)?,
        last_seen: ts_from_sql(6, &last_seen_str)?,
        created_at: ts_from_sql(7, &created_str)?,
    })
}
