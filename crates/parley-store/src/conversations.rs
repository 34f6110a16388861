//! Conversation records and participant sets.

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension};

use parley_shared::constants::MAX_GROUP_MEMBERS;
use parley_shared::types::{ConversationId, ConversationKind, MessageId, UserId};

use crate::database::{now, text_conversion, ts_from_sql, ts_to_sql, uuid_from_sql, Database};
use crate::error::{Result, StoreError};
use crate::messages::{latest_message, unread_in};
use crate::models::{Conversation, ConversationSummary};

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Return the direct conversation between `a` and `b`, creating it on
    /// first use. Idempotent and independent of argument order.
    pub fn get_or_create_direct(&mut self, a: UserId, b: UserId) -> Result<Conversation> {
        let id = ConversationId::direct(a, b).map_err(|e| StoreError::Invalid(e.to_string()))?;
        let at = ts_to_sql(&now());

        let tx = self.conn_mut().transaction()?;
        let created = tx.execute(
            "INSERT OR IGNORE INTO conversations (id, kind, name, created_at, last_activity)
             VALUES (?1, 'direct', NULL, ?2, ?2)",
            params![id.as_str(), at],
        )?;
        if created > 0 {
            for user in [a, b] {
                tx.execute(
                    "INSERT INTO conversation_participants (conversation_id, user_id, is_admin, joined_at)
                     VALUES (?1, ?2, 0, ?3)",
                    params![id.as_str(), user.to_string(), at],
                )?;
            }
            tracing::debug!(conversation = %id, "direct conversation created");
        }
        let conversation = load_conversation(&tx, &id)?.ok_or(StoreError::NotFound)?;
        tx.commit()?;

        Ok(conversation)
    }

    /// Create a group. The creator is always a participant and the sole
    /// admin; duplicates in `members` are ignored.
    pub fn create_group(
        &mut self,
        creator: UserId,
        name: &str,
        members: &[UserId],
    ) -> Result<Conversation> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Invalid("group name is required".into()));
        }

        let mut participants: BTreeSet<UserId> = members.iter().copied().collect();
        participants.insert(creator);
        if participants.len() > MAX_GROUP_MEMBERS {
            return Err(StoreError::Invalid(format!(
                "a group holds at most {MAX_GROUP_MEMBERS} members"
            )));
        }

        let id = ConversationId::new_group();
        let at = ts_to_sql(&now());

        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO conversations (id, kind, name, created_at, last_activity)
             VALUES (?1, 'group', ?2, ?3, ?3)",
            params![id.as_str(), name, at],
        )?;
        for user in &participants {
            tx.execute(
                "INSERT INTO conversation_participants (conversation_id, user_id, is_admin, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id.as_str(), user.to_string(), *user == creator, at],
            )?;
        }
        let conversation = load_conversation(&tx, &id)?.ok_or(StoreError::NotFound)?;
        tx.commit()?;

        tracing::info!(
            conversation = %id,
            creator = %creator,
            members = participants.len(),
            "group created"
        );
        Ok(conversation)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        load_conversation(self.conn(), id)
    }

    pub fn participants(&self, id: &ConversationId) -> Result<Vec<UserId>> {
        load_participants(self.conn(), id).map(|rows| rows.into_iter().map(|(u, _)| u).collect())
    }

    pub fn is_participant(&self, id: &ConversationId, user: UserId) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM conversation_participants
                           WHERE conversation_id = ?1 AND user_id = ?2)",
            params![id.as_str(), user.to_string()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// The user's conversations, most recently active first, each with its
    /// latest visible message and the user's unread count.
    pub fn list_conversations(&self, user: UserId) -> Result<Vec<ConversationSummary>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id
             FROM conversations c
             JOIN conversation_participants p ON p.conversation_id = c.id
             WHERE p.user_id = ?1
             ORDER BY c.last_activity DESC, c.id ASC",
        )?;
        let ids = stmt
            .query_map(params![user.to_string()], |row| {
                let id: String = row.get(0)?;
                ConversationId::parse(&id).map_err(|e| text_conversion(0, e))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut summaries = Vec::new();
        for id in ids {
            let Some(conversation) = load_conversation(self.conn(), &id)? else {
                continue;
            };
            summaries.push(ConversationSummary {
                last_message: latest_message(self.conn(), &id)?,
                unread_count: unread_in(self.conn(), &id, user)?,
                conversation,
            });
        }
        Ok(summaries)
    }

    /// Everyone sharing at least one conversation with `user`. This is the
    /// audience for the user's presence changes.
    pub fn conversation_peers(&self, user: UserId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT DISTINCT other.user_id
             FROM conversation_participants me
             JOIN conversation_participants other
               ON other.conversation_id = me.conversation_id
             WHERE me.user_id = ?1 AND other.user_id != ?1
             ORDER BY other.user_id",
        )?;
        let rows = stmt.query_map(params![user.to_string()], |row| {
            let id: String = row.get(0)?;
            uuid_from_sql(0, &id).map(UserId)
        })?;

        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(peers)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn load_conversation(
    conn: &Connection,
    id: &ConversationId,
) -> Result<Option<Conversation>> {
    let row = conn
        .query_row(
            "SELECT kind, name, created_at, last_activity, last_message_id
             FROM conversations WHERE id = ?1",
            params![id.as_str()],
            |row| {
                let kind: String = row.get(0)?;
                let name: Option<String> = row.get(1)?;
                let created: String = row.get(2)?;
                let activity: String = row.get(3)?;
                let last_message: Option<String> = row.get(4)?;
                Ok((
                    kind.parse::<ConversationKind>()
                        .map_err(|e| text_conversion(0, e))?,
                    name,
                    ts_from_sql(2, &created)?,
                    ts_from_sql(3, &activity)?,
                    last_message
                        .map(|s| uuid_from_sql(4, &s).map(MessageId))
                        .transpose()?,
                ))
            },
        )
        .optional()?;

    let Some((kind, name, created_at, last_activity, last_message_id)) = row else {
        return Ok(None);
    };

    let members = load_participants(conn, id)?;
    Ok(Some(Conversation {
        id: id.clone(),
        kind,
        name,
        participants: members.iter().map(|(u, _)| *u).collect(),
        admins: members
            .iter()
            .filter(|(_, admin)| *admin)
            .map(|(u, _)| *u)
            .collect(),
        created_at,
        last_activity,
        last_message_id,
    }))
}

pub(crate) fn load_participants(
    conn: &Connection,
    id: &ConversationId,
) -> Result<Vec<(UserId, bool)>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, is_admin FROM conversation_participants
         WHERE conversation_id = ?1
         ORDER BY joined_at ASC, user_id ASC",
    )?;
    let rows = stmt.query_map(params![id.as_str()], |row| {
        let user: String = row.get(0)?;
        let admin: bool = row.get(1)?;
        Ok((UserId(uuid_from_sql(0, &user)?), admin))
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
