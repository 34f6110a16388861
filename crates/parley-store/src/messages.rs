//! The append-only message log and per-recipient receipts.
//!
//! Ordering is decided here and nowhere else: [`Database::append`] assigns
//! the per-conversation `seq` and a strictly increasing `created_at` inside
//! the same transaction that writes the row, so every reader observes the
//! persistence order.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use parley_shared::protocol::ChatMessage;
use parley_shared::types::{ConversationId, FileRef, MessageId, MessageKind, MessageStatus, UserId};

use crate::conversations::load_participants;
use crate::database::{
    now, text_conversion, ts_ceil_micros, ts_from_sql, ts_to_sql, uuid_from_sql, Database,
};
use crate::error::{Result, StoreError};
use crate::models::{Appended, NewMessage, StatusTransition};

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, content, kind, file_json, status, seq, created_at, client_ref";

impl Database {
    // ------------------------------------------------------------------
    // Append
    // ------------------------------------------------------------------

    /// Persist a message with status `sent` and a `sent` receipt for every
    /// other participant, and bump the conversation's activity key.
    ///
    /// When `client_ref` repeats one this sender used before, the earlier
    /// message is returned with `duplicate = true` and nothing is written.
    pub fn append(&mut self, new: &NewMessage) -> Result<Appended> {
        let tx = self.conn_mut().transaction()?;

        if let Some(client_ref) = &new.client_ref {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM messages WHERE sender_id = ?1 AND client_ref = ?2",
                    params![new.sender_id.to_string(), client_ref],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                let id = MessageId(uuid_from_sql(0, &id)?);
                let message = load_message(&tx, id, true)?.ok_or(StoreError::NotFound)?;
                let recipients = load_recipients(&tx, id)?;
                tracing::debug!(message = %id, "append deduplicated by client_ref");
                return Ok(Appended {
                    message,
                    recipients,
                    duplicate: true,
                });
            }
        }

        let participants = load_participants(&tx, &new.conversation_id)?;
        if participants.is_empty() {
            return Err(StoreError::NotFound);
        }
        if !participants.iter().any(|(u, _)| *u == new.sender_id) {
            return Err(StoreError::Invalid(
                "sender is not a participant of the conversation".into(),
            ));
        }
        let recipients: Vec<UserId> = participants
            .into_iter()
            .map(|(u, _)| u)
            .filter(|u| *u != new.sender_id)
            .collect();

        let (seq, last_created): (i64, Option<String>) = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1, MAX(created_at)
             FROM messages WHERE conversation_id = ?1",
            params![new.conversation_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut created_at = now();
        if let Some(last) = last_created {
            let last = ts_from_sql(1, &last)?;
            if created_at <= last {
                created_at = last + Duration::microseconds(1);
            }
        }

        let message = ChatMessage {
            id: MessageId::new(),
            conversation_id: new.conversation_id.clone(),
            sender_id: new.sender_id,
            content: new.content.clone(),
            kind: new.kind,
            file: new.file.clone(),
            status: MessageStatus::Sent,
            seq,
            created_at,
            client_ref: new.client_ref.clone(),
        };
        let created_sql = ts_to_sql(&created_at);
        let file_json = message.file.as_ref().map(serde_json::to_string).transpose()?;

        tx.execute(
            "INSERT INTO messages
                (id, conversation_id, seq, sender_id, content, kind, file_json, status, deleted, client_ref, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10)",
            params![
                message.id.to_string(),
                message.conversation_id.as_str(),
                seq,
                message.sender_id.to_string(),
                message.content,
                message.kind.as_str(),
                file_json,
                MessageStatus::Sent.as_i64(),
                message.client_ref,
                created_sql,
            ],
        )?;

        for recipient in &recipients {
            tx.execute(
                "INSERT INTO receipts (message_id, recipient_id, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    message.id.to_string(),
                    recipient.to_string(),
                    MessageStatus::Sent.as_i64(),
                    created_sql,
                ],
            )?;
        }

        tx.execute(
            "UPDATE conversations SET last_activity = ?2, last_message_id = ?3 WHERE id = ?1",
            params![
                message.conversation_id.as_str(),
                created_sql,
                message.id.to_string()
            ],
        )?;

        tx.commit()?;

        Ok(Appended {
            message,
            recipients,
            duplicate: false,
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Up to `limit` visible messages strictly older than `before` (or the
    /// newest ones), returned oldest first.
    pub fn query_range(
        &self,
        conversation: &ConversationId,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<ChatMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1
               AND deleted = 0
               AND (?2 IS NULL OR created_at < ?2)
             ORDER BY seq DESC
             LIMIT ?3"
        ))?;

        let before = before.map(|b| ts_to_sql(&ts_ceil_micros(b)));
        let rows = stmt.query_map(
            params![conversation.as_str(), before, limit],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// Fetch a visible (not deleted) message.
    pub fn get_message(&self, id: MessageId) -> Result<ChatMessage> {
        load_message(self.conn(), id, false)?.ok_or(StoreError::NotFound)
    }

    /// Users holding a receipt for the message.
    pub fn recipients(&self, id: MessageId) -> Result<Vec<UserId>> {
        load_recipients(self.conn(), id)
    }

    pub fn receipt_status(&self, id: MessageId, recipient: UserId) -> Result<Option<MessageStatus>> {
        let raw: Option<i64> = self
            .conn()
            .query_row(
                "SELECT status FROM receipts WHERE message_id = ?1 AND recipient_id = ?2",
                params![id.to_string(), recipient.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.and_then(MessageStatus::from_i64))
    }

    /// Count of visible messages addressed to `user` in the conversation
    /// that `user` has not read.
    pub fn unread_count(&self, conversation: &ConversationId, user: UserId) -> Result<u64> {
        unread_in(self.conn(), conversation, user)
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Move one recipient's receipt forward to `status`.
    ///
    /// Returns `None` (a no-op, not an error) when the receipt is missing or
    /// already at or past `status`; receipts never regress.
    pub fn update_status(
        &mut self,
        id: MessageId,
        recipient: UserId,
        status: MessageStatus,
    ) -> Result<Option<StatusTransition>> {
        let tx = self.conn_mut().transaction()?;
        let transition = advance_receipt(&tx, id, recipient, status)?;
        tx.commit()?;
        Ok(transition)
    }

    /// Mark each of `ids` read by `reader` in one transaction, returning
    /// only the receipts that actually changed.
    pub fn mark_read(&mut self, reader: UserId, ids: &[MessageId]) -> Result<Vec<StatusTransition>> {
        let tx = self.conn_mut().transaction()?;
        let mut transitions = Vec::new();
        for id in ids {
            if let Some(t) = advance_receipt(&tx, *id, reader, MessageStatus::Read)? {
                transitions.push(t);
            }
        }
        tx.commit()?;
        Ok(transitions)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Hide a message from history and unread counts. The row and its `seq`
    /// stay in place. Returns `false` if it was already deleted or unknown.
    pub fn soft_delete(&self, id: MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET deleted = 1 WHERE id = ?1 AND deleted = 0",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn advance_receipt(
    conn: &Connection,
    id: MessageId,
    recipient: UserId,
    status: MessageStatus,
) -> Result<Option<StatusTransition>> {
    let affected = conn.execute(
        "UPDATE receipts SET status = ?3, updated_at = ?4
         WHERE message_id = ?1 AND recipient_id = ?2 AND status < ?3",
        params![
            id.to_string(),
            recipient.to_string(),
            status.as_i64(),
            ts_to_sql(&now())
        ],
    )?;
    if affected == 0 {
        return Ok(None);
    }

    conn.execute(
        "UPDATE messages
         SET status = (SELECT MIN(status) FROM receipts WHERE message_id = ?1)
         WHERE id = ?1",
        params![id.to_string()],
    )?;

    let (conversation, sender): (String, String) = conn.query_row(
        "SELECT conversation_id, sender_id FROM messages WHERE id = ?1",
        params![id.to_string()],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(Some(StatusTransition {
        message_id: id,
        conversation_id: ConversationId::parse(&conversation)
            .map_err(|e| StoreError::Invalid(e.to_string()))?,
        sender_id: UserId(uuid_from_sql(1, &sender)?),
        recipient_id: recipient,
        status,
    }))
}

fn load_message(conn: &Connection, id: MessageId, include_deleted: bool) -> Result<Option<ChatMessage>> {
    let message = conn
        .query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE id = ?1 AND (?2 OR deleted = 0)"
            ),
            params![id.to_string(), include_deleted],
            row_to_message,
        )
        .optional()?;
    Ok(message)
}

fn load_recipients(conn: &Connection, id: MessageId) -> Result<Vec<UserId>> {
    let mut stmt = conn.prepare(
        "SELECT recipient_id FROM receipts WHERE message_id = ?1 ORDER BY recipient_id",
    )?;
    let rows = stmt.query_map(params![id.to_string()], |row| {
        let user: String = row.get(0)?;
        uuid_from_sql(0, &user).map(UserId)
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub(crate) fn latest_message(
    conn: &Connection,
    conversation: &ConversationId,
) -> Result<Option<ChatMessage>> {
    let message = conn
        .query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 AND deleted = 0
                 ORDER BY seq DESC LIMIT 1"
            ),
            params![conversation.as_str()],
            row_to_message,
        )
        .optional()?;
    Ok(message)
}

pub(crate) fn unread_in(conn: &Connection, conversation: &ConversationId, user: UserId) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*)
         FROM receipts r
         JOIN messages m ON m.id = r.message_id
         WHERE m.conversation_id = ?1
           AND r.recipient_id = ?2
           AND r.status < ?3
           AND m.deleted = 0",
        params![
            conversation.as_str(),
            user.to_string(),
            MessageStatus::Read.as_i64()
        ],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let id_str: String = row.get(0)?;
    let conversation_str: String = row.get(1)?;
    let sender_str: String = row.get(2)?;
    let kind_str: String = row.get(4)?;
    let file_json: Option<String> = row.get(5)?;
    let status_raw: i64 = row.get(6)?;
    let created_str: String = row.get(8)?;

    let file = file_json
        .map(|json| serde_json::from_str::<FileRef>(&json))
        .transpose()
        .map_err(|e| text_conversion(5, e))?;

    let status = MessageStatus::from_i64(status_raw).ok_or_else(|| {
        rusqlite::Error::IntegralValueOutOfRange(6, status_raw)
    })?;

    Ok(ChatMessage {
        id: MessageId(uuid_from_sql(0, &id_str)?),
        conversation_id: ConversationId::parse(&conversation_str)
            .map_err(|e| text_conversion(1, e))?,
        sender_id: UserId(uuid_from_sql(2, &sender_str)?),
        content: row.get(3)?,
        kind: kind_str
            .parse::<MessageKind>()
            .map_err(|e| text_conversion(4, e))?,
        file,
        status,
        seq: row.get(7)?,
        created_at: ts_from_sql(8, &created_str)?,
        client_ref: row.get(9)?,
    })
}
