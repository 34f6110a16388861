//! Moderation flags raised against stored messages.

use rusqlite::params;
use uuid::Uuid;

use parley_shared::moderation::Severity;
use parley_shared::types::{ConversationId, MessageId};

use crate::database::{now, text_conversion, ts_from_sql, ts_to_sql, uuid_from_sql, Database};
use crate::error::Result;
use crate::models::ContentFlag;

impl Database {
    pub fn insert_flag(
        &self,
        message_id: MessageId,
        conversation_id: &ConversationId,
        keyword: &str,
        severity: Severity,
    ) -> Result<ContentFlag> {
        let flag = ContentFlag {
            id: Uuid::new_v4(),
            message_id,
            conversation_id: conversation_id.clone(),
            keyword: keyword.to_string(),
            severity,
            reviewed: false,
            created_at: now(),
        };

        self.conn().execute(
            "INSERT INTO content_flags (id, message_id, conversation_id, keyword, severity, reviewed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                flag.id.to_string(),
                flag.message_id.to_string(),
                flag.conversation_id.as_str(),
                flag.keyword,
                flag.severity.as_str(),
                ts_to_sql(&flag.created_at),
            ],
        )?;

        tracing::info!(
            message = %message_id,
            keyword = %flag.keyword,
            severity = flag.severity.as_str(),
            "content flagged"
        );
        Ok(flag)
    }

    /// Flags, newest first.
    pub fn list_flags(&self, unreviewed_only: bool, limit: u32) -> Result<Vec<ContentFlag>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, message_id, conversation_id, keyword, severity, reviewed, created_at
             FROM content_flags
             WHERE (?1 = 0 OR reviewed = 0)
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![unreviewed_only, limit], |row| {
            let id: String = row.get(0)?;
            let message: String = row.get(1)?;
            let conversation: String = row.get(2)?;
            let severity: String = row.get(4)?;
            let created: String = row.get(6)?;
            Ok(ContentFlag {
                id: uuid_from_sql(0, &id)?,
                message_id: MessageId(uuid_from_sql(1, &message)?),
                conversation_id: ConversationId::parse(&conversation)
                    .map_err(|e| text_conversion(2, e))?,
                keyword: row.get(3)?,
                severity: Severity::parse(&severity).unwrap_or(Severity::Medium),
                reviewed: row.get(5)?,
                created_at: ts_from_sql(6, &created)?,
            })
        })?;

        let mut flags = Vec::new();
        for row in rows {
            flags.push(row?);
        }
        Ok(flags)
    }

    /// Returns `false` if no such flag exists.
    pub fn mark_flag_reviewed(&self, id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE content_flags SET reviewed = 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewMessage, NewUser};
    use parley_shared::types::MessageKind;

    #[test]
    fn test_flag_lifecycle() {
        let mut db = Database::open_in_memory().unwrap();
        let a = db.create_user(&NewUser::new("a", "A")).unwrap().id;
        let b = db.create_user(&NewUser::new("b", "B")).unwrap().id;
        let conversation = db.get_or_create_direct(a, b).unwrap().id;
        let message = db
            .append(&NewMessage {
                conversation_id: conversation.clone(),
                sender_id: a,
                content: "buy cheap stuff".into(),
                kind: MessageKind::Text,
                file: None,
                client_ref: None,
            })
            .unwrap()
            .message;

        let flag = db
            .insert_flag(message.id, &conversation, "cheap", Severity::High)
            .unwrap();
        assert!(!flag.reviewed);

        let open = db.list_flags(true, 10).unwrap();
        assert_eq!(open, vec![flag.clone()]);

        assert!(db.mark_flag_reviewed(flag.id).unwrap());
        assert!(db.list_flags(true, 10).unwrap().is_empty());
        assert_eq!(db.list_flags(false, 10).unwrap().len(), 1);
        assert!(!db.mark_flag_reviewed(Uuid::new_v4()).unwrap());
    }
}
