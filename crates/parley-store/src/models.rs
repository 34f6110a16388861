//! Domain model structs persisted in the database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the transport layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use parley_shared::moderation::Severity;
use parley_shared::protocol::ChatMessage;
use parley_shared::types::{
    ConversationId, ConversationKind, FileRef, MessageId, MessageKind, MessageStatus, Role, UserId,
};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A registered identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    /// Unique login handle.
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub role: Role,
    /// Cached reachability, refreshed on connect/disconnect. The in-memory
    /// presence registry is authoritative while the process is up.
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when registering a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub role: Role,
}

impl NewUser {
    pub fn new(username: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            display_name: display_name.into(),
            avatar_url: None,
            role: Role::User,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A direct pair or a group, with its participant set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    /// Group name; `None` for direct conversations.
    pub name: Option<String>,
    pub participants: Vec<UserId>,
    /// Group admins. Empty for direct conversations.
    pub admins: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    /// Ordering key for conversation lists.
    pub last_activity: DateTime<Utc>,
    pub last_message_id: Option<MessageId>,
}

impl Conversation {
    pub fn has_participant(&self, user: UserId) -> bool {
        self.participants.contains(&user)
    }

    /// Everyone except `user`.
    pub fn others(&self, user: UserId) -> Vec<UserId> {
        self.participants
            .iter()
            .copied()
            .filter(|p| *p != user)
            .collect()
    }
}

/// One row of a user's conversation list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub last_message: Option<ChatMessage>,
    /// Messages addressed to the viewer that they have not read.
    pub unread_count: u64,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A message about to be appended. Ordering key, timestamp and id are
/// assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub file: Option<FileRef>,
    pub client_ref: Option<String>,
}

/// Result of [`Database::append`](crate::Database::append).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appended {
    pub message: ChatMessage,
    /// Participants other than the sender, each holding a `sent` receipt.
    pub recipients: Vec<UserId>,
    /// `true` when `client_ref` matched an earlier append and nothing new
    /// was written.
    pub duplicate: bool,
}

/// A receipt that actually moved forward.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusTransition {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    /// The recipient's new status.
    pub status: MessageStatus,
}

// ---------------------------------------------------------------------------
// Moderation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentFlag {
    pub id: Uuid,
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub keyword: String,
    pub severity: Severity,
    pub reviewed: bool,
    pub created_at: DateTime<Utc>,
}
