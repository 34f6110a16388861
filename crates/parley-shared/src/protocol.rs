//! Frames exchanged with clients over the real-time transport.
//!
//! Inbound [`ClientFrame`]s are intents; outbound [`ServerEvent`]s are either
//! replies to a specific request (`ack`, `history`, `error`) or pushed
//! notifications from the core event vocabulary (`message.*`,
//! `presence.changed`, `typing.changed`, `conversation.updated`). Both are
//! JSON objects tagged by a `type` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::types::{
    ConnectionId, ConversationId, FileRef, MessageId, MessageKind, MessageStatus, UserId,
};

/// A persisted message as the engine hands it out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    /// Durable identifier assigned at persistence time.
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRef>,
    /// Lowest status across the message's recipients.
    pub status: MessageStatus,
    /// Per-conversation order key, strictly increasing in persistence order.
    pub seq: i64,
    /// Server clock at persistence time.
    pub created_at: DateTime<Utc>,
    /// Client-chosen reference echoed back so the sender can reconcile an
    /// optimistic local copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

/// Where an outbound message is going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    /// Direct message to a user; the conversation is derived.
    User(UserId),
    /// An existing direct or group conversation.
    Conversation(ConversationId),
}

/// A fully-resolved request to send a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendIntent {
    pub sender_id: UserId,
    pub target: SendTarget,
    pub content: String,
    pub kind: MessageKind,
    pub file: Option<FileRef>,
    pub client_ref: Option<String>,
}

impl SendIntent {
    pub fn text(sender_id: UserId, target: SendTarget, content: impl Into<String>) -> Self {
        Self {
            sender_id,
            target,
            content: content.into(),
            kind: MessageKind::Text,
            file: None,
            client_ref: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Must be the first frame on a new connection.
    Authenticate { user_id: UserId },

    Send {
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        to: Option<UserId>,
        #[serde(default)]
        conversation_id: Option<ConversationId>,
        #[serde(default)]
        content: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default)]
        file: Option<FileRef>,
        #[serde(default)]
        client_ref: Option<String>,
    },

    /// Open a conversation: fetch a page and mark it read.
    History {
        #[serde(default)]
        request_id: Option<String>,
        conversation_id: ConversationId,
        #[serde(default)]
        limit: Option<u32>,
        #[serde(default)]
        before: Option<DateTime<Utc>>,
    },

    Read {
        #[serde(default)]
        request_id: Option<String>,
        message_id: MessageId,
    },

    Delete {
        #[serde(default)]
        request_id: Option<String>,
        message_id: MessageId,
    },

    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },

    /// Opaque call-signalling payload relayed to another user.
    Signal {
        to: UserId,
        payload: serde_json::Value,
    },

    Ping,
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "authenticated")]
    Authenticated {
        user_id: UserId,
        connection_id: ConnectionId,
        protocol: String,
        online_peers: Vec<UserId>,
    },

    #[serde(rename = "ack")]
    Ack {
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<ChatMessage>,
    },

    #[serde(rename = "history")]
    History {
        request_id: Option<String>,
        conversation_id: ConversationId,
        messages: Vec<ChatMessage>,
    },

    #[serde(rename = "error")]
    Error {
        request_id: Option<String>,
        kind: ErrorKind,
        message: String,
    },

    #[serde(rename = "pong")]
    Pong,

    /// A new message pushed to a recipient.
    #[serde(rename = "message.sent")]
    MessageSent { message: ChatMessage },

    #[serde(rename = "message.delivered")]
    MessageDelivered {
        message_id: MessageId,
        conversation_id: ConversationId,
        recipient_id: UserId,
        status: MessageStatus,
    },

    #[serde(rename = "message.read")]
    MessageRead {
        message_id: MessageId,
        conversation_id: ConversationId,
        recipient_id: UserId,
        status: MessageStatus,
    },

    #[serde(rename = "message.deleted")]
    MessageDeleted {
        message_id: MessageId,
        conversation_id: ConversationId,
    },

    #[serde(rename = "presence.changed")]
    PresenceChanged {
        user_id: UserId,
        online: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen: Option<DateTime<Utc>>,
    },

    #[serde(rename = "typing.changed")]
    TypingChanged {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },

    #[serde(rename = "conversation.updated")]
    ConversationUpdated {
        conversation_id: ConversationId,
        last_message_id: MessageId,
        last_activity: DateTime<Utc>,
    },

    #[serde(rename = "call.signal")]
    CallSignal {
        from: UserId,
        payload: serde_json::Value,
    },
}

impl ServerEvent {
    pub fn error(request_id: Option<String>, err: &crate::error::ChatError) -> Self {
        Self::Error {
            request_id,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Name of the event as it appears in the `type` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticated { .. } => "authenticated",
            Self::Ack { .. } => "ack",
            Self::History { .. } => "history",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
            Self::MessageSent { .. } => "message.sent",
            Self::MessageDelivered { .. } => "message.delivered",
            Self::MessageRead { .. } => "message.read",
            Self::MessageDeleted { .. } => "message.deleted",
            Self::PresenceChanged { .. } => "presence.changed",
            Self::TypingChanged { .. } => "typing.changed",
            Self::ConversationUpdated { .. } => "conversation.updated",
            Self::CallSignal { .. } => "call.signal",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ClientFrame {
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_frame_defaults() {
        let to = UserId::new();
        let raw = format!(r#"{{"type":"send","to":"{to}","content":"hello"}}"#);
        match ClientFrame::from_json(&raw).unwrap() {
            ClientFrame::Send {
                to: parsed,
                kind,
                conversation_id,
                file,
                ..
            } => {
                assert_eq!(parsed, Some(to));
                assert_eq!(kind, MessageKind::Text);
                assert!(conversation_id.is_none());
                assert!(file.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_message_kind_is_rejected() {
        let raw = r#"{"type":"send","content":"x","kind":"hologram"}"#;
        assert!(ClientFrame::from_json(raw).is_err());
    }

    #[test]
    fn test_event_type_tags() {
        let event = ServerEvent::TypingChanged {
            conversation_id: ConversationId::new_group(),
            user_id: UserId::new(),
            is_typing: true,
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "typing.changed");
        assert_eq!(value["type"], event.name());
        assert_eq!(value["is_typing"], true);
    }

    #[test]
    fn test_error_event_carries_kind() {
        let err = crate::error::ChatError::RecipientBlocked;
        let event = ServerEvent::error(Some("r1".into()), &err);
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["kind"], "recipient_blocked");
        assert_eq!(value["request_id"], "r1");
    }
}
