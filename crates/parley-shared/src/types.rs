use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{DIRECT_ID_DELIMITER, GROUP_ID_PREFIX};
use crate::error::ChatError;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Stable user identifier issued by the Identity Directory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifies one live transport connection. A reconnecting user gets a
/// fresh id, which lets a late disconnect of the old socket be told apart
/// from the current one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Conversation identifiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }
}

impl FromStr for ConversationKind {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            other => Err(ChatError::Validation(format!("unknown conversation kind '{other}'"))),
        }
    }
}

/// Canonical conversation key.
///
/// Direct conversations are the two participant ids sorted and joined with
/// [`DIRECT_ID_DELIMITER`], so `direct(a, b) == direct(b, a)` and no lookup
/// table is needed to find the 1:1 conversation between two users. Group
/// conversations carry a generated opaque id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationId(String);

impl ConversationId {
    pub fn direct(a: UserId, b: UserId) -> Result<Self, ChatError> {
        if a == b {
            return Err(ChatError::Validation(
                "a direct conversation needs two distinct participants".into(),
            ));
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        Ok(Self(format!("{lo}{DIRECT_ID_DELIMITER}{hi}")))
    }

    pub fn new_group() -> Self {
        Self(format!("{GROUP_ID_PREFIX}{}", Uuid::new_v4()))
    }

    /// Validate an id received from a client.
    pub fn parse(s: &str) -> Result<Self, ChatError> {
        let candidate = Self(s.to_string());
        match candidate.kind() {
            Some(ConversationKind::Direct) => {
                let (a, b) = candidate
                    .direct_pair()
                    .ok_or_else(|| ChatError::Validation(format!("malformed conversation id '{s}'")))?;
                // Only the canonical spelling is accepted.
                let canonical = Self::direct(a, b)?;
                if canonical != candidate {
                    return Err(ChatError::Validation(format!(
                        "conversation id '{s}' is not canonical"
                    )));
                }
                Ok(candidate)
            }
            Some(ConversationKind::Group) => Ok(candidate),
            None => Err(ChatError::Validation(format!("malformed conversation id '{s}'"))),
        }
    }

    pub fn kind(&self) -> Option<ConversationKind> {
        if let Some(rest) = self.0.strip_prefix(GROUP_ID_PREFIX) {
            return Uuid::parse_str(rest).ok().map(|_| ConversationKind::Group);
        }
        self.direct_pair().map(|_| ConversationKind::Direct)
    }

    pub fn is_direct(&self) -> bool {
        self.kind() == Some(ConversationKind::Direct)
    }

    /// The two participants encoded in a direct id, lowest first.
    pub fn direct_pair(&self) -> Option<(UserId, UserId)> {
        let (a, b) = self.0.split_once(DIRECT_ID_DELIMITER)?;
        let a = a.parse::<UserId>().ok()?;
        let b = b.parse::<UserId>().ok()?;
        (a != b).then_some((a, b))
    }

    /// For a direct id, the participant that is not `me`.
    pub fn counterpart(&self, me: UserId) -> Option<UserId> {
        let (a, b) = self.direct_pair()?;
        if a == me {
            Some(b)
        } else if b == me {
            Some(a)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ConversationId {
    type Error = ChatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ConversationId> for String {
    fn from(id: ConversationId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// Message enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Video,
    File,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::File => "file",
            Self::System => "system",
        }
    }
}

impl FromStr for MessageKind {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "file" => Ok(Self::File),
            "system" => Ok(Self::System),
            other => Err(ChatError::Validation(format!("unknown message type '{other}'"))),
        }
    }
}

/// Delivery status of a message towards one recipient.
///
/// The derived ordering is the lifecycle order; a status only ever moves
/// forward along it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent = 0,
    Delivered = 1,
    Read = 2,
}

impl MessageStatus {
    /// Returns the new status if moving to `target` is a forward step, or
    /// `None` when it would stand still or regress.
    pub fn advance(self, target: MessageStatus) -> Option<MessageStatus> {
        (target > self).then_some(target)
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Sent),
            1 => Some(Self::Delivered),
            2 => Some(Self::Read),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            other => Err(ChatError::Validation(format!("unknown role '{other}'"))),
        }
    }
}

/// Reference to an uploaded file attached to a message. Storage of the
/// bytes themselves happens elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRef {
    pub url: String,
    pub name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}
