use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification reported to clients alongside every failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or missing intent fields.
    Validation,
    /// Caller is not a participant or not a known identity.
    AccessDenied,
    /// A block relation exists between sender and recipient.
    RecipientBlocked,
    /// Unknown user, conversation or message.
    NotFound,
    /// Persistence failed before anything became durable.
    TransientStoreFailure,
}

impl ErrorKind {
    /// Only store failures are worth retrying; everything else would fail
    /// the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStoreFailure)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Recipient is blocked")]
    RecipientBlocked,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage temporarily unavailable: {0}")]
    TransientStoreFailure(String),
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::AccessDenied(_) => ErrorKind::AccessDenied,
            Self::RecipientBlocked => ErrorKind::RecipientBlocked,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::TransientStoreFailure(_) => ErrorKind::TransientStoreFailure,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_failures_are_retryable() {
        assert!(ChatError::TransientStoreFailure("disk".into()).is_retryable());
        assert!(!ChatError::Validation("empty".into()).is_retryable());
        assert!(!ChatError::AccessDenied("nope".into()).is_retryable());
        assert!(!ChatError::RecipientBlocked.is_retryable());
        assert!(!ChatError::NotFound("user".into()).is_retryable());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::RecipientBlocked).unwrap();
        assert_eq!(json, "\"recipient_blocked\"");
    }
}
