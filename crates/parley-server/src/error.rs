use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use parley_shared::{ChatError, ErrorKind};
use parley_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Missing or invalid X-User-Id header")]
    Unauthenticated,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limit exceeded, slow down")]
    RateLimited,
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        Self::Chat(err.into())
    }
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Chat(err) => err.kind(),
            Self::BadRequest(_) | Self::RateLimited => ErrorKind::Validation,
            Self::Unauthenticated | Self::Forbidden(_) => ErrorKind::AccessDenied,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            _ => match self.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::AccessDenied | ErrorKind::RecipientBlocked => StatusCode::FORBIDDEN,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::TransientStoreFailure => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Chat(ChatError::TransientStoreFailure(detail)) => {
                tracing::error!(error = %detail, "store failure while serving request");
                "Storage temporarily unavailable".to_string()
            }
            _ => self.to_string(),
        };

        let body = serde_json::json!({
            "error": message,
            "kind": self.kind(),
        });

        (status, axum::Json(body)).into_response()
    }
}
