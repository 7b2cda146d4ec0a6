use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Invalid chat name. Use letters, digits, '_', '-' only.")]
    InvalidName(String),

    #[error("Chat already exists")]
    AlreadyExists(String),

    #[error("Chat not found")]
    NotFound(String),

    #[error("Invalid model index: {0}")]
    InvalidModelIndex(usize),

    /// Upstream model failure, surfaced as-is.
    #[error("provider error: {0}")]
    Provider(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::InvalidName(_) | ChatError::AlreadyExists(_) => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) | ChatError::InvalidModelIndex(_) => StatusCode::NOT_FOUND,
            ChatError::Provider(_) | ChatError::Io(_) | ChatError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<anyhow::Error> for ChatError {
    fn from(e: anyhow::Error) -> Self {
        ChatError::Provider(format!("{e:#}"))
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_4xx() {
        assert_eq!(ChatError::InvalidName("a b".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ChatError::AlreadyExists("a".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ChatError::NotFound("a".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(ChatError::InvalidModelIndex(9).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn provider_errors_are_server_side() {
        let err: ChatError = anyhow::anyhow!("upstream closed").into();
        assert!(matches!(err, ChatError::Provider(ref m) if m.contains("upstream closed")));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
