//! Error types for rustfed
//!
//! All errors in the engine are converted to `AppError`. Callers that need
//! to decide on retries or on an outward status code look at
//! [`AppError::kind`], which folds every variant into the federation error
//! taxonomy ([`ErrorKind`]).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Remote or local resource genuinely absent (404)
    #[error("Resource not found")]
    NotFound,

    /// Remote or local resource absent, with detail for logs (404)
    #[error("Resource not found: {0}")]
    Gone(String),

    /// Target domain is federation-blocked; no fetch was attempted.
    ///
    /// Rendered exactly like `NotFound` at the HTTP boundary.
    #[error("Domain is blocked: {0}")]
    Blocked(String),

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Malformed IRI, handle, domain or collection path (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Storage-level uniqueness violation (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Remote unreachable, timed out, or returned malformed data (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Signature verification failed (401)
    #[error("Invalid signature")]
    InvalidSignature,

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Federation error taxonomy
///
/// Every [`AppError`] maps onto exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Blocked,
    Network,
    InvalidInput,
    Conflict,
    Internal,
}

impl ErrorKind {
    /// Only transient network failures are worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Blocked => "blocked",
            ErrorKind::Network => "network",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        }
    }
}

impl AppError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NotFound | AppError::Gone(_) => ErrorKind::NotFound,
            AppError::Blocked(_) => ErrorKind::Blocked,
            AppError::HttpClient(_) | AppError::Federation(_) => ErrorKind::Network,
            AppError::Validation(_)
            | AppError::Unauthorized
            | AppError::Forbidden
            | AppError::InvalidSignature => ErrorKind::InvalidInput,
            AppError::Conflict(_) => ErrorKind::Conflict,
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return AppError::Conflict(db_err.message().to_string());
            }
        }
        AppError::Database(err)
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// Cloneable copy of an error, handed to every caller joined to one shared
/// fetch so that all of them observe the same terminal error kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SharedError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: message.into(),
        }
    }
}

impl From<&AppError> for SharedError {
    fn from(err: &AppError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<AppError> for SharedError {
    fn from(err: AppError) -> Self {
        SharedError::from(&err)
    }
}

impl From<SharedError> for AppError {
    fn from(err: SharedError) -> Self {
        match err.kind {
            ErrorKind::NotFound => AppError::Gone(err.message),
            ErrorKind::Blocked => AppError::Blocked(err.message),
            ErrorKind::Network => AppError::Federation(err.message),
            ErrorKind::InvalidInput => AppError::Validation(err.message),
            ErrorKind::Conflict => AppError::Conflict(err.message),
            ErrorKind::Internal => AppError::Internal(anyhow::anyhow!(err.message)),
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// `Blocked` produces the same status and body as `NotFound` so
    /// remote callers cannot learn block-list membership.
    fn into_response(self) -> Response {
        use axum::Json;

        let kind = self.kind();
        let (status, error_message) = match &self {
            AppError::NotFound | AppError::Gone(_) | AppError::Blocked(_) => {
                (StatusCode::NOT_FOUND, AppError::NotFound.to_string())
            }
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::InvalidSignature => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "Conflict".to_string()),
            AppError::Federation(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        if kind == ErrorKind::Blocked {
            tracing::debug!(error = %self, "Answering blocked request as not found");
        }

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[kind.as_str()]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(AppError::NotFound.kind(), ErrorKind::NotFound);
        assert_eq!(
            AppError::Blocked("evil.example".into()).kind(),
            ErrorKind::Blocked
        );
        assert_eq!(
            AppError::Federation("timeout".into()).kind(),
            ErrorKind::Network
        );
        assert_eq!(
            AppError::Validation("bad iri".into()).kind(),
            ErrorKind::InvalidInput
        );
        assert!(AppError::Federation("timeout".into()).is_retryable());
        assert!(!AppError::Blocked("evil.example".into()).is_retryable());
    }

    #[test]
    fn shared_error_preserves_kind() {
        let original = AppError::Gone("https://remote.example/users/bob".into());
        let shared = SharedError::from(&original);
        let restored = AppError::from(shared.clone());
        assert_eq!(restored.kind(), ErrorKind::NotFound);
        assert_eq!(SharedError::from(&restored).kind, shared.kind);
    }

    #[tokio::test]
    async fn blocked_renders_like_not_found() {
        let blocked = AppError::Blocked("evil.example".into()).into_response();
        let missing = AppError::NotFound.into_response();
        assert_eq!(blocked.status(), missing.status());

        let blocked_body = axum::body::to_bytes(blocked.into_body(), 1024)
            .await
            .unwrap();
        let missing_body = axum::body::to_bytes(missing.into_body(), 1024)
            .await
            .unwrap();
        assert_eq!(blocked_body, missing_body);
    }
}
