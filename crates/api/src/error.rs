//! API error taxonomy
//!
//! One enum for every failure the auth core can surface. Two policy rules
//! shape the variants:
//!
//! - Credential and token lookups never reveal whether the underlying
//!   identifier exists: "no such account" and "wrong password" are both
//!   [`ApiError::InvalidCredentials`].
//! - Transient store errors are retried internally; only after the retry
//!   budget is exhausted do they surface, as
//!   [`ApiError::ServiceUnavailable`]. Everything else propagates to the
//!   caller verbatim for user-facing messaging.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("An account with this email already exists")]
    DuplicateAccount,
    #[error("{0}")]
    PolicyViolation(String),
    #[error("Token not found")]
    TokenNotFound,
    #[error("Token has expired")]
    TokenExpired,
    #[error("Token has already been used")]
    TokenAlreadyUsed,
    #[error("Invalid verification code")]
    InvalidCode,
    #[error("Too many attempts, try again later")]
    RateLimited,
    #[error("Authentication required")]
    Unauthenticated,
    #[error("Session has expired")]
    SessionExpired,
    #[error("Insufficient permissions")]
    Forbidden,
    #[error("Service temporarily unavailable")]
    ServiceUnavailable,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidCredentials | Self::InvalidCode => StatusCode::UNAUTHORIZED,
            Self::DuplicateAccount => StatusCode::CONFLICT,
            Self::PolicyViolation(_)
            | Self::TokenNotFound
            | Self::TokenExpired
            | Self::TokenAlreadyUsed => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthenticated | Self::SessionExpired => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internals are logged, never echoed to the client
        let message = match &self {
            Self::Internal(detail) => {
                tracing::error!(error = %detail, "Internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Store errors reach handlers only after `with_retry` has exhausted its
/// attempts, so a still-transient error here means the store is down.
impl From<sqlx::Error> for ApiError {
    fn from(error: sqlx::Error) -> Self {
        if yozakura_shared::is_transient(&error) {
            tracing::error!(error = ?error, "Store unavailable after retry exhaustion");
            Self::ServiceUnavailable
        } else {
            Self::Internal(error.to_string())
        }
    }
}
