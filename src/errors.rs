//! Application error model with HTTP status mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling.
//! Variants follow the failure categories of the ingestion pipeline: ignorable
//! input, transient provider/downstream failures, expired history windows, and
//! subscription loss. Each variant maps to the HTTP status returned by the
//! webhook when a push cannot be handled.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// Covers all error cases the digest service may encounter while reacting to a
/// push notification or maintaining the mailbox watch.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid input (malformed config value, unparseable cursor)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Resource not found (message deleted before it could be fetched)
    #[error("not found: {0}")]
    NotFound(String),
    /// Authentication failure (revoked refresh token, bad bot token)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Operation timeout at the transport layer
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Transient upstream failure (network, quota, 5xx, empty model output)
    #[error("upstream failure: {0}")]
    Upstream(String),
    /// Provider no longer retains history for the requested cursor
    #[error("history expired: {0}")]
    HistoryExpired(String),
    /// Watch subscription could not be armed or renewed
    #[error("subscription lost: {0}")]
    SubscriptionLost(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Convenience constructor for `Upstream`
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    /// Whether retrying the same work later may succeed
    ///
    /// Transient errors leave the history cursor in place so the whole batch
    /// is recomputed on the next notification.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Upstream(_))
    }

    /// Stable machine-readable code for logs and response bodies
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::AuthFailed(_) => "auth_failed",
            Self::Timeout(_) => "timeout",
            Self::Upstream(_) => "upstream",
            Self::HistoryExpired(_) => "history_expired",
            Self::SubscriptionLost(_) => "subscription_lost",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status for the webhook response
    ///
    /// # Mappings
    ///
    /// - `InvalidInput` → `400 Bad Request`
    /// - `AuthFailed` → `401 Unauthorized`
    /// - `Timeout` → `504 Gateway Timeout`
    /// - `Upstream` → `502 Bad Gateway`
    /// - everything else → `500 Internal Server Error`
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::NotFound(_)
            | Self::HistoryExpired(_)
            | Self::SubscriptionLost(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "code": self.code(), "message": self.to_string() }));
        (self.status_code(), body).into_response()
    }
}

/// Response bodies quoted in errors are cut to this many characters
const ERROR_BODY_MAX_CHARS: usize = 200;

/// Map a non-success HTTP status from an outbound call to the error taxonomy
///
/// `operation` names the call for the log line; the response body is clipped.
pub fn status_error(operation: &str, status: StatusCode, body: &str) -> AppError {
    let clipped: String = body.chars().take(ERROR_BODY_MAX_CHARS).collect();
    let detail = format!("{operation} failed: status={status} body={clipped}");
    match status {
        StatusCode::NOT_FOUND => AppError::NotFound(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AppError::AuthFailed(detail),
        StatusCode::BAD_REQUEST => AppError::InvalidInput(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => AppError::Timeout(detail),
        s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
            AppError::Upstream(detail)
        }
        _ => AppError::Internal(detail),
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::Internal(format!("failed to decode response body: {err}"))
        } else {
            Self::Upstream(err.to_string())
        }
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;
