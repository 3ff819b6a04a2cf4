//! Unified error types
//!
//! One variant per row of the control plane's error table: cause, local
//! recovery and external HTTP surface are all decided here so callers never
//! hand-roll a status code.

#![allow(dead_code)]

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AppError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("key inactive")]
    KeyInactive,

    #[error("key expired")]
    KeyExpired,

    #[error("key deleted")]
    KeyDeleted,

    #[error("client not allowed: {0}")]
    ClientNotAllowed(String),

    #[error("model not allowed: {0}")]
    ModelNotAllowed(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("queue timeout")]
    QueueTimeout,

    #[error("no available account: {0}")]
    NoAvailableAccount(String),

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("account rate limited")]
    AccountRateLimited,

    #[error("client disconnected")]
    ClientDisconnect,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Error response body shape.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::StoreUnavailable(_) => "store_unavailable",
            AppError::InvalidCredentials => "invalid_credentials",
            AppError::KeyInactive => "key_inactive",
            AppError::KeyExpired => "key_expired",
            AppError::KeyDeleted => "key_deleted",
            AppError::ClientNotAllowed(_) => "client_not_allowed",
            AppError::ModelNotAllowed(_) => "model_not_allowed",
            AppError::QuotaExceeded(_) => "quota_exceeded",
            AppError::RateLimited(_) => "rate_limited",
            AppError::QueueTimeout => "queue_timeout",
            AppError::NoAvailableAccount(_) => "no_available_account",
            AppError::UpstreamError(_) => "upstream_error",
            AppError::AccountRateLimited => "account_rate_limited",
            AppError::ClientDisconnect => "client_disconnect",
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::NotFound(_) => "not_found",
            AppError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AppError::KeyInactive | AppError::KeyExpired => StatusCode::FORBIDDEN,
            AppError::KeyDeleted => StatusCode::UNAUTHORIZED,
            AppError::ClientNotAllowed(_) => StatusCode::FORBIDDEN,
            AppError::ModelNotAllowed(_) => StatusCode::FORBIDDEN,
            AppError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::QueueTimeout => StatusCode::TOO_MANY_REQUESTS,
            AppError::NoAvailableAccount(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            AppError::AccountRateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::ClientDisconnect => StatusCode::BAD_REQUEST,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether stat counters / accounting should swallow this rather than
    /// surface it; best-effort paths log and continue.
    pub fn is_best_effort(&self) -> bool {
        matches!(self, AppError::StoreUnavailable(_) | AppError::Internal(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let message = self.to_string();

        crate::logger::error(
            "app_error",
            &format!("status={} kind={} message={}", status.as_u16(), kind, message),
        );

        (
            status,
            Json(ErrorResponse {
                error: ErrorBody { kind, message },
            }),
        )
            .into_response()
    }
}
