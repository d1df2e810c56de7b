//! Error types for cadenza-enrich
//!
//! `EnrichError` is the service-internal error. `ItemError` is a per-subject
//! failure that is recorded and never aborts a cycle. `ApiError` maps both to
//! HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::providers::ProviderError;
use crate::services::correlation::CorrelationError;
use crate::services::vibe_embedder::EmbedError;

/// Longest error message persisted on a subject or in the failure log
pub const MAX_ERROR_LEN: usize = 500;

/// Truncate an error message to `MAX_ERROR_LEN` characters
pub fn truncate_error(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_LEN {
        message.to_string()
    } else {
        message.chars().take(MAX_ERROR_LEN).collect()
    }
}

/// Failure classification stored with each failure log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Timeout,
    RateLimited,
    NotFound,
    ProviderError,
    QueueError,
    StoreError,
    MaxRetriesExceeded,
    SystemError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ProviderError => "PROVIDER_ERROR",
            ErrorCode::QueueError => "QUEUE_ERROR",
            ErrorCode::StoreError => "STORE_ERROR",
            ErrorCode::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            ErrorCode::SystemError => "SYSTEM_ERROR",
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            ErrorCode::Timeout
            | ErrorCode::RateLimited
            | ErrorCode::ProviderError
            | ErrorCode::QueueError => FailureClass::TransientExternal,
            ErrorCode::NotFound | ErrorCode::MaxRetriesExceeded => FailureClass::Permanent,
            ErrorCode::StoreError | ErrorCode::SystemError => FailureClass::System,
        }
    }
}

/// How a failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retried on a later cycle
    TransientExternal,
    /// Terminal until an operator resets it
    Permanent,
    /// Fault in the orchestrator or its store, not in the subject
    System,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service-internal error
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error(transparent)]
    Common(#[from] cadenza_common::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Illegal status transition requested
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

pub type EnrichResult<T> = Result<T, EnrichError>;

/// Failure of one subject in a batch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ItemError {
    pub code: ErrorCode,
    pub message: String,
}

impl ItemError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: truncate_error(&message.into()),
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("Timed out after {}ms", limit.as_millis()),
        )
    }
}

impl From<ProviderError> for ItemError {
    fn from(err: ProviderError) -> Self {
        let code = match &err {
            ProviderError::NotFound(_) => ErrorCode::NotFound,
            ProviderError::RateLimited => ErrorCode::RateLimited,
            _ => ErrorCode::ProviderError,
        };
        ItemError::new(code, err.to_string())
    }
}

impl From<BrokerError> for ItemError {
    fn from(err: BrokerError) -> Self {
        ItemError::new(ErrorCode::QueueError, err.to_string())
    }
}

impl From<EnrichError> for ItemError {
    fn from(err: EnrichError) -> Self {
        let code = match &err {
            EnrichError::Broker(_) => ErrorCode::QueueError,
            _ => ErrorCode::StoreError,
        };
        ItemError::new(code, err.to_string())
    }
}

impl From<cadenza_common::Error> for ItemError {
    fn from(err: cadenza_common::Error) -> Self {
        ItemError::new(ErrorCode::StoreError, err.to_string())
    }
}

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A downstream analyzer or the broker could not answer (503)
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Enrich(#[from] EnrichError),

    #[error("Common error: {0}")]
    Common(#[from] cadenza_common::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<CorrelationError> for ApiError {
    fn from(err: CorrelationError) -> Self {
        match err {
            CorrelationError::Malformed(msg) => ApiError::Internal(msg),
            other => ApiError::ServiceUnavailable(other.to_string()),
        }
    }
}

impl From<EmbedError> for ApiError {
    fn from(err: EmbedError) -> Self {
        match err {
            EmbedError::InvalidText(msg) => ApiError::BadRequest(msg),
            EmbedError::Channel(err) => err.into(),
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        ApiError::ServiceUnavailable(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg)
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Enrich(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "ENRICH_ERROR",
                err.to_string(),
            ),
            ApiError::Common(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "COMMON_ERROR",
                err.to_string(),
            ),
            ApiError::Other(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
