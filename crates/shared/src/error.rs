use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Missing or malformed input; never retried.
    Validation,
    /// Entity no longer resolvable; terminal for the affected item.
    NotFound,
    /// Provider throttling; retried by the orchestrator with backoff only.
    RateLimited,
    /// Bounded retries, then surfaced.
    Timeout,
    /// Session invalid; fatal for the whole cycle, re-auth required.
    Credential,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    /// Server-suggested wait, set for `RateLimited` when the provider gave one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_seconds: u64) -> Self {
        Self {
            code: ErrorCode::RateLimited,
            message: message.into(),
            retry_after_seconds: Some(retry_after_seconds),
        }
    }
}
