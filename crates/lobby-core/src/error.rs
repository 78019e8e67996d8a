use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SourceState;

/// Broad error category used for recovery decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Backfill or poll fetch failed.
    Query,
    /// Durable write failed.
    Write,
    /// Push subscription failed or was closed.
    Subscription,
    /// Push subscription never confirmed.
    SubscriptionTimeout,
    /// Invalid configuration or input.
    Config,
    /// Payload could not be encoded or decoded.
    Serialization,
    /// Internal invariant break.
    Internal,
}

/// Stable error payload shared by stores and session runtimes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    /// High-level error category.
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl SyncError {
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn query(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Query, code, message)
    }

    pub fn write(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Write, code, message)
    }

    pub fn subscription(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Subscription, code, message)
    }

    pub fn config(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Config, code, message)
    }

    pub fn serialization(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Serialization, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Internal, code, message)
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: SourceState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SyncErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while session is in state {current:?}"),
        )
    }
}

/// Map HTTP status codes to stable error codes.
pub fn http_error_code(status: u16) -> &'static str {
    match status {
        401 | 403 => "unauthorized",
        404 => "not_found",
        408 | 429 => "rate_limited",
        400..=499 => "bad_request",
        500..=599 => "server_error",
        _ => "http_error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_http_status_to_stable_codes() {
        assert_eq!(http_error_code(401), "unauthorized");
        assert_eq!(http_error_code(404), "not_found");
        assert_eq!(http_error_code(429), "rate_limited");
        assert_eq!(http_error_code(422), "bad_request");
        assert_eq!(http_error_code(503), "server_error");
        assert_eq!(http_error_code(700), "http_error");
    }

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = SyncError::invalid_state(SourceState::Stopped, "subscription_status");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.category, SyncErrorCategory::Internal);
        assert!(err.message.contains("Stopped"));
    }
}
