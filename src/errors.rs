//! Error types for the allocation engine and its provider adapters

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Errors returned by the allocator's control surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    /// No placement is possible even after eviction and preemption.
    #[error("resources exhausted: {reason}")]
    ResourceExhausted { reason: String },

    /// A provider adapter call failed or timed out.
    #[error("provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    /// The request depends on a requester that still holds an allocation.
    #[error("requester '{requester_id}' is blocked by active allocation of '{blocking}'")]
    BlockedByDependency {
        requester_id: String,
        blocking: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The derived ledger usage exceeded the limit. Impossible unless the lock discipline broke.
    #[error("capacity invariant violated: used {used} bytes > limit {limit} bytes")]
    InvariantViolation { used: u64, limit: u64 },
}

impl AllocationError {
    pub(crate) fn exhausted(reason: impl Into<String>) -> Self {
        AllocationError::ResourceExhausted {
            reason: reason.into(),
        }
    }

    pub(crate) fn provider(provider: &str, err: impl std::fmt::Display) -> Self {
        AllocationError::ProviderUnavailable {
            provider: provider.to_string(),
            reason: err.to_string(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AllocationError::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AllocationError::ProviderUnavailable { .. } => StatusCode::BAD_GATEWAY,
            AllocationError::BlockedByDependency { .. } => StatusCode::CONFLICT,
            AllocationError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AllocationError::InvariantViolation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AllocationError::ResourceExhausted { .. } => "resource_exhausted",
            AllocationError::ProviderUnavailable { .. } => "provider_unavailable",
            AllocationError::BlockedByDependency { .. } => "blocked_by_dependency",
            AllocationError::InvalidRequest(_) => "invalid_request",
            AllocationError::InvariantViolation { .. } => "invariant_violation",
        }
    }
}

impl IntoResponse for AllocationError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

/// Errors raised by provider adapters
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("failed to decode response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("operation '{operation}' is not supported by this provider")]
    Unsupported { operation: &'static str },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}
