//! Upstream RPC error types.

use thiserror::Error;

/// Upstream operation errors.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The service asked the caller to back off for this many seconds.
    #[error("flood wait: retry after {0}s")]
    FloodWait(u64),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("client closed")]
    Closed,
}

impl UpstreamError {
    /// Transient failures worth another attempt with back-off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamError::Rpc(_) | UpstreamError::Timeout(_) | UpstreamError::Io(_)
        )
    }

    /// Short machine-readable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::NotFound(_) => "not_found",
            UpstreamError::Unauthorized(_) => "unauthorized",
            UpstreamError::Forbidden(_) => "forbidden",
            UpstreamError::FloodWait(_) => "flood_wait",
            UpstreamError::Rpc(_) => "rpc",
            UpstreamError::Timeout(_) => "timeout",
            UpstreamError::Io(_) => "io",
            UpstreamError::Serialization(_) => "serialization",
            UpstreamError::InvalidRequest(_) => "invalid_request",
            UpstreamError::Closed => "closed",
        }
    }
}

/// Result type for upstream operations.
pub type UpstreamResult<T> = std::result::Result<T, UpstreamError>;
