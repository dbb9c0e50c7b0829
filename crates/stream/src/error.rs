//! Stream error types.

use teldrive_upstream::UpstreamError;
use thiserror::Error;

/// Errors surfaced while materialising a byte window.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("chunk fetch timed out (part {part}, offset {offset})")]
    ChunkTimeout { part: usize, offset: u64 },

    #[error("stream abandoned before the window was delivered")]
    StreamAbandoned,

    #[error("unexpected end of part: wanted {wanted} bytes, got {got}")]
    UnexpectedEof { wanted: u64, got: u64 },

    #[error("bad magic in encrypted part header")]
    BadMagic,

    #[error("file too short to hold an encryption header")]
    FileTooShort,

    #[error("truncated encrypted block header")]
    BadHeader,

    #[error("seek past end of encrypted part: {0}")]
    BadSeek(u64),

    #[error("bad encrypted size: {0}")]
    BadSize(u64),

    #[error("part not found: {0}")]
    PartNotFound(i64),

    #[error("invalid range {start}-{end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("encryption key is not configured")]
    MissingKey,

    #[error("crypto error: {0}")]
    Crypto(String),
}

impl StreamError {
    /// Machine-readable code used in logs and error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::Upstream(_) | StreamError::PartNotFound(_) => "upstream_failure",
            StreamError::ChunkTimeout { .. } => "chunk_timeout",
            StreamError::StreamAbandoned => "stream_abandoned",
            StreamError::UnexpectedEof { .. } => "upstream_failure",
            StreamError::BadMagic => "bad_magic",
            StreamError::FileTooShort => "file_too_short",
            StreamError::BadHeader => "bad_header",
            StreamError::BadSeek(_) => "bad_seek",
            StreamError::BadSize(_) => "bad_size",
            StreamError::InvalidRange { .. } => "range_not_satisfiable",
            StreamError::MissingKey | StreamError::Crypto(_) => "internal_error",
        }
    }
}

impl From<teldrive_core::Error> for StreamError {
    fn from(err: teldrive_core::Error) -> Self {
        match err {
            teldrive_core::Error::FileTooShort => StreamError::FileTooShort,
            teldrive_core::Error::BadMagic => StreamError::BadMagic,
            teldrive_core::Error::BadSize(n) => StreamError::BadSize(n),
            other => StreamError::Crypto(other.to_string()),
        }
    }
}

/// Result type for stream operations.
pub type StreamResult<T> = std::result::Result<T, StreamError>;
