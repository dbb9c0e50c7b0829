//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid part list: {0}")]
    InvalidParts(String),

    #[error("invalid file type: {0}")]
    InvalidFileType(String),

    #[error("invalid event type: {0}")]
    InvalidEventType(String),

    #[error("file too short to hold an encryption header")]
    FileTooShort,

    #[error("bad magic in encrypted part header")]
    BadMagic,

    #[error("bad encrypted size: {0}")]
    BadSize(u64),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("block authentication failed")]
    BlockAuthentication,

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
