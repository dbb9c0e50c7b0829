//! Core domain types and shared logic for teldrive.
//!
//! This crate defines the canonical data model used across all other crates:
//! - File nodes, parts and categories
//! - Upload part records
//! - Channels, bots and shares
//! - Change events
//! - BLAKE3 block and tree hashing
//! - Encrypted part framing (header, block seal/open, size arithmetic)
//! - The blob cache capability and its in-memory implementation
//! - Configuration records

pub mod cache;
pub mod channel;
pub mod config;
pub mod crypt;
pub mod error;
pub mod event;
pub mod file;
pub mod hash;
pub mod share;
pub mod upload;

pub use cache::{Cache, MemoryCache};
pub use channel::{Bot, Channel};
pub use crypt::{Cipher, Nonce, decrypted_size, encrypted_size};
pub use error::{Error, Result};
pub use event::{Event, EventSource, EventType};
pub use file::{Category, File, FileId, FileStatus, FileType, Part};
pub use hash::{BlockHasher, TreeHash};
pub use share::FileShare;
pub use upload::UploadPart;

/// Size of a hashing block: 16 MiB.
pub const HASH_BLOCK_SIZE: u64 = 16 * 1024 * 1024;

/// Width of one block hash in bytes.
pub const BLOCK_HASH_LEN: usize = 32;

/// Default upstream fetch granularity: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Smallest fetch granularity the chunk planner will shrink to.
pub const MIN_CHUNK_SIZE: u64 = 1024;
