//! BLAKE3 block and tree hashing.
//!
//! Content is split into fixed 16 MiB blocks. Each block is hashed with
//! BLAKE3 and the 32-byte digests are concatenated; the file identity is the
//! BLAKE3 of that concatenation. Splitting a file into parts at block
//! boundaries therefore yields the same tree hash regardless of part count.

use crate::{BLOCK_HASH_LEN, HASH_BLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tree hash of a file's plaintext.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeHash([u8; 32]);

impl TreeHash {
    /// Hash of a file with no content: BLAKE3 of the empty input.
    pub fn empty() -> Self {
        Self(*blake3::hash(&[]).as_bytes())
    }

    /// Compute the tree hash from concatenated block hashes.
    ///
    /// Inputs are concatenated in order, so per-part block hash buffers can be
    /// passed straight from the upload records.
    pub fn from_block_hashes<'a, I>(parts: I) -> crate::Result<Self>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut hasher = blake3::Hasher::new();
        for block_hashes in parts {
            if block_hashes.len() % BLOCK_HASH_LEN != 0 {
                return Err(crate::Error::InvalidHash(format!(
                    "block hash buffer length {} is not a multiple of {}",
                    block_hashes.len(),
                    BLOCK_HASH_LEN
                )));
            }
            hasher.update(block_hashes);
        }
        Ok(Self(*hasher.finalize().as_bytes()))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s).map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            crate::Error::InvalidHash(format!("expected 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(arr))
    }

    /// Encode as lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental hasher producing one BLAKE3 digest per 16 MiB block.
pub struct BlockHasher {
    current: blake3::Hasher,
    filled: u64,
    block_size: u64,
    out: Vec<u8>,
}

impl BlockHasher {
    pub fn new() -> Self {
        Self::with_block_size(HASH_BLOCK_SIZE)
    }

    /// Use a non-standard block size (tests only need small blocks).
    pub fn with_block_size(block_size: u64) -> Self {
        Self {
            current: blake3::Hasher::new(),
            filled: 0,
            block_size: block_size.max(1),
            out: Vec::new(),
        }
    }

    /// Feed plaintext bytes.
    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = (self.block_size - self.filled) as usize;
            let take = room.min(data.len());
            self.current.update(&data[..take]);
            self.filled += take as u64;
            data = &data[take..];
            if self.filled == self.block_size {
                self.flush_block();
            }
        }
    }

    fn flush_block(&mut self) {
        let digest = std::mem::take(&mut self.current).finalize();
        self.out.extend_from_slice(digest.as_bytes());
        self.filled = 0;
    }

    /// Finish the trailing partial block and return the concatenated hashes.
    pub fn finalize(mut self) -> Vec<u8> {
        if self.filled > 0 {
            self.flush_block();
        }
        self.out
    }
}

impl Default for BlockHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a complete in-memory buffer into concatenated block hashes.
pub fn block_hashes(data: &[u8]) -> Vec<u8> {
    let mut hasher = BlockHasher::new();
    hasher.update(data);
    hasher.finalize()
}
