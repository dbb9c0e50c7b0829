//! Seeking decryption of one encrypted part.
//!
//! A plaintext window is mapped to the sealed blocks that cover it. Only
//! those blocks are fetched; each is opened with the file nonce advanced by
//! its block index and cut to the window. A block that fails
//! authentication yields zeros so a damaged part never stalls a stream.

use crate::error::{StreamError, StreamResult};
use crate::plan::{PartRange, part_tasks};
use crate::reader::{ReaderOptions, schedule};
use crate::source::ChunkSource;
use crate::ByteStream;
use async_stream::try_stream;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::sync::Arc;
use teldrive_core::crypt::{
    BLOCK_DATA_SIZE, BLOCK_SIZE, BLOCK_TAG_SIZE, HEADER_LEN, Nonce, decrypted_size, parse_header,
};
use teldrive_core::Cipher;
use tracing::warn;

/// Stored blocks covering a plaintext window within one part.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BlockWindow {
    /// First plaintext byte (inclusive).
    start: u64,
    /// Last plaintext byte (inclusive), clamped to the part.
    end: u64,
    first_block: u64,
    /// Stored byte range to fetch (inclusive).
    cipher_start: u64,
    cipher_end: u64,
}

fn block_window(stored_size: u64, start: u64, end: u64) -> StreamResult<BlockWindow> {
    let plain_size = decrypted_size(stored_size)?;
    if start >= plain_size {
        return Err(StreamError::BadSeek(start));
    }
    if end < start {
        return Err(StreamError::InvalidRange { start, end });
    }
    let end = end.min(plain_size - 1);
    let first_block = start / BLOCK_DATA_SIZE;
    let last_block = end / BLOCK_DATA_SIZE;
    let cipher_start = HEADER_LEN + first_block * BLOCK_SIZE;
    let cipher_end = (HEADER_LEN + (last_block + 1) * BLOCK_SIZE).min(stored_size) - 1;
    Ok(BlockWindow {
        start,
        end,
        first_block,
        cipher_start,
        cipher_end,
    })
}

/// Decrypt plaintext bytes `[start, end]` of one encrypted part.
pub fn decrypt_part(
    part_id: i64,
    source: Arc<dyn ChunkSource>,
    cipher: Cipher,
    stored_size: u64,
    start: u64,
    end: u64,
    opts: ReaderOptions,
) -> ByteStream {
    Box::pin(try_stream! {
        let window = block_window(stored_size, start, end)?;
        let header = source.chunk(0, HEADER_LEN).await?;
        let nonce = parse_header(&header)?;

        let range = PartRange {
            part: 0,
            start: window.cipher_start,
            end: window.cipher_end,
        };
        let chunk = source.chunk_size(range.start, range.end);
        let tasks = part_tasks(&range, chunk);
        let mut sealed_stream = schedule(Arc::from(vec![source]), tasks, &opts);

        let mut buf = BytesMut::new();
        let mut block = window.first_block;
        while let Some(chunk) = sealed_stream.next().await {
            buf.extend_from_slice(&chunk?);
            while buf.len() as u64 >= BLOCK_SIZE {
                let sealed = buf.split_to(BLOCK_SIZE as usize);
                let plain = open_or_zero(&cipher, &nonce, block, &sealed, part_id, &opts);
                if let Some(out) = cut(plain, block, &window) {
                    yield out;
                }
                block += 1;
            }
        }
        if !buf.is_empty() {
            if buf.len() as u64 <= BLOCK_TAG_SIZE {
                Err::<(), _>(StreamError::BadHeader)?;
            }
            let plain = open_or_zero(&cipher, &nonce, block, &buf, part_id, &opts);
            if let Some(out) = cut(plain, block, &window) {
                yield out;
            }
        }
    })
}

fn open_or_zero(
    cipher: &Cipher,
    nonce: &Nonce,
    block: u64,
    sealed: &[u8],
    part_id: i64,
    opts: &ReaderOptions,
) -> Bytes {
    match cipher.open_block(&nonce.add(block), sealed) {
        Ok(plain) => Bytes::from(plain),
        Err(err) => {
            warn!(part_id, block, error = %err, "block failed authentication, zero-filling");
            opts.observer.block_zero_filled(part_id);
            Bytes::from(vec![0u8; sealed.len() - BLOCK_TAG_SIZE as usize])
        }
    }
}

/// Intersect a decrypted block with the plaintext window.
fn cut(plain: Bytes, block: u64, window: &BlockWindow) -> Option<Bytes> {
    let base = block * BLOCK_DATA_SIZE;
    if base > window.end {
        return None;
    }
    let lo = window.start.saturating_sub(base) as usize;
    let hi = ((window.end - base + 1) as usize).min(plain.len());
    (lo < hi).then(|| plain.slice(lo..hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::BytesSource;
    use futures::TryStreamExt;
    use teldrive_core::crypt::encrypted_size;

    fn cipher() -> Cipher {
        Cipher::from_key(&[7u8; 32]).unwrap()
    }

    fn plaintext(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    async fn read(stored: Vec<u8>, start: u64, end: u64) -> StreamResult<Vec<u8>> {
        let size = stored.len() as u64;
        let chunks: Vec<Bytes> = decrypt_part(
            1,
            Arc::new(BytesSource::new(stored)),
            cipher(),
            size,
            start,
            end,
            ReaderOptions::default(),
        )
        .try_collect()
        .await?;
        Ok(chunks.concat())
    }

    #[test]
    fn test_block_window_maps_to_sealed_blocks() {
        let stored = encrypted_size(200_000);
        let w = block_window(stored, 70_000, 140_000).unwrap();
        assert_eq!(w.first_block, 1);
        assert_eq!(w.cipher_start, HEADER_LEN + BLOCK_SIZE);
        assert_eq!(w.cipher_end, HEADER_LEN + 3 * BLOCK_SIZE - 1);

        let tail = block_window(stored, 199_000, 500_000).unwrap();
        assert_eq!(tail.end, 199_999);
        assert_eq!(tail.cipher_end, stored - 1);

        assert!(matches!(
            block_window(stored, 200_000, 200_001),
            Err(StreamError::BadSeek(200_000))
        ));
    }

    #[tokio::test]
    async fn test_seek_inside_blocks() {
        let plain = plaintext(300_000);
        let stored = cipher().encrypt(&Nonce::random(), &plain);

        assert_eq!(read(stored.clone(), 0, 299_999).await.unwrap(), plain);
        assert_eq!(
            read(stored.clone(), 65_530, 65_545).await.unwrap(),
            &plain[65_530..=65_545]
        );
        assert_eq!(
            read(stored, 131_072, 131_072).await.unwrap(),
            &plain[131_072..=131_072]
        );
    }

    #[tokio::test]
    async fn test_corrupt_block_reads_as_zeros() {
        let plain = plaintext(3 * BLOCK_DATA_SIZE as usize);
        let mut stored = cipher().encrypt(&Nonce::random(), &plain);
        let second = (HEADER_LEN + BLOCK_SIZE + 40) as usize;
        stored[second] ^= 0xff;

        let out = read(stored, 0, plain.len() as u64 - 1).await.unwrap();
        let b = BLOCK_DATA_SIZE as usize;
        assert_eq!(&out[..b], &plain[..b]);
        assert!(out[b..2 * b].iter().all(|&x| x == 0));
        assert_eq!(&out[2 * b..], &plain[2 * b..]);
    }

    #[tokio::test]
    async fn test_header_errors() {
        let plain = plaintext(100);
        let mut stored = cipher().encrypt(&Nonce::random(), &plain);
        stored[0] = b'X';
        assert!(matches!(read(stored, 0, 10).await, Err(StreamError::BadMagic)));

        assert!(matches!(
            read(vec![0u8; 10], 0, 1).await,
            Err(StreamError::FileTooShort)
        ));
    }
}
