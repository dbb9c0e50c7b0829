//! Common test utilities for the stream crate.

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use teldrive_stream::{ByteStream, ChunkSource, StreamResult};

/// An in-memory part that records fetches and can be slowed or stalled.
#[allow(dead_code)]
pub struct InstrumentedSource {
    data: Bytes,
    latency: Duration,
    /// Offsets at which a fetch never completes.
    stall_at: Option<u64>,
    pub fetches: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl InstrumentedSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            latency: Duration::ZERO,
            stall_at: None,
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn stall_at(mut self, offset: u64) -> Self {
        self.stall_at = Some(offset);
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChunkSource for InstrumentedSource {
    async fn chunk(&self, offset: u64, limit: u64) -> StreamResult<Bytes> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.stall_at == Some(offset) {
            std::future::pending::<()>().await;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let len = self.data.len() as u64;
        let start = offset.min(len) as usize;
        let end = offset.saturating_add(limit).min(len) as usize;
        Ok(self.data.slice(start..end))
    }
}

/// Deterministic pseudo-random content.
#[allow(dead_code)]
pub fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u32).wrapping_mul(2_654_435_761) >> 13) as u8 ^ seed)
        .collect()
}

/// Drain a stream into one buffer.
#[allow(dead_code)]
pub async fn collect(stream: ByteStream) -> StreamResult<Vec<u8>> {
    let chunks: Vec<Bytes> = stream.try_collect().await?;
    Ok(chunks.concat())
}
