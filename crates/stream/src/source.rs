//! Chunk sources: where part bytes come from.

use crate::error::{StreamError, StreamResult};
use crate::plan::ChunkTask;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use teldrive_core::cache::{self, Cache};
use teldrive_core::FileId;
use teldrive_upstream::{MessageLocation, UpstreamClient};
use tokio::sync::OnceCell;

/// How long a resolved part location stays cached.
pub const LOCATION_TTL: Duration = Duration::from_secs(30 * 60);

/// Byte-range access to one part's stored blob.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Fetch granularity for reading `[start, end]` of this part.
    fn chunk_size(&self, start: u64, end: u64) -> u64 {
        crate::plan::chunk_size(start, end)
    }

    /// `limit` bytes starting at `offset`. Short only at the end of the blob.
    async fn chunk(&self, offset: u64, limit: u64) -> StreamResult<Bytes>;
}

/// Hooks for metrics and diagnostics. All methods default to no-ops.
pub trait StreamObserver: Send + Sync {
    fn chunk_fetched(&self, _bytes: usize, _elapsed: Duration) {}

    fn chunk_failed(&self, _error: &StreamError) {}

    /// A sealed block failed authentication and was replaced with zeros.
    fn block_zero_filled(&self, _part_id: i64) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl StreamObserver for NoopObserver {}

/// Fetch one planned chunk and cut it to the window.
pub(crate) async fn fetch_task(
    source: &dyn ChunkSource,
    task: &ChunkTask,
    observer: &dyn StreamObserver,
) -> StreamResult<Bytes> {
    let started = Instant::now();
    let chunk = match source.chunk(task.offset, task.limit).await {
        Ok(chunk) => chunk,
        Err(err) => {
            observer.chunk_failed(&err);
            return Err(err);
        }
    };
    observer.chunk_fetched(chunk.len(), started.elapsed());
    if chunk.len() < task.keep.end {
        let err = StreamError::UnexpectedEof {
            wanted: task.keep.end as u64,
            got: chunk.len() as u64,
        };
        observer.chunk_failed(&err);
        return Err(err);
    }
    Ok(chunk.slice(task.keep.clone()))
}

/// A part stored as a channel message, read through an upstream client.
///
/// The message location is resolved once per source and shared through the
/// blob cache under `location:{fileId}:{partId}`.
pub struct PartChunkSource {
    client: Arc<dyn UpstreamClient>,
    cache: Arc<dyn Cache>,
    file_id: FileId,
    channel_id: i64,
    part_id: i64,
    location: OnceCell<MessageLocation>,
}

impl PartChunkSource {
    pub fn new(
        client: Arc<dyn UpstreamClient>,
        cache: Arc<dyn Cache>,
        file_id: FileId,
        channel_id: i64,
        part_id: i64,
    ) -> Self {
        Self {
            client,
            cache,
            file_id,
            channel_id,
            part_id,
            location: OnceCell::new(),
        }
    }

    pub fn part_id(&self) -> i64 {
        self.part_id
    }

    /// Resolve (and cache) the part's message location.
    pub async fn location(&self) -> StreamResult<&MessageLocation> {
        self.location
            .get_or_try_init(|| async {
                let key = cache::location_key(&self.file_id, self.part_id);
                if let Some(location) =
                    cache::get_json::<MessageLocation>(self.cache.as_ref(), &key).await
                {
                    return Ok(location);
                }
                let location = self
                    .client
                    .messages(self.channel_id, &[self.part_id])
                    .await?
                    .into_iter()
                    .find(|m| m.message_id == self.part_id)
                    .ok_or(StreamError::PartNotFound(self.part_id))?;
                cache::set_json(self.cache.as_ref(), &key, &location, LOCATION_TTL).await;
                Ok(location)
            })
            .await
    }

    /// Stored size of the part in bytes.
    pub async fn size(&self) -> StreamResult<u64> {
        Ok(self.location().await?.size.max(0) as u64)
    }
}

#[async_trait]
impl ChunkSource for PartChunkSource {
    async fn chunk(&self, offset: u64, limit: u64) -> StreamResult<Bytes> {
        let location = self.location().await?;
        Ok(self.client.download(location, offset, limit).await?)
    }
}

/// A source over an in-memory blob.
pub struct BytesSource {
    data: Bytes,
}

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ChunkSource for BytesSource {
    async fn chunk(&self, offset: u64, limit: u64) -> StreamResult<Bytes> {
        let len = self.data.len() as u64;
        let start = offset.min(len) as usize;
        let end = offset.saturating_add(limit).min(len) as usize;
        Ok(self.data.slice(start..end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teldrive_core::MemoryCache;
    use teldrive_upstream::{Connector, Credential, MemoryConnector, MemoryNetwork};

    #[tokio::test]
    async fn test_part_source_caches_location() {
        let network = MemoryNetwork::new();
        let connector = MemoryConnector::new(Arc::clone(&network));
        let client = connector
            .connect(1, &Credential::Session("1:s".into()))
            .await
            .unwrap();
        let channel = client.create_channel("c").await.unwrap();
        let loc = client
            .send_media(channel, "p", Bytes::from_static(b"part-bytes"))
            .await
            .unwrap();

        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::default());
        let file_id = FileId::new();
        let source = PartChunkSource::new(
            Arc::clone(&client),
            Arc::clone(&cache),
            file_id,
            channel,
            loc.message_id,
        );
        assert_eq!(source.size().await.unwrap(), 10);
        assert_eq!(&source.chunk(5, 5).await.unwrap()[..], b"bytes");

        let key = cache::location_key(&file_id, loc.message_id);
        assert!(cache.get(&key).await.is_some());
    }

    #[tokio::test]
    async fn test_missing_part_is_reported() {
        let network = MemoryNetwork::new();
        let connector = MemoryConnector::new(network);
        let client = connector
            .connect(1, &Credential::Session("1:s".into()))
            .await
            .unwrap();
        let channel = client.create_channel("c").await.unwrap();
        let source = PartChunkSource::new(
            client,
            Arc::new(MemoryCache::default()),
            FileId::new(),
            channel,
            42,
        );
        assert!(matches!(
            source.chunk(0, 1).await,
            Err(StreamError::PartNotFound(42))
        ));
    }
}
