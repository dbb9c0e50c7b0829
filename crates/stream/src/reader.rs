//! Range reader over a file's ordered parts.

use crate::concurrent::{SchedulerLimits, concurrent_stream};
use crate::decrypt::decrypt_part;
use crate::error::{StreamError, StreamResult};
use crate::linear::linear_stream;
use crate::plan::{ChunkTask, part_ranges, part_tasks};
use crate::source::{ChunkSource, NoopObserver, StreamObserver};
use crate::ByteStream;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use teldrive_core::Cipher;
use teldrive_core::crypt::decrypted_size;
use tokio_util::sync::CancellationToken;

/// One part of a file as the reader sees it.
pub struct PartSpec {
    pub part_id: i64,
    pub source: Arc<dyn ChunkSource>,
    /// Size of the stored blob (ciphertext when encrypted).
    pub stored_size: u64,
    /// Present when the part is encrypted.
    pub cipher: Option<Cipher>,
}

impl PartSpec {
    /// Plaintext bytes held by this part.
    pub fn plain_size(&self) -> StreamResult<u64> {
        match self.cipher {
            Some(_) => Ok(decrypted_size(self.stored_size)?),
            None => Ok(self.stored_size),
        }
    }
}

/// Per-stream scheduling options.
#[derive(Clone)]
pub struct ReaderOptions {
    /// Concurrent fetches per batch; 0 reads sequentially.
    pub workers: usize,
    pub buffers: usize,
    pub chunk_timeout: Duration,
    /// Cancelled when the consumer goes away.
    pub cancel: CancellationToken,
    pub observer: Arc<dyn StreamObserver>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            workers: 0,
            buffers: 8,
            chunk_timeout: Duration::from_secs(20),
            cancel: CancellationToken::new(),
            observer: Arc::new(NoopObserver),
        }
    }
}

impl ReaderOptions {
    fn limits(&self) -> SchedulerLimits {
        SchedulerLimits {
            workers: self.workers,
            buffers: self.buffers,
            chunk_timeout: self.chunk_timeout,
        }
    }
}

/// Run a task list with the sequential or pipelined scheduler.
pub(crate) fn schedule(
    sources: Arc<[Arc<dyn ChunkSource>]>,
    tasks: Vec<ChunkTask>,
    opts: &ReaderOptions,
) -> ByteStream {
    if opts.workers == 0 {
        linear_stream(sources, tasks, opts.cancel.clone(), Arc::clone(&opts.observer))
    } else {
        concurrent_stream(
            sources,
            tasks,
            opts.limits(),
            opts.cancel.clone(),
            Arc::clone(&opts.observer),
        )
    }
}

/// Stream plaintext bytes `[start, end]` (inclusive) of a file.
///
/// Parts are uniform in plaintext size except possibly the last; the size of
/// the first part fixes the stride. Encrypted parts are decrypted one after
/// another; plaintext parts share one chunk schedule so prefetching crosses
/// part boundaries.
pub fn read_range(
    parts: Vec<PartSpec>,
    start: u64,
    end: u64,
    opts: ReaderOptions,
) -> StreamResult<ByteStream> {
    let total = parts.iter().try_fold(0u64, |acc, p| Ok::<_, StreamError>(acc + p.plain_size()?))?;
    if end < start || end >= total {
        return Err(StreamError::InvalidRange { start, end });
    }
    let stride = parts[0].plain_size()?;
    let ranges = part_ranges(stride, parts.len(), start, end);

    if parts[0].cipher.is_none() {
        let mut tasks = Vec::new();
        for range in &ranges {
            let chunk = parts[range.part].source.chunk_size(range.start, range.end);
            tasks.extend(part_tasks(range, chunk));
        }
        let sources: Arc<[Arc<dyn ChunkSource>]> =
            parts.iter().map(|p| Arc::clone(&p.source)).collect();
        return Ok(schedule(sources, tasks, &opts));
    }

    let mut streams = Vec::with_capacity(ranges.len());
    for range in ranges {
        let part = &parts[range.part];
        let cipher = part.cipher.clone().ok_or(StreamError::MissingKey)?;
        streams.push(decrypt_part(
            part.part_id,
            Arc::clone(&part.source),
            cipher,
            part.stored_size,
            range.start,
            range.end,
            opts.clone(),
        ));
    }
    Ok(Box::pin(stream::iter(streams).flatten()))
}
