//! Sequential chunk reader.

use crate::error::StreamError;
use crate::plan::ChunkTask;
use crate::source::{ChunkSource, StreamObserver, fetch_task};
use crate::ByteStream;
use async_stream::try_stream;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Fetch `tasks` one at a time, in order.
pub fn linear_stream(
    sources: Arc<[Arc<dyn ChunkSource>]>,
    tasks: Vec<ChunkTask>,
    cancel: CancellationToken,
    observer: Arc<dyn StreamObserver>,
) -> ByteStream {
    Box::pin(try_stream! {
        for task in tasks {
            let source = Arc::clone(&sources[task.part]);
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StreamError::StreamAbandoned),
                chunk = fetch_task(source.as_ref(), &task, observer.as_ref()) => chunk,
            }?;
            yield chunk;
        }
    })
}
