//! Pipelined chunk reader.
//!
//! A producer task fetches batches of up to `workers` chunks at once and
//! forwards each batch in order into a channel of capacity `buffers`. The
//! consumer stream owns a guard that cancels the producer when dropped.

use crate::error::{StreamError, StreamResult};
use crate::plan::ChunkTask;
use crate::source::{ChunkSource, StreamObserver, fetch_task};
use crate::ByteStream;
use async_stream::stream;
use bytes::Bytes;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Scheduler limits for one stream.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerLimits {
    /// Concurrent fetches per batch.
    pub workers: usize,
    /// Chunks buffered ahead of the consumer.
    pub buffers: usize,
    /// Deadline for a single chunk fetch.
    pub chunk_timeout: Duration,
}

/// Fetch `tasks` in parallel batches and yield them in order.
pub fn concurrent_stream(
    sources: Arc<[Arc<dyn ChunkSource>]>,
    tasks: Vec<ChunkTask>,
    limits: SchedulerLimits,
    cancel: CancellationToken,
    observer: Arc<dyn StreamObserver>,
) -> ByteStream {
    let total = tasks.len();
    let cancel = cancel.child_token();
    let (tx, mut rx) = mpsc::channel::<StreamResult<Bytes>>(limits.buffers.max(1));

    tokio::spawn(produce(
        sources,
        tasks,
        limits,
        cancel.clone(),
        observer,
        tx,
    ));

    // Held by the stream from creation, so dropping it unpolled still stops
    // the producer.
    let guard = cancel.drop_guard();
    Box::pin(stream! {
        let _guard = guard;
        let mut delivered = 0usize;
        while delivered < total {
            match rx.recv().await {
                Some(Ok(chunk)) => {
                    delivered += 1;
                    yield Ok(chunk);
                }
                Some(Err(err)) => {
                    yield Err(err);
                    return;
                }
                None => {
                    yield Err(StreamError::StreamAbandoned);
                    return;
                }
            }
        }
    })
}

async fn produce(
    sources: Arc<[Arc<dyn ChunkSource>]>,
    tasks: Vec<ChunkTask>,
    limits: SchedulerLimits,
    cancel: CancellationToken,
    observer: Arc<dyn StreamObserver>,
    tx: mpsc::Sender<StreamResult<Bytes>>,
) {
    for batch in tasks.chunks(limits.workers.max(1)) {
        let fetches = batch.iter().map(|task| {
            let source = Arc::clone(&sources[task.part]);
            let observer = Arc::clone(&observer);
            async move {
                match tokio::time::timeout(
                    limits.chunk_timeout,
                    fetch_task(source.as_ref(), task, observer.as_ref()),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        let err = StreamError::ChunkTimeout {
                            part: task.part,
                            offset: task.offset,
                        };
                        observer.chunk_failed(&err);
                        Err(err)
                    }
                }
            }
        });

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("chunk producer cancelled");
                return;
            }
            result = try_join_all(fetches) => result,
        };

        match result {
            Ok(chunks) => {
                for chunk in chunks {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        sent = tx.send(Ok(chunk)) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        }
    }
}
