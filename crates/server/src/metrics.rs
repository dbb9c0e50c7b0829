//! Prometheus metrics for the teldrive server.
//!
//! Covers the streaming engine (active streams, bytes, chunk latency and
//! failures), uploads, channel rollover, event fan-out and the deletion
//! worker.
//!
//! The `/metrics` endpoint is unauthenticated so Prometheus can scrape it.
//! Metrics carry no user ids, file names or channel ids, only aggregates.
//! Restrict the endpoint at the network level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};
use std::time::Duration;
use teldrive_stream::{StreamError, StreamObserver};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Streaming
pub static ACTIVE_STREAMS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "teldrive_active_streams",
        "Current number of file streams being served",
    )
    .expect("metric creation failed")
});

pub static STREAMED_BYTES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "teldrive_streamed_bytes_total",
        "Total bytes fetched from upstream for streams",
    )
    .expect("metric creation failed")
});

pub static CHUNK_FETCH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "teldrive_chunk_fetch_duration_seconds",
            "Time taken to fetch one chunk from upstream",
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0]),
    )
    .expect("metric creation failed")
});

pub static CHUNK_FETCH_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "teldrive_chunk_fetch_failures_total",
            "Chunk fetch failures by error code",
        ),
        &["code"],
    )
    .expect("metric creation failed")
});

pub static DECRYPT_BLOCK_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "teldrive_decrypt_block_failures_total",
        "Encrypted blocks that failed authentication and were zero-filled",
    )
    .expect("metric creation failed")
});

// Uploads and channels
pub static UPLOAD_PARTS_STORED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "teldrive_upload_parts_stored_total",
        "Upload parts recorded",
    )
    .expect("metric creation failed")
});

pub static UPLOADED_BYTES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "teldrive_uploaded_bytes_total",
        "Bytes sent upstream by server-side uploads",
    )
    .expect("metric creation failed")
});

pub static CHANNEL_ROLLOVERS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "teldrive_channel_rollovers_total",
            "Channel rollover attempts by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

// Events
pub static EVENTS_BROADCAST: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "teldrive_events_broadcast_total",
        "Events delivered to local subscribers",
    )
    .expect("metric creation failed")
});

pub static EVENTS_DROPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "teldrive_events_dropped_total",
        "Events dropped because a subscriber queue was full",
    )
    .expect("metric creation failed")
});

pub static EVENT_SUBSCRIBERS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "teldrive_event_subscribers",
        "Current number of event subscribers",
    )
    .expect("metric creation failed")
});

// Background workers
pub static MESSAGES_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "teldrive_messages_deleted_total",
        "Channel messages deleted by background workers",
    )
    .expect("metric creation failed")
});

pub static CRON_RUNS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("teldrive_cron_runs_total", "Background job runs by job and outcome"),
        &["job", "outcome"],
    )
    .expect("metric creation failed")
});

static REGISTER: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Safe to call more than once.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        REGISTRY
            .register(Box::new(ACTIVE_STREAMS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(STREAMED_BYTES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNK_FETCH_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNK_FETCH_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DECRYPT_BLOCK_FAILURES.clone()))
            .expect("metric registration failed");

        REGISTRY
            .register(Box::new(UPLOAD_PARTS_STORED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADED_BYTES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHANNEL_ROLLOVERS.clone()))
            .expect("metric registration failed");

        REGISTRY
            .register(Box::new(EVENTS_BROADCAST.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(EVENTS_DROPPED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(EVENT_SUBSCRIBERS.clone()))
            .expect("metric registration failed");

        REGISTRY
            .register(Box::new(MESSAGES_DELETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CRON_RUNS.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Feeds reader callbacks into the global metrics.
pub struct MetricsObserver;

impl StreamObserver for MetricsObserver {
    fn chunk_fetched(&self, bytes: usize, elapsed: Duration) {
        STREAMED_BYTES.inc_by(bytes as u64);
        CHUNK_FETCH_DURATION.observe(elapsed.as_secs_f64());
    }

    fn chunk_failed(&self, error: &StreamError) {
        CHUNK_FETCH_FAILURES.with_label_values(&[error.code()]).inc();
    }

    fn block_zero_filled(&self, part_id: i64) {
        DECRYPT_BLOCK_FAILURES.inc();
        tracing::warn!(part_id, "encrypted block failed authentication, zero-filled");
    }
}

/// Decrements [`ACTIVE_STREAMS`] when the response body is dropped.
pub struct ActiveStreamGuard;

impl ActiveStreamGuard {
    pub fn new() -> Self {
        ACTIVE_STREAMS.inc();
        Self
    }
}

impl Default for ActiveStreamGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ActiveStreamGuard {
    fn drop(&mut self) {
        ACTIVE_STREAMS.dec();
    }
}

/// Record the outcome of a background job run.
pub fn record_cron_run(job: &str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    CRON_RUNS.with_label_values(&[job, outcome]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        register_metrics();
        register_metrics();
    }

    #[test]
    fn test_active_stream_guard_balances() {
        let before = ACTIVE_STREAMS.get();
        {
            let _guard = ActiveStreamGuard::new();
            assert_eq!(ACTIVE_STREAMS.get(), before + 1);
        }
        assert_eq!(ACTIVE_STREAMS.get(), before);
    }
}
