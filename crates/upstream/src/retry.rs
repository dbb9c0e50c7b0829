//! Retry and rate-limit middleware for upstream clients.
//!
//! Every call first takes a token from a per-client bucket. Flood waits are
//! honoured by sleeping for the requested time; other transient failures are
//! retried with exponential back-off. After `max_attempts` the error surfaces.

use crate::error::{UpstreamError, UpstreamResult};
use crate::traits::{HistoryPage, Identity, MessageLocation, UpstreamClient};
use async_trait::async_trait;
use bytes::Bytes;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// Base delay for exponential back-off.
const BASE_BACKOFF: Duration = Duration::from_millis(100);

/// Longest flood wait honoured in-process; longer waits surface to the caller.
const MAX_FLOOD_WAIT_SECS: u64 = 60;

/// Retry policy shared by pooled clients.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub rate: u32,
    pub burst: u32,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &teldrive_core::config::UpstreamConfig) -> Self {
        Self {
            rate: config.rate,
            burst: config.burst,
            max_attempts: config.max_retries,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate: 100,
            burst: 5,
            max_attempts: 5,
        }
    }
}

/// An [`UpstreamClient`] wrapped with rate limiting and retries.
pub struct RetryClient {
    inner: Arc<dyn UpstreamClient>,
    limiter: DefaultDirectRateLimiter,
    max_attempts: u32,
}

impl RetryClient {
    pub fn new(inner: Arc<dyn UpstreamClient>, policy: RetryPolicy) -> Self {
        let rate = NonZeroU32::new(policy.rate).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(policy.burst).unwrap_or(NonZeroU32::MIN);
        Self {
            inner,
            limiter: RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)),
            max_attempts: policy.max_attempts.max(1),
        }
    }

    async fn run<T, F, Fut>(&self, op: &'static str, mut call: F) -> UpstreamResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = UpstreamResult<T>> + Send,
        T: Send,
    {
        let mut attempt = 0u32;
        loop {
            self.limiter.until_ready().await;
            attempt += 1;
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= self.max_attempts {
                tracing::warn!(op, attempt, error = %err, "upstream call failed, giving up");
                return Err(err);
            }
            let delay = match &err {
                UpstreamError::FloodWait(secs) if *secs <= MAX_FLOOD_WAIT_SECS => {
                    Duration::from_secs(*secs)
                }
                e if e.is_retryable() => BASE_BACKOFF * 2u32.saturating_pow(attempt - 1),
                _ => return Err(err),
            };
            tracing::debug!(op, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying upstream call");
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl UpstreamClient for RetryClient {
    async fn self_info(&self) -> UpstreamResult<Identity> {
        self.run("self_info", || self.inner.self_info()).await
    }

    async fn messages(&self, channel_id: i64, ids: &[i64]) -> UpstreamResult<Vec<MessageLocation>> {
        self.run("messages", || self.inner.messages(channel_id, ids))
            .await
    }

    async fn download(
        &self,
        location: &MessageLocation,
        offset: u64,
        limit: u64,
    ) -> UpstreamResult<Bytes> {
        self.run("download", || self.inner.download(location, offset, limit))
            .await
    }

    async fn send_media(
        &self,
        channel_id: i64,
        name: &str,
        data: Bytes,
    ) -> UpstreamResult<MessageLocation> {
        self.run("send_media", || {
            self.inner.send_media(channel_id, name, data.clone())
        })
        .await
    }

    async fn copy_media(
        &self,
        source: &MessageLocation,
        channel_id: i64,
    ) -> UpstreamResult<MessageLocation> {
        self.run("copy_media", || self.inner.copy_media(source, channel_id))
            .await
    }

    async fn delete_messages(&self, channel_id: i64, ids: &[i64]) -> UpstreamResult<()> {
        self.run("delete_messages", || {
            self.inner.delete_messages(channel_id, ids)
        })
        .await
    }

    async fn create_channel(&self, title: &str) -> UpstreamResult<i64> {
        self.run("create_channel", || self.inner.create_channel(title))
            .await
    }

    async fn promote_admin(&self, channel_id: i64, bot_id: i64) -> UpstreamResult<()> {
        self.run("promote_admin", || {
            self.inner.promote_admin(channel_id, bot_id)
        })
        .await
    }

    async fn history(
        &self,
        channel_id: i64,
        offset_id: i64,
        limit: usize,
    ) -> UpstreamResult<HistoryPage> {
        self.run("history", || self.inner.history(channel_id, offset_id, limit))
            .await
    }

    async fn profile_photo(&self) -> UpstreamResult<Option<Bytes>> {
        self.run("profile_photo", || self.inner.profile_photo())
            .await
    }
}
