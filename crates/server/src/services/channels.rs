//! Default-channel selection and rollover.
//!
//! Every upload lands in the user's selected channel. Once that channel holds
//! `channel.message_limit` messages a new channel is created, the user's bots
//! are promoted into it and it becomes the selected one. Rollover runs under a
//! per-user lock so concurrent uploads create at most one channel, and it is
//! best-effort: on any failure the current channel keeps serving uploads.

use crate::error::{ApiError, ApiResult};
use crate::metrics::CHANNEL_ROLLOVERS;
use dashmap::DashMap;
use futures::{StreamExt, stream};
use std::sync::Arc;
use std::time::Duration;
use teldrive_core::cache::{self, Cache};
use teldrive_core::config::ChannelConfig;
use teldrive_metadata::MetadataStore;
use teldrive_metadata::models::{BotRow, ChannelRow};
use teldrive_upstream::UpstreamClient;
use tokio::sync::Mutex;

const SELECTED_TTL: Duration = Duration::from_secs(3600);

/// Concurrent bot promotions during a rollover.
const PROMOTE_CONCURRENCY: usize = 4;

/// Attempts per bot promotion.
const PROMOTE_ATTEMPTS: u32 = 3;

/// More failed promotions than this abort the rollover.
const MAX_FAILED_PROMOTIONS: usize = 2;

pub struct ChannelManager {
    metadata: Arc<dyn MetadataStore>,
    cache: Arc<dyn Cache>,
    config: ChannelConfig,
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl ChannelManager {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        cache: Arc<dyn Cache>,
        config: ChannelConfig,
    ) -> Self {
        Self {
            metadata,
            cache,
            config,
            locks: DashMap::new(),
        }
    }

    /// The user's selected channel id.
    pub async fn current_channel(&self, user_id: i64) -> ApiResult<i64> {
        let key = cache::selected_channel_key(user_id);
        if let Some(channel_id) = cache::get_json::<i64>(self.cache.as_ref(), &key).await {
            return Ok(channel_id);
        }
        let channel = self
            .metadata
            .selected_channel(user_id)
            .await?
            .ok_or(ApiError::NoDefaultChannel)?;
        cache::set_json(self.cache.as_ref(), &key, &channel.channel_id, SELECTED_TTL).await;
        Ok(channel.channel_id)
    }

    /// Make `channel` the user's selected channel.
    pub async fn select(&self, channel: &ChannelRow) -> ApiResult<()> {
        self.metadata.select_channel(channel).await?;
        self.invalidate(channel.user_id).await;
        Ok(())
    }

    pub async fn invalidate(&self, user_id: i64) {
        self.cache
            .delete(&cache::selected_channel_key(user_id))
            .await;
        self.cache
            .delete_pattern(&format!("{}:*", cache::bots_key(user_id)))
            .await;
    }

    fn user_lock(&self, user_id: i64) -> Arc<Mutex<()>> {
        Arc::clone(
            &self
                .locks
                .entry(user_id)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// A channel that is not at the message limit.
    ///
    /// `owner` must be the user's own client: only the owner can create
    /// channels and promote bots.
    pub async fn channel_for_upload(
        &self,
        user_id: i64,
        owner: &dyn UpstreamClient,
    ) -> ApiResult<i64> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let current = self.current_channel(user_id).await?;
        if !self.config.auto_rollover {
            return Ok(current);
        }
        let total = match owner.history(current, 0, 1).await {
            Ok(page) => page.total,
            Err(e) => {
                tracing::warn!(
                    user_id,
                    channel_id = current,
                    error = %e,
                    "channel size check failed, keeping current channel"
                );
                return Ok(current);
            }
        };
        if total < self.config.message_limit {
            return Ok(current);
        }

        tracing::info!(
            user_id,
            channel_id = current,
            total,
            limit = self.config.message_limit,
            "channel reached its message limit, rolling over"
        );
        match self.roll_over(user_id, current, owner).await {
            Ok(channel) => {
                CHANNEL_ROLLOVERS.with_label_values(&["created"]).inc();
                tracing::info!(
                    user_id,
                    old_channel_id = current,
                    channel_id = channel.channel_id,
                    "created new storage channel"
                );
                Ok(channel.channel_id)
            }
            Err(e) => {
                CHANNEL_ROLLOVERS.with_label_values(&["failed"]).inc();
                tracing::warn!(
                    user_id,
                    channel_id = current,
                    error = %e,
                    "channel rollover failed, keeping current channel"
                );
                Ok(current)
            }
        }
    }

    async fn roll_over(
        &self,
        user_id: i64,
        current: i64,
        owner: &dyn UpstreamClient,
    ) -> ApiResult<ChannelRow> {
        let existing = self.metadata.list_channels(user_id).await?.len();
        let title = format!("teldrive storage {}", existing + 1);
        let channel_id = owner.create_channel(&title).await?;

        let bots = self.metadata.list_bots(user_id, current).await?;
        let promoted = promote_bots(owner, channel_id, &bots).await;
        let failed = bots.len() - promoted.len();
        if failed > MAX_FAILED_PROMOTIONS {
            return Err(ApiError::Internal(format!(
                "{failed} of {} bots could not be promoted in channel {channel_id}",
                bots.len()
            )));
        }

        let moved: Vec<BotRow> = promoted
            .into_iter()
            .map(|bot| BotRow { channel_id, ..bot })
            .collect();
        if !moved.is_empty() {
            self.metadata.add_bots(&moved).await?;
        }

        let channel = ChannelRow {
            channel_id,
            channel_name: title,
            user_id,
            selected: true,
        };
        self.select(&channel).await?;
        Ok(channel)
    }
}

/// Promote bots with bounded concurrency. Returns the bots that succeeded.
pub async fn promote_bots(
    owner: &dyn UpstreamClient,
    channel_id: i64,
    bots: &[BotRow],
) -> Vec<BotRow> {
    stream::iter(bots.iter().cloned())
        .map(|bot| async move {
            let mut delay = Duration::from_millis(100);
            for attempt in 1..=PROMOTE_ATTEMPTS {
                match owner.promote_admin(channel_id, bot.bot_id).await {
                    Ok(()) => return Some(bot),
                    Err(e) if attempt < PROMOTE_ATTEMPTS => {
                        tracing::debug!(bot_id = bot.bot_id, channel_id, attempt, error = %e, "promotion failed, retrying");
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                    Err(e) => {
                        tracing::warn!(bot_id = bot.bot_id, channel_id, error = %e, "failed to promote bot");
                    }
                }
            }
            None
        })
        .buffer_unordered(PROMOTE_CONCURRENCY)
        .filter_map(|bot| async move { bot })
        .collect()
        .await
}
