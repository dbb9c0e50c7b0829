//! Channel and bot repositories.

use crate::error::MetadataResult;
use crate::models::{BotRow, ChannelRow};
use async_trait::async_trait;

/// Repository for a user's storage channels.
#[async_trait]
pub trait ChannelRepo: Send + Sync {
    async fn list_channels(&self, user_id: i64) -> MetadataResult<Vec<ChannelRow>>;

    /// The user's selected channel, if any.
    async fn selected_channel(&self, user_id: i64) -> MetadataResult<Option<ChannelRow>>;

    /// Upsert `channel` as the user's only selected channel, in one
    /// transaction.
    async fn select_channel(&self, channel: &ChannelRow) -> MetadataResult<()>;
}

/// Repository for worker credentials.
#[async_trait]
pub trait BotRepo: Send + Sync {
    /// Bots of a user's channel, ordered by bot id.
    async fn list_bots(&self, user_id: i64, channel_id: i64) -> MetadataResult<Vec<BotRow>>;

    /// Insert bots. A token that already exists is reassigned to the given channel.
    async fn add_bots(&self, bots: &[BotRow]) -> MetadataResult<u64>;

    /// Remove every bot of a user's channel.
    async fn delete_bots(&self, user_id: i64, channel_id: i64) -> MetadataResult<u64>;
}
