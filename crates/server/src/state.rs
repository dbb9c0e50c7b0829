//! Application state shared across handlers.

use crate::error::{ApiError, ApiResult};
use crate::ratelimit::RateLimitState;
use crate::services::bots::{BotOp, BotSelector};
use crate::services::channels::ChannelManager;
use crate::services::events::EventBroadcaster;
use crate::services::uploads::UploadSlots;
use std::sync::Arc;
use std::time::Duration;
use teldrive_core::cache::{self, Cache};
use teldrive_core::config::AppConfig;
use teldrive_metadata::{EventBus, MetadataStore};
use teldrive_upstream::{ClientPool, Connector, Credential, UpstreamClient};
use time::OffsetDateTime;

/// How long a user's bot token list stays cached.
const BOTS_TTL: Duration = Duration::from_secs(30 * 60);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub metadata: Arc<dyn MetadataStore>,
    pub cache: Arc<dyn Cache>,
    /// Unpooled connector, used to verify credentials before they are stored.
    pub connector: Arc<dyn Connector>,
    pub pool: Arc<ClientPool>,
    pub bots: Arc<BotSelector>,
    pub channels: Arc<ChannelManager>,
    pub events: Arc<EventBroadcaster>,
    /// Per-user bound on concurrent server-side part uploads.
    pub uploads: Arc<UploadSlots>,
    pub rate_limit: RateLimitState,
}

impl AppState {
    /// Wire the services together. Must run inside a tokio runtime.
    pub fn new(
        config: AppConfig,
        metadata: Arc<dyn MetadataStore>,
        bus: Arc<dyn EventBus>,
        connector: Arc<dyn Connector>,
        cache: Arc<dyn Cache>,
    ) -> Self {
        match config.rate_limit.validate() {
            Ok(warnings) => {
                for warning in warnings {
                    tracing::warn!("Configuration warning: {}", warning);
                }
            }
            Err(error) => {
                tracing::error!(error = %error, "invalid rate limit configuration, rate limiting disabled");
            }
        }

        let rate_limit = RateLimitState::new(&config.rate_limit);
        let pool = Arc::new(ClientPool::from_config(
            Arc::clone(&connector),
            &config.upstream,
        ));
        let bots = Arc::new(if config.stream.shared_bot_counter {
            BotSelector::shared(Arc::clone(&metadata))
        } else {
            BotSelector::local()
        });
        let channels = Arc::new(ChannelManager::new(
            Arc::clone(&metadata),
            Arc::clone(&cache),
            config.channel.clone(),
        ));
        let events = Arc::new(EventBroadcaster::new(
            config.events.clone(),
            Arc::clone(&metadata),
            bus,
        ));
        let uploads = Arc::new(UploadSlots::new(config.uploads.threads));

        Self {
            config: Arc::new(config),
            metadata,
            cache,
            connector,
            pool,
            bots,
            channels,
            events,
            uploads,
            rate_limit,
        }
    }

    /// Get the cleanup interval for the rate limiter, if enabled.
    pub fn rate_limit_cleanup_interval(&self) -> Option<Duration> {
        if !self.rate_limit.is_enabled() {
            return None;
        }
        let interval_secs = self.config.rate_limit.cleanup_interval_secs;
        if interval_secs == 0 {
            tracing::warn!("rate_limit.cleanup_interval_secs is 0, using default of 60 seconds");
            return Some(Duration::from_secs(60));
        }
        Some(Duration::from_secs(interval_secs))
    }

    /// Bot tokens registered for a user's channel, capped at `stream.bots_limit`.
    pub async fn bot_tokens(&self, user_id: i64, channel_id: i64) -> ApiResult<Vec<String>> {
        let key = format!("{}:{channel_id}", cache::bots_key(user_id));
        if let Some(tokens) = cache::get_json::<Vec<String>>(self.cache.as_ref(), &key).await {
            return Ok(tokens);
        }
        let mut tokens: Vec<String> = self
            .metadata
            .list_bots(user_id, channel_id)
            .await?
            .into_iter()
            .map(|b| b.token)
            .collect();
        tokens.truncate(self.config.stream.bots_limit.max(1));
        cache::set_json(self.cache.as_ref(), &key, &tokens, BOTS_TTL).await;
        Ok(tokens)
    }

    /// Drop cached bot lists of a user.
    pub async fn invalidate_bots(&self, user_id: i64) {
        self.cache
            .delete_pattern(&format!("{}:*", cache::bots_key(user_id)))
            .await;
    }

    /// The user's own upstream client.
    ///
    /// Without a session at hand the newest stored session of the user is used,
    /// which is how share viewers and background workers act for an owner.
    pub async fn user_client(
        &self,
        user_id: i64,
        session: Option<&str>,
    ) -> ApiResult<Arc<dyn UpstreamClient>> {
        let session = match session {
            Some(session) => session.to_string(),
            None => self
                .metadata
                .latest_session(user_id, OffsetDateTime::now_utc())
                .await?
                .map(|s| s.session)
                .ok_or_else(|| {
                    ApiError::Unauthorized(format!("user {user_id} has no active session"))
                })?,
        };
        Ok(self
            .pool
            .get(user_id, &Credential::Session(session))
            .await?)
    }

    /// A client for work in `channel_id`: the next bot when the channel has
    /// bots, otherwise the user's own session.
    pub async fn client_for(
        &self,
        user_id: i64,
        session: Option<&str>,
        op: BotOp,
        channel_id: i64,
    ) -> ApiResult<Arc<dyn UpstreamClient>> {
        let tokens = self.bot_tokens(user_id, channel_id).await?;
        if tokens.is_empty() {
            return self.user_client(user_id, session).await;
        }
        let (token, index) = self.bots.next(op, user_id, &tokens).await?;
        tracing::debug!(user_id, channel_id, op = %op, bot_index = index, "selected bot");
        Ok(self.pool.get(user_id, &Credential::Bot(token)).await?)
    }

    /// Stop background services.
    pub async fn shutdown(&self) {
        self.events.shutdown().await;
        self.pool.close();
    }
}
