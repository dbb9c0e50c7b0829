//! In-process upstream backend.
//!
//! Channels live in memory and vanish with the process. Accounts are
//! registered on first use: the first secret presented for an id becomes that
//! account's credential. Fault-injection hooks let tests exercise latency,
//! transient failures, flood waits and promotion failures.

use crate::error::{UpstreamError, UpstreamResult};
use crate::traits::{
    Connector, Credential, HistoryPage, Identity, MessageLocation, UpstreamClient,
    parse_credential,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct ChannelState {
    owner: i64,
    admins: HashSet<i64>,
    next_message_id: i64,
    messages: BTreeMap<i64, Bytes>,
}

/// Shared state of the in-memory service, visible to every client.
pub struct MemoryNetwork {
    accounts: DashMap<i64, (String, bool)>,
    channels: DashMap<i64, Arc<Mutex<ChannelState>>>,
    photos: DashMap<i64, Bytes>,
    next_channel_id: AtomicI64,
    latency_ms: AtomicU64,
    failing_downloads: AtomicUsize,
    failing_history: AtomicUsize,
    flood_waits: AtomicUsize,
    failing_promotions: DashMap<i64, usize>,
    download_calls: AtomicUsize,
    created_channels: AtomicUsize,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self {
            accounts: DashMap::new(),
            channels: DashMap::new(),
            photos: DashMap::new(),
            next_channel_id: AtomicI64::new(1_000_000_000),
            latency_ms: AtomicU64::new(0),
            failing_downloads: AtomicUsize::new(0),
            failing_history: AtomicUsize::new(0),
            flood_waits: AtomicUsize::new(0),
            failing_promotions: DashMap::new(),
            download_calls: AtomicUsize::new(0),
            created_channels: AtomicUsize::new(0),
        }
    }
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add artificial latency to every download.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Fail the next `n` downloads with a transient error.
    pub fn fail_next_downloads(&self, n: usize) {
        self.failing_downloads.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` history reads.
    pub fn fail_next_history(&self, n: usize) {
        self.failing_history.store(n, Ordering::SeqCst);
    }

    /// Answer the next `n` downloads with a one-second flood wait.
    pub fn flood_next_downloads(&self, n: usize) {
        self.flood_waits.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` promotions of `bot_id`.
    pub fn fail_promotions(&self, bot_id: i64, n: usize) {
        self.failing_promotions.insert(bot_id, n);
    }

    pub fn set_profile_photo(&self, user_id: i64, photo: Bytes) {
        self.photos.insert(user_id, photo);
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    pub fn created_channels(&self) -> usize {
        self.created_channels.load(Ordering::SeqCst)
    }

    /// Message ids currently in a channel, ascending.
    pub fn message_ids(&self, channel_id: i64) -> Vec<i64> {
        self.channels
            .get(&channel_id)
            .map(|c| lock(&c).messages.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Whether `account` is an admin (or owner) of a channel.
    pub fn is_admin(&self, channel_id: i64, account: i64) -> bool {
        self.channels
            .get(&channel_id)
            .map(|c| {
                let state = lock(&c);
                state.owner == account || state.admins.contains(&account)
            })
            .unwrap_or(false)
    }

    /// Create a channel directly, bypassing any client.
    pub fn seed_channel(&self, owner: i64) -> i64 {
        let id = self.next_channel_id.fetch_add(1, Ordering::SeqCst);
        self.channels.insert(
            id,
            Arc::new(Mutex::new(ChannelState {
                owner,
                next_message_id: 1,
                ..ChannelState::default()
            })),
        );
        id
    }

    /// Post a message directly, bypassing any client.
    pub fn seed_message(&self, channel_id: i64, data: Bytes) -> UpstreamResult<i64> {
        let channel = self.channel(channel_id)?;
        let mut state = lock(&channel);
        let id = state.next_message_id;
        state.next_message_id += 1;
        state.messages.insert(id, data);
        Ok(id)
    }

    fn authenticate(&self, credential: &Credential) -> UpstreamResult<Identity> {
        let (id, secret) = parse_credential(credential.secret())?;
        let is_bot = credential.is_bot();
        let entry = self
            .accounts
            .entry(id)
            .or_insert_with(|| (secret.to_string(), is_bot));
        if entry.0 != secret || entry.1 != is_bot {
            return Err(UpstreamError::Unauthorized(format!(
                "credential rejected for account {id}"
            )));
        }
        Ok(Identity {
            user_id: id,
            name: if is_bot {
                format!("bot{id}")
            } else {
                format!("user{id}")
            },
            is_bot,
        })
    }

    fn channel(&self, channel_id: i64) -> UpstreamResult<Arc<Mutex<ChannelState>>> {
        self.channels
            .get(&channel_id)
            .map(|c| Arc::clone(&c))
            .ok_or_else(|| UpstreamError::NotFound(format!("channel {channel_id}")))
    }

    fn member_channel(
        &self,
        actor: &Identity,
        channel_id: i64,
    ) -> UpstreamResult<Arc<Mutex<ChannelState>>> {
        let channel = self.channel(channel_id)?;
        {
            let state = lock(&channel);
            if state.owner != actor.user_id && !state.admins.contains(&actor.user_id) {
                return Err(UpstreamError::Forbidden(format!(
                    "account {} is not an admin of channel {channel_id}",
                    actor.user_id
                )));
            }
        }
        Ok(channel)
    }
}

fn lock(state: &Mutex<ChannelState>) -> std::sync::MutexGuard<'_, ChannelState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn locator(channel_id: i64, message_id: i64) -> String {
    format!("mem:{channel_id}:{message_id}")
}

/// Connector handing out clients of one [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryConnector {
    network: Arc<MemoryNetwork>,
}

impl MemoryConnector {
    pub fn new(network: Arc<MemoryNetwork>) -> Self {
        Self { network }
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        _user_id: i64,
        credential: &Credential,
    ) -> UpstreamResult<Arc<dyn UpstreamClient>> {
        Ok(Arc::new(MemoryClient {
            network: Arc::clone(&self.network),
            credential: credential.clone(),
        }))
    }
}

/// A client bound to one credential.
pub struct MemoryClient {
    network: Arc<MemoryNetwork>,
    credential: Credential,
}

impl MemoryClient {
    fn actor(&self) -> UpstreamResult<Identity> {
        self.network.authenticate(&self.credential)
    }
}

#[async_trait]
impl UpstreamClient for MemoryClient {
    async fn self_info(&self) -> UpstreamResult<Identity> {
        self.actor()
    }

    async fn messages(&self, channel_id: i64, ids: &[i64]) -> UpstreamResult<Vec<MessageLocation>> {
        let actor = self.actor()?;
        let channel = self.network.member_channel(&actor, channel_id)?;
        let state = lock(&channel);
        Ok(ids
            .iter()
            .filter_map(|id| {
                state.messages.get(id).map(|data| MessageLocation {
                    channel_id,
                    message_id: *id,
                    locator: locator(channel_id, *id),
                    size: data.len() as i64,
                })
            })
            .collect())
    }

    async fn download(
        &self,
        location: &MessageLocation,
        offset: u64,
        limit: u64,
    ) -> UpstreamResult<Bytes> {
        self.network.download_calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.network.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if take_one(&self.network.flood_waits) {
            return Err(UpstreamError::FloodWait(1));
        }
        if take_one(&self.network.failing_downloads) {
            return Err(UpstreamError::Rpc("injected download failure".into()));
        }

        let actor = self.actor()?;
        let channel = self.network.member_channel(&actor, location.channel_id)?;
        let state = lock(&channel);
        let data = state.messages.get(&location.message_id).ok_or_else(|| {
            UpstreamError::NotFound(format!(
                "message {} in channel {}",
                location.message_id, location.channel_id
            ))
        })?;
        let len = data.len() as u64;
        let start = offset.min(len);
        let end = offset.saturating_add(limit).min(len);
        Ok(data.slice(start as usize..end as usize))
    }

    async fn send_media(
        &self,
        channel_id: i64,
        _name: &str,
        data: Bytes,
    ) -> UpstreamResult<MessageLocation> {
        let actor = self.actor()?;
        let channel = self.network.member_channel(&actor, channel_id)?;
        let mut state = lock(&channel);
        let id = state.next_message_id;
        state.next_message_id += 1;
        let size = data.len() as i64;
        state.messages.insert(id, data);
        Ok(MessageLocation {
            channel_id,
            message_id: id,
            locator: locator(channel_id, id),
            size,
        })
    }

    async fn copy_media(
        &self,
        source: &MessageLocation,
        channel_id: i64,
    ) -> UpstreamResult<MessageLocation> {
        let actor = self.actor()?;
        let data = {
            let from = self.network.member_channel(&actor, source.channel_id)?;
            let state = lock(&from);
            state
                .messages
                .get(&source.message_id)
                .cloned()
                .ok_or_else(|| UpstreamError::NotFound(format!("message {}", source.message_id)))?
        };
        self.send_media(channel_id, "", data).await
    }

    async fn delete_messages(&self, channel_id: i64, ids: &[i64]) -> UpstreamResult<()> {
        let actor = self.actor()?;
        let channel = self.network.member_channel(&actor, channel_id)?;
        let mut state = lock(&channel);
        for id in ids {
            state.messages.remove(id);
        }
        Ok(())
    }

    async fn create_channel(&self, _title: &str) -> UpstreamResult<i64> {
        let actor = self.actor()?;
        if actor.is_bot {
            return Err(UpstreamError::Forbidden("bots cannot create channels".into()));
        }
        self.network.created_channels.fetch_add(1, Ordering::SeqCst);
        Ok(self.network.seed_channel(actor.user_id))
    }

    async fn promote_admin(&self, channel_id: i64, bot_id: i64) -> UpstreamResult<()> {
        let actor = self.actor()?;
        let mut remaining = self.network.failing_promotions.entry(bot_id).or_insert(0);
        if *remaining > 0 {
            *remaining -= 1;
            return Err(UpstreamError::Rpc(format!("injected promotion failure for {bot_id}")));
        }
        drop(remaining);

        let channel = self.network.channel(channel_id)?;
        let mut state = lock(&channel);
        if state.owner != actor.user_id {
            return Err(UpstreamError::Forbidden(format!(
                "only the owner can promote admins in channel {channel_id}"
            )));
        }
        state.admins.insert(bot_id);
        Ok(())
    }

    async fn history(
        &self,
        channel_id: i64,
        offset_id: i64,
        limit: usize,
    ) -> UpstreamResult<HistoryPage> {
        let actor = self.actor()?;
        if take_one(&self.network.failing_history) {
            return Err(UpstreamError::Rpc("injected history failure".into()));
        }
        let channel = self.network.member_channel(&actor, channel_id)?;
        let state = lock(&channel);
        let upper = if offset_id <= 0 { i64::MAX } else { offset_id };
        let message_ids = state
            .messages
            .range(..upper)
            .rev()
            .take(limit)
            .map(|(id, _)| *id)
            .collect();
        Ok(HistoryPage {
            message_ids,
            total: state.messages.len() as i64,
        })
    }

    async fn profile_photo(&self) -> UpstreamResult<Option<Bytes>> {
        let actor = self.actor()?;
        Ok(self.network.photos.get(&actor.user_id).map(|p| p.clone()))
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: i64) -> Credential {
        Credential::Session(format!("{id}:secret"))
    }

    #[tokio::test]
    async fn test_upload_download_and_history() {
        let network = MemoryNetwork::new();
        let connector = MemoryConnector::new(Arc::clone(&network));
        let client = connector.connect(1, &session(1)).await.unwrap();

        let channel = client.create_channel("storage").await.unwrap();
        let loc = client
            .send_media(channel, "a", Bytes::from_static(b"hello world"))
            .await
            .unwrap();
        assert_eq!(loc.size, 11);

        let data = client.download(&loc, 6, 100).await.unwrap();
        assert_eq!(&data[..], b"world");

        client
            .send_media(channel, "b", Bytes::from_static(b"x"))
            .await
            .unwrap();
        let page = client.history(channel, 0, 1).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.message_ids, vec![2]);
        let page = client.history(channel, 2, 10).await.unwrap();
        assert_eq!(page.message_ids, vec![1]);
    }

    #[tokio::test]
    async fn test_bot_needs_promotion() {
        let network = MemoryNetwork::new();
        let connector = MemoryConnector::new(Arc::clone(&network));
        let owner = connector.connect(1, &session(1)).await.unwrap();
        let bot = connector
            .connect(1, &Credential::Bot("77:tok".into()))
            .await
            .unwrap();

        let channel = owner.create_channel("c").await.unwrap();
        let err = bot
            .send_media(channel, "a", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Forbidden(_)));

        owner.promote_admin(channel, 77).await.unwrap();
        assert!(network.is_admin(channel, 77));
        bot.send_media(channel, "a", Bytes::from_static(b"x"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_credentials_are_pinned_on_first_use() {
        let network = MemoryNetwork::new();
        let connector = MemoryConnector::new(network);
        let first = connector.connect(5, &session(5)).await.unwrap();
        first.self_info().await.unwrap();

        let other = connector
            .connect(5, &Credential::Session("5:different".into()))
            .await
            .unwrap();
        assert!(matches!(
            other.self_info().await,
            Err(UpstreamError::Unauthorized(_))
        ));
    }
}
