//! Upstream RPC capability definitions.

use crate::error::UpstreamResult;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Credential a client authenticates with.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Credential {
    /// A user's own upstream session string.
    Session(String),
    /// A bot token of the form `"<botId>:<secret>"`.
    Bot(String),
}

impl Credential {
    /// Pool key component: empty for a personal session, the token for a bot.
    pub fn pool_token(&self) -> &str {
        match self {
            Credential::Session(_) => "",
            Credential::Bot(token) => token,
        }
    }

    pub fn is_bot(&self) -> bool {
        matches!(self, Credential::Bot(_))
    }

    pub fn secret(&self) -> &str {
        match self {
            Credential::Session(s) | Credential::Bot(s) => s,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Session(_) => f.write_str("Credential::Session(<redacted>)"),
            Credential::Bot(token) => {
                let id = token.split(':').next().unwrap_or_default();
                write!(f, "Credential::Bot({id}:<redacted>)")
            }
        }
    }
}

/// Authenticated account details.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: i64,
    pub name: String,
    pub is_bot: bool,
}

/// Resolved location of a message-attached blob.
///
/// `locator` is backend-specific and opaque to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageLocation {
    pub channel_id: i64,
    pub message_id: i64,
    pub locator: String,
    pub size: i64,
}

/// One page of channel history, newest first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HistoryPage {
    pub message_ids: Vec<i64>,
    /// Total number of messages currently in the channel.
    pub total: i64,
}

/// An authenticated connection to the upstream chat service.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Verify the credential and return the account it belongs to.
    async fn self_info(&self) -> UpstreamResult<Identity>;

    /// Resolve blob locations for messages in a channel. Missing ids are skipped.
    async fn messages(&self, channel_id: i64, ids: &[i64]) -> UpstreamResult<Vec<MessageLocation>>;

    /// Fetch up to `limit` bytes at `offset` of a blob. Short reads happen only at the end.
    async fn download(
        &self,
        location: &MessageLocation,
        offset: u64,
        limit: u64,
    ) -> UpstreamResult<Bytes>;

    /// Upload a blob as a new message.
    async fn send_media(
        &self,
        channel_id: i64,
        name: &str,
        data: Bytes,
    ) -> UpstreamResult<MessageLocation>;

    /// Post a new message referencing an existing blob.
    async fn copy_media(
        &self,
        source: &MessageLocation,
        channel_id: i64,
    ) -> UpstreamResult<MessageLocation>;

    /// Delete messages. Unknown ids are ignored.
    async fn delete_messages(&self, channel_id: i64, ids: &[i64]) -> UpstreamResult<()>;

    /// Create a channel owned by the caller and return its id.
    async fn create_channel(&self, title: &str) -> UpstreamResult<i64>;

    /// Grant admin rights in a channel to a bot account.
    async fn promote_admin(&self, channel_id: i64, bot_id: i64) -> UpstreamResult<()>;

    /// Iterate history below `offset_id` (0 = newest) and report the total count.
    async fn history(
        &self,
        channel_id: i64,
        offset_id: i64,
        limit: usize,
    ) -> UpstreamResult<HistoryPage>;

    /// The caller's profile photo, if any.
    async fn profile_photo(&self) -> UpstreamResult<Option<Bytes>>;
}

/// Factory for upstream clients.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open an unauthenticated client for a credential.
    async fn connect(
        &self,
        user_id: i64,
        credential: &Credential,
    ) -> UpstreamResult<Arc<dyn UpstreamClient>>;
}

/// Split a `"<id>:<secret>"` credential.
pub(crate) fn parse_credential(raw: &str) -> UpstreamResult<(i64, &str)> {
    let (id, secret) = raw
        .split_once(':')
        .ok_or_else(|| crate::UpstreamError::Unauthorized("malformed credential".into()))?;
    let id: i64 = id
        .parse()
        .map_err(|_| crate::UpstreamError::Unauthorized("malformed credential id".into()))?;
    if id <= 0 || secret.is_empty() {
        return Err(crate::UpstreamError::Unauthorized(
            "malformed credential".into(),
        ));
    }
    Ok((id, secret))
}
