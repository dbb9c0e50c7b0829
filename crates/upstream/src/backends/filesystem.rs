//! Local filesystem upstream backend.
//!
//! Layout under the root directory:
//!
//! ```text
//! accounts/<id>.json                     registered credential
//! channels/<channelId>/channel.json      owner, admins, next message id
//! channels/<channelId>/<messageId>.bin   message blob
//! profiles/<id>.jpg                      optional profile photo
//! ```
//!
//! Writes go to a temp file that is fsynced and renamed into place.

use crate::error::{UpstreamError, UpstreamResult};
use crate::traits::{
    Connector, Credential, HistoryPage, Identity, MessageLocation, UpstreamClient,
    parse_credential,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

/// Largest single download the backend will buffer (128 MiB).
const MAX_RANGE_SIZE: u64 = 128 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct AccountRecord {
    secret_sha256: String,
    is_bot: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChannelRecord {
    owner: i64,
    title: String,
    admins: BTreeSet<i64>,
    next_message_id: i64,
}

struct Inner {
    root: PathBuf,
    channel_locks: DashMap<i64, Arc<Mutex<()>>>,
    account_lock: Mutex<()>,
}

/// Filesystem-backed connector. Cheap to clone.
#[derive(Clone)]
pub struct FilesystemBackend {
    inner: Arc<Inner>,
}

impl FilesystemBackend {
    /// Create a new filesystem backend rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> UpstreamResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("accounts")).await?;
        fs::create_dir_all(root.join("channels")).await?;
        fs::create_dir_all(root.join("profiles")).await?;
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                channel_locks: DashMap::new(),
                account_lock: Mutex::new(()),
            }),
        })
    }
}

#[async_trait]
impl Connector for FilesystemBackend {
    async fn connect(
        &self,
        _user_id: i64,
        credential: &Credential,
    ) -> UpstreamResult<Arc<dyn UpstreamClient>> {
        Ok(Arc::new(FilesystemClient {
            inner: Arc::clone(&self.inner),
            credential: credential.clone(),
        }))
    }
}

impl Inner {
    fn channel_dir(&self, channel_id: i64) -> PathBuf {
        self.root.join("channels").join(channel_id.to_string())
    }

    fn message_path(&self, channel_id: i64, message_id: i64) -> PathBuf {
        self.channel_dir(channel_id)
            .join(format!("{message_id}.bin"))
    }

    fn channel_lock(&self, channel_id: i64) -> Arc<Mutex<()>> {
        Arc::clone(
            &self
                .channel_locks
                .entry(channel_id)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    async fn authenticate(&self, credential: &Credential) -> UpstreamResult<Identity> {
        let (id, secret) = parse_credential(credential.secret())?;
        let digest = hex::encode(<sha2::Sha256 as sha2::Digest>::digest(secret.as_bytes()));
        let path = self.root.join("accounts").join(format!("{id}.json"));

        let _guard = self.account_lock.lock().await;
        match fs::read(&path).await {
            Ok(raw) => {
                let record: AccountRecord = serde_json::from_slice(&raw)?;
                if record.secret_sha256 != digest || record.is_bot != credential.is_bot() {
                    return Err(UpstreamError::Unauthorized(format!(
                        "credential rejected for account {id}"
                    )));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let record = AccountRecord {
                    secret_sha256: digest,
                    is_bot: credential.is_bot(),
                };
                write_atomic(&path, &serde_json::to_vec(&record)?).await?;
                tracing::info!(account = id, is_bot = record.is_bot, "registered upstream account");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Identity {
            user_id: id,
            name: if credential.is_bot() {
                format!("bot{id}")
            } else {
                format!("user{id}")
            },
            is_bot: credential.is_bot(),
        })
    }

    async fn read_channel(&self, channel_id: i64) -> UpstreamResult<ChannelRecord> {
        let path = self.channel_dir(channel_id).join("channel.json");
        let raw = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UpstreamError::NotFound(format!("channel {channel_id}"))
            } else {
                UpstreamError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn write_channel(&self, channel_id: i64, record: &ChannelRecord) -> UpstreamResult<()> {
        let path = self.channel_dir(channel_id).join("channel.json");
        write_atomic(&path, &serde_json::to_vec_pretty(record)?).await
    }

    async fn require_member(&self, actor: &Identity, channel_id: i64) -> UpstreamResult<()> {
        let record = self.read_channel(channel_id).await?;
        if record.owner != actor.user_id && !record.admins.contains(&actor.user_id) {
            return Err(UpstreamError::Forbidden(format!(
                "account {} is not an admin of channel {channel_id}",
                actor.user_id
            )));
        }
        Ok(())
    }

    async fn message_ids(&self, channel_id: i64) -> UpstreamResult<BTreeSet<i64>> {
        let mut ids = BTreeSet::new();
        let mut entries = fs::read_dir(self.channel_dir(channel_id)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".bin")
                && let Ok(id) = id.parse::<i64>()
            {
                ids.insert(id);
            }
        }
        Ok(ids)
    }

    async fn append_message(&self, channel_id: i64, data: &[u8]) -> UpstreamResult<i64> {
        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().await;
        let mut record = self.read_channel(channel_id).await?;
        let id = record.next_message_id;
        record.next_message_id += 1;
        write_atomic(&self.message_path(channel_id, id), data).await?;
        self.write_channel(channel_id, &record).await?;
        Ok(id)
    }
}

/// Write to a uniquely named temp file, fsync, then rename into place.
async fn write_atomic(path: &Path, data: &[u8]) -> UpstreamResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp_name = format!(".tmp.{}", Uuid::new_v4());
    let temp_path = path.with_file_name(
        path.file_name()
            .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
            .unwrap_or_else(|| temp_name.clone()),
    );
    {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
    }
    fs::rename(&temp_path, path).await?;
    Ok(())
}

fn locator(channel_id: i64, message_id: i64) -> String {
    format!("fs:{channel_id}:{message_id}")
}

/// A client bound to one credential.
pub struct FilesystemClient {
    inner: Arc<Inner>,
    credential: Credential,
}

impl FilesystemClient {
    async fn actor(&self) -> UpstreamResult<Identity> {
        self.inner.authenticate(&self.credential).await
    }
}

#[async_trait]
impl UpstreamClient for FilesystemClient {
    async fn self_info(&self) -> UpstreamResult<Identity> {
        self.actor().await
    }

    #[instrument(skip(self, ids), fields(backend = "filesystem", count = ids.len()))]
    async fn messages(&self, channel_id: i64, ids: &[i64]) -> UpstreamResult<Vec<MessageLocation>> {
        let actor = self.actor().await?;
        self.inner.require_member(&actor, channel_id).await?;
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            match fs::metadata(self.inner.message_path(channel_id, id)).await {
                Ok(meta) => out.push(MessageLocation {
                    channel_id,
                    message_id: id,
                    locator: locator(channel_id, id),
                    size: meta.len() as i64,
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    #[instrument(skip(self, location), fields(backend = "filesystem", message_id = location.message_id))]
    async fn download(
        &self,
        location: &MessageLocation,
        offset: u64,
        limit: u64,
    ) -> UpstreamResult<Bytes> {
        if limit > MAX_RANGE_SIZE {
            return Err(UpstreamError::InvalidRequest(format!(
                "range size {limit} exceeds maximum {MAX_RANGE_SIZE} bytes"
            )));
        }
        if location.locator != locator(location.channel_id, location.message_id) {
            return Err(UpstreamError::InvalidRequest("foreign locator".into()));
        }
        let actor = self.actor().await?;
        self.inner
            .require_member(&actor, location.channel_id)
            .await?;

        let path = self
            .inner
            .message_path(location.channel_id, location.message_id);
        let mut file = fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UpstreamError::NotFound(format!("message {}", location.message_id))
            } else {
                UpstreamError::Io(e)
            }
        })?;
        let len = file.metadata().await?.len();
        let start = offset.min(len);
        let end = offset.saturating_add(limit).min(len);
        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn send_media(
        &self,
        channel_id: i64,
        name: &str,
        data: Bytes,
    ) -> UpstreamResult<MessageLocation> {
        let actor = self.actor().await?;
        self.inner.require_member(&actor, channel_id).await?;
        let id = self.inner.append_message(channel_id, &data).await?;
        tracing::debug!(channel_id, message_id = id, name, "stored message");
        Ok(MessageLocation {
            channel_id,
            message_id: id,
            locator: locator(channel_id, id),
            size: data.len() as i64,
        })
    }

    async fn copy_media(
        &self,
        source: &MessageLocation,
        channel_id: i64,
    ) -> UpstreamResult<MessageLocation> {
        let actor = self.actor().await?;
        self.inner
            .require_member(&actor, source.channel_id)
            .await?;
        let data = fs::read(self.inner.message_path(source.channel_id, source.message_id))
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    UpstreamError::NotFound(format!("message {}", source.message_id))
                } else {
                    UpstreamError::Io(e)
                }
            })?;
        self.send_media(channel_id, "", Bytes::from(data)).await
    }

    async fn delete_messages(&self, channel_id: i64, ids: &[i64]) -> UpstreamResult<()> {
        let actor = self.actor().await?;
        self.inner.require_member(&actor, channel_id).await?;
        for &id in ids {
            match fs::remove_file(self.inner.message_path(channel_id, id)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn create_channel(&self, title: &str) -> UpstreamResult<i64> {
        let actor = self.actor().await?;
        if actor.is_bot {
            return Err(UpstreamError::Forbidden("bots cannot create channels".into()));
        }
        // Low 64 bits of a v7 uuid are random; keep the id positive.
        let channel_id = ((Uuid::now_v7().as_u128() as u64) >> 1).max(1) as i64;
        let dir = self.inner.channel_dir(channel_id);
        fs::create_dir_all(&dir).await?;
        self.inner
            .write_channel(
                channel_id,
                &ChannelRecord {
                    owner: actor.user_id,
                    title: title.to_string(),
                    admins: BTreeSet::new(),
                    next_message_id: 1,
                },
            )
            .await?;
        tracing::info!(channel_id, owner = actor.user_id, "created channel");
        Ok(channel_id)
    }

    async fn promote_admin(&self, channel_id: i64, bot_id: i64) -> UpstreamResult<()> {
        let actor = self.actor().await?;
        let lock = self.inner.channel_lock(channel_id);
        let _guard = lock.lock().await;
        let mut record = self.inner.read_channel(channel_id).await?;
        if record.owner != actor.user_id {
            return Err(UpstreamError::Forbidden(format!(
                "only the owner can promote admins in channel {channel_id}"
            )));
        }
        record.admins.insert(bot_id);
        self.inner.write_channel(channel_id, &record).await
    }

    async fn history(
        &self,
        channel_id: i64,
        offset_id: i64,
        limit: usize,
    ) -> UpstreamResult<HistoryPage> {
        let actor = self.actor().await?;
        self.inner.require_member(&actor, channel_id).await?;
        let ids = self.inner.message_ids(channel_id).await?;
        let upper = if offset_id <= 0 { i64::MAX } else { offset_id };
        Ok(HistoryPage {
            message_ids: ids.range(..upper).rev().take(limit).copied().collect(),
            total: ids.len() as i64,
        })
    }

    async fn profile_photo(&self) -> UpstreamResult<Option<Bytes>> {
        let actor = self.actor().await?;
        let path = self
            .inner
            .root
            .join("profiles")
            .join(format!("{}.jpg", actor.user_id));
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_roundtrip_through_disk() {
        let temp = tempdir().unwrap();
        let backend = FilesystemBackend::new(temp.path()).await.unwrap();
        let client = backend
            .connect(1, &Credential::Session("1:s".into()))
            .await
            .unwrap();

        let channel = client.create_channel("storage").await.unwrap();
        let loc = client
            .send_media(channel, "a", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        assert_eq!(loc.message_id, 1);

        let resolved = client.messages(channel, &[1, 99]).await.unwrap();
        assert_eq!(resolved, vec![loc.clone()]);
        assert_eq!(&client.download(&loc, 8, 10).await.unwrap()[..], b"89");

        let copy = client.copy_media(&loc, channel).await.unwrap();
        assert_eq!(copy.message_id, 2);

        client.delete_messages(channel, &[1]).await.unwrap();
        let page = client.history(channel, 0, 10).await.unwrap();
        assert_eq!(page.message_ids, vec![2]);
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_credentials_survive_reopen() {
        let temp = tempdir().unwrap();
        let backend = FilesystemBackend::new(temp.path()).await.unwrap();
        backend
            .connect(3, &Credential::Session("3:right".into()))
            .await
            .unwrap()
            .self_info()
            .await
            .unwrap();

        let reopened = FilesystemBackend::new(temp.path()).await.unwrap();
        let wrong = reopened
            .connect(3, &Credential::Session("3:wrong".into()))
            .await
            .unwrap();
        assert!(matches!(
            wrong.self_info().await,
            Err(UpstreamError::Unauthorized(_))
        ));
    }
}
