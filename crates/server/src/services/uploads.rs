//! Upload part intake.
//!
//! Parts reach the store two ways: a client that posted the message itself
//! registers it with [`create_part`], or the server receives the raw bytes
//! through [`upload_part`] and posts them. Either way the row carries the
//! plaintext size and the BLAKE3 block hashes of the plaintext, so the tree
//! hash computed at commit does not depend on encryption or part layout.

use crate::auth::AuthenticatedUser;
use crate::error::{ApiError, ApiResult};
use crate::metrics::{UPLOAD_PARTS_STORED, UPLOADED_BYTES};
use crate::services::bots::BotOp;
use crate::state::AppState;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use teldrive_core::crypt::random_salt;
use teldrive_core::hash::block_hashes;
use teldrive_core::{BLOCK_HASH_LEN, Cipher, Nonce, UploadPart};
use teldrive_metadata::models::{DailyUsage, UploadRow};
use teldrive_upstream::{MessageLocation, UpstreamClient};
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Cap on the back-off between part upload attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// A part the client already posted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePart {
    pub upload_id: String,
    pub name: String,
    pub part_no: i32,
    pub part_id: i64,
    pub channel_id: i64,
    pub size: i64,
    #[serde(default)]
    pub encrypted: bool,
    pub salt: Option<String>,
    /// Hex of the concatenated 32-byte block hashes.
    #[serde(default)]
    pub block_hashes: String,
}

/// Query of a server-side part upload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadParams {
    pub part_no: i32,
    pub file_name: String,
    pub part_name: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    pub channel_id: Option<i64>,
}

/// Bounds concurrent server-side uploads per user.
pub struct UploadSlots {
    permits: usize,
    users: DashMap<i64, Arc<Semaphore>>,
}

impl UploadSlots {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: permits.max(1),
            users: DashMap::new(),
        }
    }

    pub async fn acquire(&self, user_id: i64) -> ApiResult<OwnedSemaphorePermit> {
        let semaphore = Arc::clone(
            &self
                .users
                .entry(user_id)
                .or_insert_with(|| Arc::new(Semaphore::new(self.permits))),
        );
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| ApiError::Internal("upload slots closed".to_string()))
    }
}

fn validate_upload_id(upload_id: &str) -> ApiResult<()> {
    if upload_id.is_empty() || upload_id.len() > 255 {
        return Err(ApiError::InvalidRequest("invalid upload id".to_string()));
    }
    Ok(())
}

async fn ensure_channel(state: &AppState, user_id: i64, channel_id: i64) -> ApiResult<()> {
    let owned = state
        .metadata
        .list_channels(user_id)
        .await?
        .iter()
        .any(|c| c.channel_id == channel_id);
    if !owned {
        return Err(ApiError::NotFound(format!("channel {channel_id}")));
    }
    Ok(())
}

/// Register a part uploaded by the client.
pub async fn create_part(state: &AppState, user_id: i64, req: CreatePart) -> ApiResult<UploadPart> {
    validate_upload_id(&req.upload_id)?;
    if req.part_id == 0 {
        return Err(ApiError::InvalidRequest("partId must not be 0".to_string()));
    }
    if req.part_no < 1 {
        return Err(ApiError::InvalidRequest("partNo starts at 1".to_string()));
    }
    if req.size < 0 {
        return Err(ApiError::InvalidRequest("negative size".to_string()));
    }
    if req.encrypted && req.salt.as_deref().is_none_or(str::is_empty) {
        return Err(ApiError::InvalidRequest(
            "encrypted parts need a salt".to_string(),
        ));
    }
    let hashes = hex::decode(&req.block_hashes)
        .map_err(|e| ApiError::InvalidRequest(format!("blockHashes: {e}")))?;
    if hashes.len() % BLOCK_HASH_LEN != 0 {
        return Err(ApiError::InvalidRequest(format!(
            "blockHashes must be a multiple of {BLOCK_HASH_LEN} bytes"
        )));
    }
    ensure_channel(state, user_id, req.channel_id).await?;

    let row = UploadRow {
        upload_id: req.upload_id,
        user_id,
        name: req.name,
        part_no: req.part_no,
        part_id: req.part_id,
        channel_id: req.channel_id,
        size: req.size,
        encrypted: req.encrypted,
        salt: req.salt.filter(|_| req.encrypted),
        block_hashes: hashes,
        created_at: OffsetDateTime::now_utc(),
    };
    state.metadata.create_part(&row).await?;
    UPLOAD_PARTS_STORED.inc();
    tracing::debug!(
        user_id,
        upload_id = %row.upload_id,
        part_no = row.part_no,
        part_id = row.part_id,
        "upload part registered"
    );
    Ok(row.into())
}

/// Parts of an upload in order, hiding those past the retention window.
pub async fn get_parts(state: &AppState, user_id: i64, upload_id: &str) -> ApiResult<Vec<UploadPart>> {
    let not_before = OffsetDateTime::now_utc() - state.config.uploads.retention();
    let rows = state
        .metadata
        .get_parts(upload_id, user_id, not_before)
        .await?;
    Ok(rows.into_iter().map(UploadPart::from).collect())
}

/// Forget an upload. Its messages are purged by the cleanup worker.
pub async fn delete(state: &AppState, user_id: i64, upload_id: &str) -> ApiResult<u64> {
    Ok(state.metadata.delete_upload(upload_id, user_id).await?)
}

/// Uploaded bytes per day over the last `days` days.
pub async fn stats(state: &AppState, user_id: i64, days: u32) -> ApiResult<Vec<DailyUsage>> {
    let since = OffsetDateTime::now_utc() - time::Duration::days(i64::from(days.clamp(1, 365)));
    Ok(state.metadata.daily_usage(user_id, since).await?)
}

async fn send_with_retries(
    client: &dyn UpstreamClient,
    channel_id: i64,
    name: &str,
    payload: Bytes,
    attempts: u32,
) -> ApiResult<MessageLocation> {
    let attempts = attempts.max(1);
    let mut delay = Duration::from_millis(100);
    let mut attempt = 1;
    loop {
        match client.send_media(channel_id, name, payload.clone()).await {
            Ok(location) => return Ok(location),
            Err(e) if e.is_retryable() && attempt < attempts => {
                tracing::warn!(channel_id, attempt, error = %e, "part upload failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_BACKOFF);
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Receive a part's bytes, post them to a channel and record the part.
pub async fn upload_part(
    state: &AppState,
    user: &AuthenticatedUser,
    upload_id: &str,
    params: UploadParams,
    body: Bytes,
) -> ApiResult<UploadPart> {
    let user_id = user.user_id;
    validate_upload_id(upload_id)?;
    if params.part_no < 1 {
        return Err(ApiError::InvalidRequest("partNo starts at 1".to_string()));
    }
    if body.len() as u64 > state.config.uploads.max_part_size {
        return Err(ApiError::InvalidRequest(format!(
            "part of {} bytes exceeds the limit of {}",
            body.len(),
            state.config.uploads.max_part_size
        )));
    }
    let passphrase = match (params.encrypted, &state.config.uploads.encryption_key) {
        (true, Some(key)) => Some(key.clone()),
        (true, None) => {
            return Err(ApiError::InvalidRequest(
                "encryption is not configured".to_string(),
            ));
        }
        (false, _) => None,
    };

    let _slot = state.uploads.acquire(user_id).await?;

    let channel_id = match params.channel_id {
        Some(channel_id) => {
            ensure_channel(state, user_id, channel_id).await?;
            channel_id
        }
        None => {
            let owner = state.user_client(user_id, Some(&user.session)).await?;
            state
                .channels
                .channel_for_upload(user_id, owner.as_ref())
                .await?
        }
    };

    let plain_size = body.len() as i64;
    let (payload, salt, hashes) = tokio::task::spawn_blocking(move || -> ApiResult<_> {
        let hashes = block_hashes(&body);
        match passphrase {
            Some(passphrase) => {
                let salt = random_salt();
                let cipher = Cipher::new(&passphrase, &salt)?;
                let sealed = cipher.encrypt(&Nonce::random(), &body);
                Ok((Bytes::from(sealed), Some(salt), hashes))
            }
            None => Ok((body, None, hashes)),
        }
    })
    .await
    .map_err(|e| ApiError::Internal(format!("part encoding task failed: {e}")))??;

    let client = state
        .client_for(user_id, Some(&user.session), BotOp::Upload, channel_id)
        .await?;
    let part_name = params
        .part_name
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("{}.part.{:03}", params.file_name, params.part_no));
    let stored_len = payload.len() as u64;
    let location = send_with_retries(
        client.as_ref(),
        channel_id,
        &part_name,
        payload,
        state.config.uploads.max_retries,
    )
    .await?;
    UPLOADED_BYTES.inc_by(stored_len);

    let row = UploadRow {
        upload_id: upload_id.to_string(),
        user_id,
        name: params.file_name,
        part_no: params.part_no,
        part_id: location.message_id,
        channel_id,
        size: plain_size,
        encrypted: salt.is_some(),
        salt,
        block_hashes: hashes,
        created_at: OffsetDateTime::now_utc(),
    };
    state.metadata.create_part(&row).await?;
    UPLOAD_PARTS_STORED.inc();
    tracing::info!(
        user_id,
        upload_id,
        part_no = row.part_no,
        part_id = row.part_id,
        channel_id,
        size = plain_size,
        "upload part stored"
    );
    Ok(row.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::TestContext;
    use teldrive_core::config::AppConfig;

    fn part(upload_id: &str, channel_id: i64, part_no: i32, part_id: i64) -> CreatePart {
        CreatePart {
            upload_id: upload_id.into(),
            name: "f.bin".into(),
            part_no,
            part_id,
            channel_id,
            size: 10,
            encrypted: false,
            salt: None,
            block_hashes: hex::encode([7u8; 32]),
        }
    }

    #[tokio::test]
    async fn test_create_part_validation() {
        let ctx = TestContext::new(AppConfig::for_testing()).await;
        let (_, channel) = ctx.user(1).await;

        let err = create_part(&ctx.state, 1, part("u", channel, 1, 0)).await.unwrap_err();
        assert_eq!(err.code(), "invalid_request");
        let err = create_part(&ctx.state, 1, part("u", channel, 0, 5)).await.unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        let mut bad_hashes = part("u", channel, 1, 5);
        bad_hashes.block_hashes = hex::encode([1u8; 31]);
        assert!(create_part(&ctx.state, 1, bad_hashes).await.is_err());

        let mut unsalted = part("u", channel, 1, 5);
        unsalted.encrypted = true;
        assert!(create_part(&ctx.state, 1, unsalted).await.is_err());

        let err = create_part(&ctx.state, 1, part("u", channel + 1000, 1, 5))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_parts_come_back_in_order() {
        let ctx = TestContext::new(AppConfig::for_testing()).await;
        let (_, channel) = ctx.user(1).await;
        create_part(&ctx.state, 1, part("u", channel, 2, 12)).await.unwrap();
        create_part(&ctx.state, 1, part("u", channel, 1, 11)).await.unwrap();

        let parts = get_parts(&ctx.state, 1, "u").await.unwrap();
        assert_eq!(
            parts.iter().map(|p| p.part_no).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(get_parts(&ctx.state, 2, "u").await.unwrap().is_empty());

        assert_eq!(delete(&ctx.state, 1, "u").await.unwrap(), 2);
        assert!(get_parts(&ctx.state, 1, "u").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_part_plain() {
        let ctx = TestContext::new(AppConfig::for_testing()).await;
        let (user, channel) = ctx.user(1).await;
        let body = Bytes::from(vec![3u8; 4096]);
        let stored = upload_part(
            &ctx.state,
            &user,
            "up",
            UploadParams {
                part_no: 1,
                file_name: "a.bin".into(),
                part_name: None,
                encrypted: false,
                channel_id: None,
            },
            body.clone(),
        )
        .await
        .unwrap();
        assert_eq!(stored.channel_id, channel);
        assert_eq!(stored.size, 4096);
        assert_eq!(stored.block_hashes, block_hashes(&body));
        assert!(ctx.network.message_ids(channel).contains(&stored.part_id));
    }

    #[tokio::test]
    async fn test_upload_part_encrypted_hashes_plaintext() {
        let ctx = TestContext::new(AppConfig::for_testing()).await;
        let (user, channel) = ctx.user(1).await;
        let body = Bytes::from(vec![9u8; 100_000]);
        let stored = upload_part(
            &ctx.state,
            &user,
            "enc",
            UploadParams {
                part_no: 1,
                file_name: "s.bin".into(),
                part_name: Some("s.bin.1".into()),
                encrypted: true,
                channel_id: Some(channel),
            },
            body.clone(),
        )
        .await
        .unwrap();
        assert!(stored.encrypted);
        assert!(stored.salt.is_some());
        assert_eq!(stored.size, 100_000);
        assert_eq!(stored.block_hashes, block_hashes(&body));
    }

    #[tokio::test]
    async fn test_encryption_requires_a_key() {
        let mut config = AppConfig::for_testing();
        config.uploads.encryption_key = None;
        let ctx = TestContext::new(config).await;
        let (user, _) = ctx.user(1).await;
        let err = upload_part(
            &ctx.state,
            &user,
            "x",
            UploadParams {
                part_no: 1,
                file_name: "x".into(),
                part_name: None,
                encrypted: true,
                channel_id: None,
            },
            Bytes::from_static(b"abc"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[tokio::test]
    async fn test_upload_slots_bound_concurrency() {
        let slots = UploadSlots::new(1);
        let held = slots.acquire(1).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(20), slots.acquire(1))
                .await
                .is_err()
        );
        assert!(slots.acquire(2).await.is_ok());
        drop(held);
        assert!(slots.acquire(1).await.is_ok());
    }
}
