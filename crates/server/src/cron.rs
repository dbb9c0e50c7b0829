//! Background jobs.
//!
//! Each job runs on its own interval until the shutdown token fires:
//! - `clean_files` purges files marked for deletion, messages first
//! - `clean_uploads` drops upload parts past their retention window
//! - `clean_events` drops old change events
//! - `sweep` evicts expired cache entries, idle clients, expired sessions,
//!   stale event dedup entries and idle rate-limit buckets

use crate::error::ApiResult;
use crate::metrics::{MESSAGES_DELETED, record_cron_run};
use crate::state::AppState;
use futures::{StreamExt, stream};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use teldrive_core::MemoryCache;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Messages per upstream delete call.
const DELETE_BATCH: usize = 100;

/// Pending files handled per run.
const PURGE_LIMIT: i64 = 1000;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Delete messages from a channel in batches. Returns the ids whose batch
/// failed.
async fn delete_messages(
    state: &AppState,
    user_id: i64,
    channel_id: i64,
    ids: Vec<i64>,
) -> HashSet<i64> {
    let client = match state.user_client(user_id, None).await {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(user_id, channel_id, error = %e, "no client to delete messages with");
            return ids.into_iter().collect();
        }
    };
    let batches: Vec<Vec<i64>> = ids.chunks(DELETE_BATCH).map(<[i64]>::to_vec).collect();
    stream::iter(batches)
        .map(|batch| {
            let client = Arc::clone(&client);
            async move {
                match client.delete_messages(channel_id, &batch).await {
                    Ok(()) => {
                        MESSAGES_DELETED.inc_by(batch.len() as u64);
                        Vec::new()
                    }
                    Err(e) => {
                        tracing::warn!(user_id, channel_id, count = batch.len(), error = %e, "message delete failed");
                        batch
                    }
                }
            }
        })
        .buffer_unordered(parallelism())
        .flat_map(stream::iter)
        .collect()
        .await
}

/// Purge files marked for deletion. Rows whose messages could not be
/// deleted stay for the next run. Returns the number of purged rows.
pub async fn clean_files(state: &AppState) -> ApiResult<u64> {
    let pending = state.metadata.pending_deletions(PURGE_LIMIT).await?;
    if pending.is_empty() {
        return Ok(0);
    }

    let mut groups: BTreeMap<(i64, i64), Vec<_>> = BTreeMap::new();
    let mut purgeable = Vec::new();
    for row in pending {
        match row.channel_id {
            Some(channel_id) if !row.part_list().is_empty() => {
                groups.entry((row.user_id, channel_id)).or_default().push(row);
            }
            _ => purgeable.push(row.id),
        }
    }

    for ((user_id, channel_id), rows) in groups {
        let ids: Vec<i64> = rows
            .iter()
            .flat_map(|row| row.part_list().iter().map(|p| p.id))
            .collect();
        let failed = delete_messages(state, user_id, channel_id, ids).await;
        for row in rows {
            if row.part_list().iter().all(|p| !failed.contains(&p.id)) {
                purgeable.push(row.id);
            }
        }
    }

    let purged = state.metadata.purge_files(&purgeable).await?;
    tracing::info!(purged, "purged deleted files");
    Ok(purged)
}

/// Delete upload parts older than the retention window, upstream and in the
/// store. Returns the number of removed rows.
pub async fn clean_uploads(state: &AppState) -> ApiResult<u64> {
    let cutoff = OffsetDateTime::now_utc() - state.config.uploads.retention();
    let expired = state.metadata.expired_parts(cutoff).await?;
    if expired.is_empty() {
        return Ok(0);
    }

    let mut groups: BTreeMap<(i64, i64), Vec<i64>> = BTreeMap::new();
    for part in expired {
        groups
            .entry((part.user_id, part.channel_id))
            .or_default()
            .push(part.part_id);
    }

    let mut removed = 0;
    for ((user_id, channel_id), ids) in groups {
        let failed = delete_messages(state, user_id, channel_id, ids.clone()).await;
        let done: Vec<i64> = ids.into_iter().filter(|id| !failed.contains(id)).collect();
        if !done.is_empty() {
            removed += state
                .metadata
                .delete_parts_by_message(channel_id, &done)
                .await?;
        }
    }
    tracing::info!(removed, "removed expired upload parts");
    Ok(removed)
}

/// Delete events past the retention window.
pub async fn clean_events(state: &AppState) -> ApiResult<u64> {
    let retention = time::Duration::days(i64::from(state.config.cron.event_retention_days));
    let removed = state
        .metadata
        .delete_events_before(OffsetDateTime::now_utc() - retention)
        .await?;
    if removed > 0 {
        tracing::info!(removed, "removed old events");
    }
    Ok(removed)
}

/// Evict expired in-memory state.
pub async fn sweep(state: &AppState, cache: Option<&MemoryCache>) -> ApiResult<()> {
    let cache_entries = cache.map(MemoryCache::sweep).unwrap_or(0);
    let clients = state.pool.evict_idle();
    let sessions = state
        .metadata
        .delete_expired_sessions(OffsetDateTime::now_utc())
        .await?;
    let dedup = state.events.sweep();
    let buckets = if state.rate_limit.is_enabled() {
        state.rate_limit.cleanup()
    } else {
        0
    };
    tracing::debug!(cache_entries, clients, sessions, dedup, buckets, "sweep finished");
    Ok(())
}

fn spawn_job<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ApiResult<()>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match job().await {
                Ok(()) => record_cron_run(name, true),
                Err(e) => {
                    record_cron_run(name, false);
                    tracing::error!(job = name, error = %e, "background job failed");
                }
            }
        }
        tracing::debug!(job = name, "background job stopped");
    })
}

/// Start every background job.
pub fn spawn(
    state: AppState,
    cache: Option<Arc<MemoryCache>>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let cron = state.config.cron.clone();

    if cron.enabled {
        let s = state.clone();
        handles.push(spawn_job(
            "clean_files",
            Duration::from_secs(cron.clean_files_interval_secs),
            shutdown.clone(),
            move || {
                let s = s.clone();
                async move { clean_files(&s).await.map(|_| ()) }
            },
        ));
        let s = state.clone();
        handles.push(spawn_job(
            "clean_uploads",
            Duration::from_secs(cron.clean_uploads_interval_secs),
            shutdown.clone(),
            move || {
                let s = s.clone();
                async move { clean_uploads(&s).await.map(|_| ()) }
            },
        ));
        let s = state.clone();
        handles.push(spawn_job(
            "clean_events",
            Duration::from_secs(cron.clean_events_interval_secs),
            shutdown.clone(),
            move || {
                let s = s.clone();
                async move { clean_events(&s).await.map(|_| ()) }
            },
        ));
    } else {
        tracing::info!("cron jobs disabled");
    }

    let period = state
        .rate_limit_cleanup_interval()
        .unwrap_or(SWEEP_INTERVAL);
    handles.push(spawn_job("sweep", period, shutdown, move || {
        let s = state.clone();
        let cache = cache.clone();
        async move { sweep(&s, cache.as_deref()).await }
    }));
    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::TestContext;
    use bytes::Bytes;
    use teldrive_core::config::AppConfig;
    use teldrive_core::{EventSource, EventType, FileId, FileStatus, FileType, Part};
    use crate::services::files::{self, CreateFile, UpdateFile};
    use teldrive_metadata::models::{FileRow, UploadRow};

    fn seed_file(ctx: &TestContext, user_id: i64, channel_id: i64, name: &str) -> (FileRow, i64) {
        let message = ctx
            .network
            .seed_message(channel_id, Bytes::from_static(b"payload"))
            .unwrap();
        let now = OffsetDateTime::now_utc();
        let mut row = FileRow::folder(user_id, name, None, now);
        row.file_type = FileType::File.as_str().to_string();
        row.mime_type = "text/plain".into();
        row.size = Some(7);
        row.status = FileStatus::PendingDeletion.as_str().to_string();
        row.channel_id = Some(channel_id);
        row.parts = Some(sqlx::types::Json(vec![Part::plain(message)]));
        (row, message)
    }

    #[tokio::test]
    async fn test_clean_files_deletes_messages_then_rows() {
        let ctx = TestContext::new(AppConfig::for_testing()).await;
        let (_, channel_id) = ctx.user(1).await;
        let (row, message) = seed_file(&ctx, 1, channel_id, "gone.txt");
        ctx.state
            .metadata
            .upsert_file(&row, teldrive_metadata::repos::files::ContentSource::Row)
            .await
            .unwrap();

        assert_eq!(clean_files(&ctx.state).await.unwrap(), 1);
        assert!(!ctx.network.message_ids(channel_id).contains(&message));
        assert!(ctx.state.metadata.get_file(row.id).await.unwrap().is_none());
        assert_eq!(clean_files(&ctx.state).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clean_files_keeps_messages_still_referenced() {
        let ctx = TestContext::new(AppConfig::for_testing()).await;
        let (_, channel_id) = ctx.user(1).await;
        let kept = ctx.network.seed_message(channel_id, Bytes::from_static(b"a")).unwrap();
        let dropped = ctx.network.seed_message(channel_id, Bytes::from_static(b"b")).unwrap();
        let create = |parts: Vec<Part>| CreateFile {
            name: "h.txt".into(),
            file_type: FileType::File,
            parent_id: None,
            path: None,
            mime_type: Some("text/plain".into()),
            size: Some(parts.len() as i64),
            channel_id: Some(channel_id),
            parts,
            upload_id: None,
            encrypted: false,
        };

        let file = files::create(&ctx.state, 1, create(vec![Part::plain(kept)]))
            .await
            .unwrap();
        files::create(&ctx.state, 1, create(vec![Part::plain(kept)]))
            .await
            .unwrap();
        assert_eq!(clean_files(&ctx.state).await.unwrap(), 0);

        let patch = UpdateFile {
            size: Some(2),
            parts: Some(vec![Part::plain(kept), Part::plain(dropped)]),
            ..Default::default()
        };
        files::update(&ctx.state, 1, file.id, patch).await.unwrap();
        let patch = UpdateFile {
            size: Some(1),
            parts: Some(vec![Part::plain(kept)]),
            ..Default::default()
        };
        files::update(&ctx.state, 1, file.id, patch).await.unwrap();
        assert_eq!(clean_files(&ctx.state).await.unwrap(), 1);

        let remaining = ctx.network.message_ids(channel_id);
        assert!(remaining.contains(&kept));
        assert!(!remaining.contains(&dropped));
        let live = files::get(&ctx.state, 1, file.id).await.unwrap();
        assert_eq!(live.parts, vec![Part::plain(kept)]);
    }

    #[tokio::test]
    async fn test_clean_uploads_respects_retention() {
        let mut config = AppConfig::for_testing();
        config.uploads.retention_secs = 60;
        let ctx = TestContext::new(config).await;
        let (_, channel_id) = ctx.user(1).await;
        let now = OffsetDateTime::now_utc();
        for (n, age) in [(1, 3600), (2, 0)] {
            let part_id = ctx
                .network
                .seed_message(channel_id, Bytes::from_static(b"part"))
                .unwrap();
            ctx.state
                .metadata
                .create_part(&UploadRow {
                    upload_id: "u1".into(),
                    user_id: 1,
                    name: format!("f.part{n}"),
                    part_no: n,
                    part_id,
                    channel_id,
                    size: 4,
                    encrypted: false,
                    salt: None,
                    block_hashes: Vec::new(),
                    created_at: now - time::Duration::seconds(age),
                })
                .await
                .unwrap();
        }

        assert_eq!(clean_uploads(&ctx.state).await.unwrap(), 1);
        let left = ctx
            .state
            .metadata
            .get_parts("u1", 1, now - time::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].part_no, 2);
        assert_eq!(ctx.network.message_ids(channel_id).len(), 1);
    }

    #[tokio::test]
    async fn test_clean_events_keeps_recent() {
        let ctx = TestContext::new(AppConfig::for_testing()).await;
        ctx.state
            .events
            .record(
                EventType::FileCreate,
                1,
                EventSource {
                    id: FileId::new(),
                    file_type: FileType::File,
                    name: "a".into(),
                    parent_id: None,
                    dest_parent_id: None,
                },
            )
            .await;
        ctx.state.events.shutdown().await;
        assert_eq!(clean_events(&ctx.state).await.unwrap(), 0);
        assert_eq!(ctx.state.metadata.recent_events(1, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired_cache_entries() {
        use teldrive_core::Cache;
        let ctx = TestContext::new(AppConfig::for_testing()).await;
        let cache = MemoryCache::new(10);
        cache.set("k", b"v".to_vec(), Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        sweep(&ctx.state, Some(&cache)).await.unwrap();
        assert!(cache.is_empty());
    }
}
