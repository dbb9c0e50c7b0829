//! Consistency check between the namespace and channel contents.
//!
//! For every channel of every user (or one user), the message history is
//! compared with the parts referenced by files and uploads. A file is
//! missing when any of its parts is gone upstream; an orphan is a message
//! nothing references.

use crate::services::files;
use crate::state::AppState;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use teldrive_core::FileId;
use teldrive_upstream::UpstreamClient;

/// History page size.
const HISTORY_PAGE: usize = 100;

#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub user: Option<i64>,
    pub clean: bool,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MissingFile {
    pub id: FileId,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelReport {
    pub user_id: i64,
    pub channel_id: i64,
    pub missing: Vec<MissingFile>,
    pub orphans: usize,
}

/// Every message id of a channel, newest first.
async fn channel_messages(client: &dyn UpstreamClient, channel_id: i64) -> Result<HashSet<i64>> {
    let mut ids = HashSet::new();
    let mut offset = 0;
    loop {
        let page = client
            .history(channel_id, offset, HISTORY_PAGE)
            .await
            .with_context(|| format!("failed to read history of channel {channel_id}"))?;
        let Some(&oldest) = page.message_ids.last() else {
            break;
        };
        ids.extend(page.message_ids.iter().copied());
        if page.message_ids.len() < HISTORY_PAGE || ids.len() as i64 >= page.total {
            break;
        }
        offset = oldest;
    }
    Ok(ids)
}

async fn check_channel(
    state: &AppState,
    client: &dyn UpstreamClient,
    user_id: i64,
    channel_id: i64,
    clean: bool,
) -> Result<ChannelReport> {
    let messages = channel_messages(client, channel_id).await?;
    let rows = state.metadata.channel_files(user_id, channel_id).await?;

    let mut referenced: HashSet<i64> = state
        .metadata
        .channel_upload_messages(channel_id)
        .await?
        .into_iter()
        .collect();
    let mut missing = Vec::new();
    for row in &rows {
        referenced.extend(row.part_list().iter().map(|p| p.id));
        if row.part_list().iter().any(|p| !messages.contains(&p.id)) {
            missing.push(MissingFile {
                id: FileId::from_uuid(row.id),
                name: row.name.clone(),
                path: files::full_path(state, row.id).await?,
            });
        }
    }
    let orphans: Vec<i64> = messages
        .iter()
        .filter(|id| !referenced.contains(id))
        .copied()
        .collect();

    tracing::info!(
        user_id,
        channel_id,
        messages = messages.len(),
        files = rows.len(),
        missing = missing.len(),
        orphans = orphans.len(),
        "channel checked"
    );

    if clean {
        if !orphans.is_empty() {
            for batch in orphans.chunks(HISTORY_PAGE) {
                client
                    .delete_messages(channel_id, batch)
                    .await
                    .with_context(|| format!("failed to delete orphans in channel {channel_id}"))?;
            }
            tracing::info!(user_id, channel_id, count = orphans.len(), "orphan messages deleted");
        }
        if !missing.is_empty() {
            let ids: Vec<_> = missing.iter().map(|m| m.id.into_uuid()).collect();
            let marked = state.metadata.delete_files(user_id, &ids).await?;
            tracing::info!(user_id, channel_id, marked, "missing files marked for deletion");
        }
    }

    Ok(ChannelReport {
        user_id,
        channel_id,
        missing,
        orphans: orphans.len(),
    })
}

/// Run the check and write the report. A channel that could not be checked
/// fails the run after the report is written.
pub async fn run(state: &AppState, options: &CheckOptions) -> Result<Vec<ChannelReport>> {
    let users: Vec<i64> = match options.user {
        Some(user_id) => vec![user_id],
        None => state
            .metadata
            .list_users()
            .await?
            .into_iter()
            .map(|u| u.user_id)
            .collect(),
    };

    let mut reports = Vec::new();
    let mut failures = 0usize;
    for user_id in users {
        let client = match state.user_client(user_id, None).await {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(user_id, error = %e, "cannot act for user");
                failures += 1;
                continue;
            }
        };
        for channel in state.metadata.list_channels(user_id).await? {
            match check_channel(state, client.as_ref(), user_id, channel.channel_id, options.clean)
                .await
            {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::error!(user_id, channel_id = channel.channel_id, error = %e, "channel check failed");
                    failures += 1;
                }
            }
        }
    }

    let json = serde_json::to_vec_pretty(&reports).context("failed to encode report")?;
    tokio::fs::write(&options.output, json)
        .await
        .with_context(|| format!("failed to write {}", options.output.display()))?;
    tracing::info!(path = %options.output.display(), channels = reports.len(), "report written");

    if failures > 0 {
        anyhow::bail!("{failures} user(s) or channel(s) could not be checked");
    }
    Ok(reports)
}
