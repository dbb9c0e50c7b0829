//! Namespace operations.
//!
//! Every mutation records a change event and drops the cached metadata of
//! the entries it touched. Name uniqueness, cycle checks and the atomic
//! consumption of uploads are enforced by the metadata store; this layer
//! resolves parents and paths, validates input and checks ownership.

use crate::auth::AuthenticatedUser;
use crate::error::{ApiError, ApiResult};
use crate::services::bots::BotOp;
use crate::state::AppState;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use teldrive_core::cache;
use teldrive_core::file::validate_parts;
use teldrive_core::{
    Category, EventSource, EventType, File, FileId, FileStatus, FileType, Part, TreeHash,
};
use teldrive_metadata::models::FileRow;
use teldrive_metadata::query::FileQuery;
use teldrive_metadata::repos::files::{ContentSource, FileContent, FileUpdate};
use time::OffsetDateTime;
use uuid::Uuid;

const DEFAULT_MIME: &str = "application/octet-stream";

const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFile {
    pub name: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub parent_id: Option<FileId>,
    pub path: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<i64>,
    pub channel_id: Option<i64>,
    #[serde(default)]
    pub parts: Vec<Part>,
    pub upload_id: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFile {
    pub name: Option<String>,
    pub parent_id: Option<FileId>,
    pub channel_id: Option<i64>,
    pub size: Option<i64>,
    pub parts: Option<Vec<Part>>,
    pub encrypted: Option<bool>,
    pub upload_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveFiles {
    pub ids: Vec<FileId>,
    pub destination_parent: Option<FileId>,
    /// Destination folder path, used when no parent id is given.
    pub destination: Option<String>,
    /// Rename on move; only valid for a single id.
    pub destination_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveDirectory {
    pub source: String,
    /// Full destination path including the new folder name.
    pub destination: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyFile {
    pub id: FileId,
    pub destination_parent: Option<FileId>,
    pub destination: Option<String>,
    pub new_name: Option<String>,
}

/// Size of new content; it must accompany any part list.
fn content_size(size: Option<i64>) -> ApiResult<i64> {
    match size {
        Some(size) if size >= 0 => Ok(size),
        Some(_) => Err(ApiError::InvalidRequest("negative size".to_string())),
        None => Err(ApiError::InvalidRequest(
            "size is required with parts".to_string(),
        )),
    }
}

fn validate_name(name: &str) -> ApiResult<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(ApiError::InvalidRequest(format!("invalid name {name:?}")));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(ApiError::InvalidRequest(format!(
            "name {name:?} contains a path separator"
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ApiError::InvalidRequest(format!(
            "name is longer than {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

fn path_components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

fn to_file(row: FileRow) -> ApiResult<File> {
    Ok(File::try_from(row)?)
}

fn event_source(row: &FileRow, parent_id: Option<Uuid>, dest_parent_id: Option<Uuid>) -> EventSource {
    EventSource {
        id: FileId::from_uuid(row.id),
        file_type: if row.is_folder() {
            FileType::Folder
        } else {
            FileType::File
        },
        name: row.name.clone(),
        parent_id: parent_id.map(FileId::from_uuid),
        dest_parent_id: dest_parent_id.map(FileId::from_uuid),
    }
}

fn file_ttl(state: &AppState) -> Duration {
    Duration::from_secs(state.config.cache.default_ttl_secs)
}

/// Drop the cached metadata and part locations of a file.
pub async fn invalidate(state: &AppState, id: &FileId) {
    state.cache.delete(&cache::file_key(id)).await;
    state.cache.delete_pattern(&cache::location_pattern(id)).await;
}

/// An active entry owned by `user_id`.
async fn owned_row(state: &AppState, user_id: i64, id: Uuid) -> ApiResult<FileRow> {
    match state.metadata.get_file(id).await? {
        Some(row) if row.user_id == user_id && row.is_active() => Ok(row),
        _ => Err(ApiError::NotFound(format!("file {id}"))),
    }
}

/// An active folder owned by `user_id`, for use as a parent.
async fn owned_folder(state: &AppState, user_id: i64, id: Uuid) -> ApiResult<FileRow> {
    match state.metadata.get_file(id).await? {
        Some(row) if row.user_id == user_id && row.is_active() && row.is_folder() => Ok(row),
        _ => Err(ApiError::Conflict(format!("parent {id} is not a folder"))),
    }
}

/// Walk an absolute path. `/` is the root (`None`); a missing or non-folder
/// component is a conflict.
pub async fn resolve_dir(state: &AppState, user_id: i64, path: &str) -> ApiResult<Option<Uuid>> {
    let mut parent = None;
    for name in path_components(path) {
        match state.metadata.find_child(user_id, parent, name).await? {
            Some(row) if row.is_folder() => parent = Some(row.id),
            Some(_) => {
                return Err(ApiError::Conflict(format!(
                    "{name:?} in {path:?} is not a folder"
                )));
            }
            None => return Err(ApiError::Conflict(format!("path {path:?} does not exist"))),
        }
    }
    Ok(parent)
}

/// Parent folder from an explicit id or a path. Neither means the root.
pub async fn resolve_parent(
    state: &AppState,
    user_id: i64,
    parent_id: Option<FileId>,
    path: Option<&str>,
) -> ApiResult<Option<Uuid>> {
    if let Some(parent_id) = parent_id {
        let folder = owned_folder(state, user_id, parent_id.into_uuid()).await?;
        return Ok(Some(folder.id));
    }
    match path {
        Some(path) => resolve_dir(state, user_id, path).await,
        None => Ok(None),
    }
}

/// Absolute path of an entry, `/` separated.
pub async fn full_path(state: &AppState, id: Uuid) -> ApiResult<String> {
    let chain = state.metadata.ancestors(id).await?;
    let mut path = String::new();
    for row in chain.iter().rev() {
        path.push('/');
        path.push_str(&row.name);
    }
    if path.is_empty() {
        path.push('/');
    }
    Ok(path)
}

pub async fn get(state: &AppState, user_id: i64, id: FileId) -> ApiResult<File> {
    let key = cache::file_key(&id);
    if let Some(file) = cache::get_json::<File>(state.cache.as_ref(), &key).await
        && file.user_id == user_id
        && file.status == FileStatus::Active
    {
        return Ok(file);
    }
    let file = to_file(owned_row(state, user_id, id.into_uuid()).await?)?;
    cache::set_json(state.cache.as_ref(), &key, &file, file_ttl(state)).await;
    Ok(file)
}

pub async fn create(state: &AppState, user_id: i64, req: CreateFile) -> ApiResult<File> {
    validate_name(&req.name)?;
    let parent_id = resolve_parent(state, user_id, req.parent_id, req.path.as_deref()).await?;
    let now = OffsetDateTime::now_utc();

    let stored = match req.file_type {
        FileType::Folder => {
            let row = FileRow::folder(user_id, &req.name, parent_id, now);
            state.metadata.upsert_file(&row, ContentSource::Row).await?
        }
        FileType::File => {
            let mime_type = req
                .mime_type
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_MIME.to_string());
            let mut row = FileRow::folder(user_id, &req.name, parent_id, now);
            row.file_type = FileType::File.as_str().to_string();
            row.category = Category::from_mime(&mime_type, &req.name).as_str().to_string();
            row.mime_type = mime_type;

            let content = match req.upload_id {
                Some(upload_id) => ContentSource::Upload(upload_id),
                None => {
                    validate_parts(&req.parts, req.encrypted)?;
                    let size = if req.parts.is_empty() {
                        content_size(req.size.or(Some(0)))?
                    } else {
                        content_size(req.size)?
                    };
                    let channel_id = match req.channel_id {
                        Some(id) => id,
                        None => state.channels.current_channel(user_id).await?,
                    };
                    ContentSource::Parts(FileContent {
                        channel_id,
                        size,
                        parts: req.parts,
                        encrypted: req.encrypted,
                        hash: (size == 0).then(|| TreeHash::empty().to_hex()),
                    })
                }
            };
            state.metadata.upsert_file(&row, content).await?
        }
    };

    invalidate(state, &FileId::from_uuid(stored.id)).await;
    state
        .events
        .record(EventType::FileCreate, user_id, event_source(&stored, stored.parent_id, None))
        .await;
    tracing::debug!(user_id, file_id = %stored.id, name = %stored.name, "file created");
    to_file(stored)
}

pub async fn update(
    state: &AppState,
    user_id: i64,
    id: FileId,
    req: UpdateFile,
) -> ApiResult<File> {
    let existing = owned_row(state, user_id, id.into_uuid()).await?;
    if let Some(name) = &req.name {
        validate_name(name)?;
    }
    let parent_id = match req.parent_id {
        Some(parent) => Some(Some(owned_folder(state, user_id, parent.into_uuid()).await?.id)),
        None => None,
    };

    let content = match (req.upload_id, req.parts) {
        (Some(upload_id), _) => ContentSource::Upload(upload_id),
        (None, Some(parts)) => {
            let encrypted = req.encrypted.unwrap_or(existing.encrypted);
            validate_parts(&parts, encrypted)?;
            let size = content_size(req.size)?;
            let channel_id = req
                .channel_id
                .or(existing.channel_id)
                .ok_or_else(|| ApiError::InvalidRequest("channelId is required".to_string()))?;
            ContentSource::Parts(FileContent {
                channel_id,
                size,
                parts,
                encrypted,
                hash: (size == 0).then(|| TreeHash::empty().to_hex()),
            })
        }
        (None, None) => {
            if req.size.is_some() || req.channel_id.is_some() || req.encrypted.is_some() {
                return Err(ApiError::InvalidRequest(
                    "content fields must be updated together with parts".to_string(),
                ));
            }
            ContentSource::Row
        }
    };
    if existing.is_folder() && content != ContentSource::Row {
        return Err(ApiError::InvalidRequest(
            "folders have no content".to_string(),
        ));
    }

    let now = OffsetDateTime::now_utc();
    let mut updated = existing.clone();
    if req.name.is_some() || parent_id.is_some() {
        // Renames and re-parenting share the move rules, including the
        // cycle check and collision replacement.
        let parent = parent_id.unwrap_or(existing.parent_id);
        let name = req.name.as_deref().unwrap_or(&existing.name);
        updated = state
            .metadata
            .move_file(user_id, existing.id, parent, name, now)
            .await?;
        if existing.is_folder() {
            state.cache.delete_pattern("file:*").await;
        }
    }
    if content != ContentSource::Row {
        let update = FileUpdate {
            name: None,
            parent_id: None,
            content,
            updated_at: now,
        };
        updated = state.metadata.update_file(existing.id, &update).await?;
    }
    invalidate(state, &id).await;
    state
        .events
        .record(
            EventType::FileUpdate,
            user_id,
            event_source(&updated, existing.parent_id, None),
        )
        .await;
    to_file(updated)
}

/// Delete entries. Unknown ids fail with `not_found`; entries already
/// pending deletion are skipped.
pub async fn delete(state: &AppState, user_id: i64, ids: &[FileId]) -> ApiResult<u64> {
    if ids.is_empty() {
        return Err(ApiError::InvalidRequest("no ids given".to_string()));
    }
    let mut targets = Vec::with_capacity(ids.len());
    for id in ids {
        match state.metadata.get_file(id.into_uuid()).await? {
            Some(row) if row.user_id == user_id => {
                if row.is_active() {
                    targets.push(row);
                }
            }
            _ => return Err(ApiError::NotFound(format!("file {id}"))),
        }
    }
    if targets.is_empty() {
        return Ok(0);
    }

    let target_ids: Vec<Uuid> = targets.iter().map(|r| r.id).collect();
    let affected = state.metadata.delete_files(user_id, &target_ids).await?;

    if targets.iter().any(FileRow::is_folder) {
        // Descendants are not enumerated here.
        state.cache.delete_pattern("file:*").await;
    }
    for row in &targets {
        invalidate(state, &FileId::from_uuid(row.id)).await;
        state
            .events
            .record(EventType::FileDelete, user_id, event_source(row, row.parent_id, None))
            .await;
    }
    tracing::info!(user_id, entries = targets.len(), affected, "files deleted");
    Ok(affected)
}

pub async fn move_files(state: &AppState, user_id: i64, req: MoveFiles) -> ApiResult<Vec<File>> {
    if req.ids.is_empty() {
        return Err(ApiError::InvalidRequest("no ids given".to_string()));
    }
    if req.destination_name.is_some() && req.ids.len() != 1 {
        return Err(ApiError::InvalidRequest(
            "destinationName requires exactly one id".to_string(),
        ));
    }
    if let Some(name) = &req.destination_name {
        validate_name(name)?;
    }
    let destination = resolve_parent(
        state,
        user_id,
        req.destination_parent,
        req.destination.as_deref(),
    )
    .await?;

    let mut moved = Vec::with_capacity(req.ids.len());
    for id in &req.ids {
        let row = owned_row(state, user_id, id.into_uuid()).await?;
        let name = req.destination_name.as_deref().unwrap_or(&row.name);
        let updated = state
            .metadata
            .move_file(user_id, row.id, destination, name, OffsetDateTime::now_utc())
            .await?;
        invalidate(state, id).await;
        state
            .events
            .record(
                EventType::FileMove,
                user_id,
                event_source(&updated, row.parent_id, destination),
            )
            .await;
        moved.push(to_file(updated)?);
    }
    if moved.iter().any(File::is_folder) {
        state.cache.delete_pattern("file:*").await;
    }
    Ok(moved)
}

/// Create every missing folder of `path` and return the last one.
pub async fn mkdir(state: &AppState, user_id: i64, path: &str) -> ApiResult<File> {
    let mut parent = None;
    let mut current = None;
    for name in path_components(path) {
        validate_name(name)?;
        let row = match state.metadata.find_child(user_id, parent, name).await? {
            Some(row) if row.is_folder() => row,
            Some(_) => {
                return Err(ApiError::Conflict(format!(
                    "{name:?} in {path:?} is a file"
                )));
            }
            None => {
                let folder = FileRow::folder(user_id, name, parent, OffsetDateTime::now_utc());
                let created = state.metadata.upsert_file(&folder, ContentSource::Row).await?;
                state
                    .events
                    .record(EventType::FileCreate, user_id, event_source(&created, parent, None))
                    .await;
                created
            }
        };
        parent = Some(row.id);
        current = Some(row);
    }
    let folder = current.ok_or_else(|| ApiError::InvalidRequest("path names no folder".to_string()))?;
    to_file(folder)
}

/// Move the folder at `source` to the full path `destination`, creating the
/// destination's parents.
pub async fn move_directory(state: &AppState, user_id: i64, req: MoveDirectory) -> ApiResult<File> {
    let source = resolve_dir(state, user_id, &req.source)
        .await?
        .ok_or_else(|| ApiError::InvalidRequest("cannot move the root".to_string()))?;
    let source = owned_row(state, user_id, source).await?;

    let components: Vec<&str> = path_components(&req.destination).collect();
    let (name, parents) = components
        .split_last()
        .ok_or_else(|| ApiError::InvalidRequest("destination names no folder".to_string()))?;
    validate_name(name)?;
    let parent = if parents.is_empty() {
        None
    } else {
        Some(mkdir(state, user_id, &parents.join("/")).await?.id.into_uuid())
    };

    let moved = state
        .metadata
        .move_file(user_id, source.id, parent, name, OffsetDateTime::now_utc())
        .await?;
    state.cache.delete_pattern("file:*").await;
    state
        .events
        .record(EventType::FileMove, user_id, event_source(&moved, source.parent_id, parent))
        .await;
    to_file(moved)
}

/// Copy a file by re-posting its part messages into a new entry. The hash
/// is kept; an existing entry with the target name is a conflict.
pub async fn copy(state: &AppState, user: &AuthenticatedUser, req: CopyFile) -> ApiResult<File> {
    let user_id = user.user_id;
    let source = owned_row(state, user_id, req.id.into_uuid()).await?;
    if source.is_folder() {
        return Err(ApiError::InvalidRequest("only files can be copied".to_string()));
    }
    let name = req.new_name.unwrap_or_else(|| source.name.clone());
    validate_name(&name)?;
    let parent_id = resolve_parent(
        state,
        user_id,
        req.destination_parent,
        req.destination.as_deref(),
    )
    .await?;
    if state
        .metadata
        .find_child(user_id, parent_id, &name)
        .await?
        .is_some()
    {
        return Err(ApiError::Conflict(format!("{name:?} already exists")));
    }

    let owner = state.user_client(user_id, Some(&user.session)).await?;
    let mut parts = Vec::with_capacity(source.part_list().len());
    let mut channel_id = source.channel_id.unwrap_or_default();
    if !source.part_list().is_empty() {
        let source_channel = source
            .channel_id
            .ok_or_else(|| ApiError::Internal(format!("file {} has no channel", source.id)))?;
        channel_id = state.channels.channel_for_upload(user_id, owner.as_ref()).await?;
        let reader = state
            .client_for(user_id, Some(&user.session), BotOp::Upload, source_channel)
            .await?;
        let ids: Vec<i64> = source.part_list().iter().map(|p| p.id).collect();
        let locations: HashMap<i64, _> = reader
            .messages(source_channel, &ids)
            .await?
            .into_iter()
            .map(|l| (l.message_id, l))
            .collect();
        for part in source.part_list() {
            let location = locations.get(&part.id).ok_or_else(|| {
                ApiError::NotFound(format!("part {} of file {}", part.id, source.id))
            })?;
            let copied = owner.copy_media(location, channel_id).await?;
            parts.push(Part {
                id: copied.message_id,
                salt: part.salt.clone(),
            });
        }
    }

    let now = OffsetDateTime::now_utc();
    let mut row = source.clone();
    row.id = FileId::new().into_uuid();
    row.name = name;
    row.parent_id = parent_id;
    row.created_at = now;
    row.updated_at = now;
    let copied: Vec<i64> = parts.iter().map(|p| p.id).collect();
    let content = ContentSource::Parts(FileContent {
        channel_id,
        size: source.size.unwrap_or(0),
        parts,
        encrypted: source.encrypted,
        hash: source.hash.clone(),
    });
    let stored = match state.metadata.insert_file(&row, content).await {
        Ok(stored) => stored,
        Err(e) => {
            if !copied.is_empty()
                && let Err(del) = owner.delete_messages(channel_id, &copied).await
            {
                tracing::warn!(user_id, channel_id, error = %del, "failed to remove copied messages");
            }
            return Err(e.into());
        }
    };
    invalidate(state, &FileId::from_uuid(stored.id)).await;
    state
        .events
        .record(
            EventType::FileCopy,
            user_id,
            event_source(&stored, source.parent_id, parent_id),
        )
        .await;
    to_file(stored)
}

/// One page of a listing.
pub async fn list(state: &AppState, query: &FileQuery) -> ApiResult<(Vec<File>, i64)> {
    let (rows, total) = state.metadata.list_files(query).await?;
    let files = rows.into_iter().map(to_file).collect::<ApiResult<Vec<_>>>()?;
    Ok((files, total))
}
