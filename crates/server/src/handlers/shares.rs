//! File sharing.
//!
//! Owners attach at most one share to a file or folder. Viewers reach the
//! shared subtree through the share id, unlocking protected shares with
//! `Authorization: Basic` (any user, the share password) or
//! `X-Share-Password`.

use crate::auth::AuthenticatedUser;
use crate::error::{ApiError, ApiResult};
use crate::handlers::files::{ListResponse, list_response};
use crate::handlers::stream::{StreamQuery, serve_file};
use crate::services::files;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use teldrive_core::{File, FileId, FileShare, FileType};
use teldrive_metadata::models::ShareRow;
use teldrive_metadata::query::FileQuery;
use time::OffsetDateTime;
use uuid::Uuid;

const SHARE_PASSWORD_HEADER: &str = "x-share-password";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRequest {
    /// Empty clears the password on update.
    pub password: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareResponse {
    #[serde(flatten)]
    pub share: FileShare,
    pub protected: bool,
}

impl From<FileShare> for ShareResponse {
    fn from(share: FileShare) -> Self {
        let protected = share.is_protected();
        Self { share, protected }
    }
}

/// What a viewer learns about a share.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareInfo {
    pub id: Uuid,
    pub file_id: FileId,
    pub name: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub protected: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareListParams {
    pub parent_id: Option<FileId>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

async fn hash_password(password: String) -> ApiResult<String> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, bcrypt::DEFAULT_COST))
        .await
        .map_err(|e| ApiError::Internal(format!("password hashing task failed: {e}")))?
        .map_err(|e| ApiError::Internal(format!("password hashing failed: {e}")))
}

async fn verify_password(password: String, hash: String) -> ApiResult<bool> {
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| ApiError::Internal(format!("password check task failed: {e}")))?
        .map_err(|e| ApiError::Internal(format!("password check failed: {e}")))
}

/// The password a viewer presented, if any.
fn presented_password(headers: &HeaderMap) -> Option<String> {
    if let Some(password) = headers
        .get(SHARE_PASSWORD_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        return Some(password.to_string());
    }
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    if value.len() < 6 || !value[..6].eq_ignore_ascii_case("basic ") {
        return None;
    }
    let decoded = STANDARD.decode(value[6..].trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (_, password) = decoded.split_once(':')?;
    Some(password.to_string())
}

async fn share_of_file(state: &AppState, user_id: i64, file_id: FileId) -> ApiResult<Option<ShareRow>> {
    let mut shares = state
        .metadata
        .shares_for_file(user_id, file_id.into_uuid())
        .await?;
    Ok(shares.pop())
}

/// Load a live share and check the viewer's password.
async fn open_share(state: &AppState, id: Uuid, headers: &HeaderMap) -> ApiResult<FileShare> {
    let share: FileShare = state
        .metadata
        .get_share(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("share {id}")))?
        .into();
    if share.is_expired(OffsetDateTime::now_utc()) {
        return Err(ApiError::NotFound(format!("share {id}")));
    }
    if let Some(hash) = share.password.clone() {
        let password = presented_password(headers)
            .ok_or_else(|| ApiError::Unauthorized("share password required".to_string()))?;
        if !verify_password(password, hash).await? {
            return Err(ApiError::Forbidden("wrong share password".to_string()));
        }
    }
    Ok(share)
}

/// Whether `id` is the shared root or lies below it.
async fn within_share(state: &AppState, root: &FileId, id: &FileId) -> ApiResult<bool> {
    if id == root {
        return Ok(true);
    }
    let ancestors = state.metadata.ancestors(id.into_uuid()).await?;
    Ok(ancestors.iter().any(|row| row.id == root.into_uuid()))
}

// =============================================================================
// Owner endpoints
// =============================================================================

/// `GET /api/files/{id}/share`.
pub async fn get_share(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(file_id): Path<FileId>,
) -> ApiResult<Json<ShareResponse>> {
    let share = share_of_file(&state, user.user_id, file_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("share of file {file_id}")))?;
    Ok(Json(FileShare::from(share).into()))
}

/// `POST /api/files/{id}/share`.
pub async fn create_share(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(file_id): Path<FileId>,
    Json(req): Json<ShareRequest>,
) -> ApiResult<(StatusCode, Json<ShareResponse>)> {
    files::get(&state, user.user_id, file_id).await?;
    if share_of_file(&state, user.user_id, file_id).await?.is_some() {
        return Err(ApiError::Conflict(format!("file {file_id} is already shared")));
    }
    let password = match req.password.filter(|p| !p.is_empty()) {
        Some(password) => Some(hash_password(password).await?),
        None => None,
    };
    let row = ShareRow {
        id: Uuid::new_v4(),
        file_id: file_id.into_uuid(),
        user_id: user.user_id,
        password,
        expires_at: req.expires_at,
        created_at: OffsetDateTime::now_utc(),
    };
    state.metadata.create_share(&row).await?;
    tracing::info!(user_id = user.user_id, share_id = %row.id, file_id = %file_id, "share created");
    Ok((StatusCode::CREATED, Json(FileShare::from(row).into())))
}

/// `PATCH /api/files/{id}/share`.
///
/// A missing password keeps the current one; the expiry is replaced.
pub async fn update_share(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(file_id): Path<FileId>,
    Json(req): Json<ShareRequest>,
) -> ApiResult<Json<ShareResponse>> {
    let mut row = share_of_file(&state, user.user_id, file_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("share of file {file_id}")))?;
    match req.password {
        Some(password) if password.is_empty() => row.password = None,
        Some(password) => row.password = Some(hash_password(password).await?),
        None => {}
    }
    row.expires_at = req.expires_at;
    state
        .metadata
        .update_share(row.id, row.password.as_deref(), row.expires_at)
        .await?;
    Ok(Json(FileShare::from(row).into()))
}

/// `DELETE /api/files/{id}/share`.
pub async fn delete_share(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(file_id): Path<FileId>,
) -> ApiResult<StatusCode> {
    let row = share_of_file(&state, user.user_id, file_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("share of file {file_id}")))?;
    state.metadata.delete_share(row.id).await?;
    tracing::info!(user_id = user.user_id, share_id = %row.id, "share deleted");
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Viewer endpoints
// =============================================================================

/// `GET /api/shares/{id}`.
pub async fn share_info(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<ShareInfo>> {
    let share = open_share(&state, id, &headers).await?;
    let root = files::get(&state, share.user_id, share.file_id).await?;
    Ok(Json(ShareInfo {
        id: share.id,
        file_id: root.id,
        name: root.name,
        file_type: root.file_type,
        protected: share.password.is_some(),
        expires_at: share.expires_at,
    }))
}

/// `GET /api/shares/{id}/files?parentId=`.
///
/// A shared file lists as itself; a shared folder lists its children, or
/// those of `parentId` when it lies inside the shared subtree.
pub async fn share_files(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<ShareListParams>,
    headers: HeaderMap,
) -> ApiResult<Json<ListResponse>> {
    let share = open_share(&state, id, &headers).await?;
    let root = files::get(&state, share.user_id, share.file_id).await?;

    let mut query = FileQuery::children(share.user_id, None);
    query.page = params.page.unwrap_or(1).max(1);
    query.limit = params
        .limit
        .unwrap_or(FileQuery::DEFAULT_LIMIT)
        .clamp(1, FileQuery::MAX_LIMIT);

    if root.file_type != FileType::Folder {
        return Ok(Json(list_response(&query, vec![root], 1)));
    }
    let parent = params.parent_id.unwrap_or(root.id);
    if !within_share(&state, &root.id, &parent).await? {
        return Err(ApiError::NotFound(format!("folder {parent}")));
    }
    let folder = files::get(&state, share.user_id, parent).await?;
    if folder.file_type != FileType::Folder {
        return Err(ApiError::InvalidRequest(format!("{parent} is not a folder")));
    }
    query.parent_id = Some(Some(parent.into_uuid()));
    let (items, total) = files::list(&state, &query).await?;
    Ok(Json(list_response(&query, items, total)))
}

/// `HEAD|GET /api/shares/{id}/files/{fileId}/stream/{name}`.
pub async fn share_stream(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    Path((id, file_id, _name)): Path<(Uuid, FileId, String)>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Response> {
    let share = open_share(&state, id, &headers).await?;
    if !within_share(&state, &share.file_id, &file_id).await? {
        return Err(ApiError::NotFound(format!("file {file_id}")));
    }
    let file: File = files::get(&state, share.user_id, file_id).await?;
    serve_file(&state, &file, None, &method, &headers, query.is_download()).await
}
