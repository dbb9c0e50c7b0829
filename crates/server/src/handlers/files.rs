//! File namespace handlers.

use crate::auth::AuthenticatedUser;
use crate::error::{ApiError, ApiResult};
use crate::handlers::stream::{StreamQuery, serve_file};
use crate::services::files::{self, CopyFile, CreateFile, MoveDirectory, MoveFiles, UpdateFile};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use teldrive_core::{File, FileId};
use teldrive_metadata::query::{FileQuery, SortBy, TimeFilter};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Query of `GET /api/files`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    /// `list` (one folder, the default) or `find` (every folder).
    pub op: Option<String>,
    pub parent_id: Option<FileId>,
    pub path: Option<String>,
    #[serde(rename = "type")]
    pub file_type: Option<String>,
    /// Comma-separated categories.
    pub category: Option<String>,
    pub mime_type: Option<String>,
    /// Name substring.
    pub query: Option<String>,
    /// Comma-separated `gte:<rfc3339>` / `lte:<rfc3339>` filters.
    pub updated_at: Option<String>,
    pub sort: Option<String>,
    pub order: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    pub count: i64,
    pub total_pages: i64,
    pub current_page: u32,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub items: Vec<File>,
    pub meta: ListMeta,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub ids: Vec<FileId>,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: u64,
}

#[derive(Debug, Deserialize)]
pub struct MkdirRequest {
    pub path: String,
}

fn parse_updated(raw: &str) -> ApiResult<Vec<TimeFilter>> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|clause| {
            let (op, value) = clause.split_once(':').ok_or_else(|| {
                ApiError::InvalidRequest(format!("updatedAt filter {clause:?} has no operator"))
            })?;
            let at = OffsetDateTime::parse(value, &Rfc3339)
                .map_err(|e| ApiError::InvalidRequest(format!("updatedAt {value:?}: {e}")))?;
            match op {
                "gte" | "gt" => Ok(TimeFilter::After(at)),
                "lte" | "lt" => Ok(TimeFilter::Before(at)),
                other => Err(ApiError::InvalidRequest(format!(
                    "unknown updatedAt operator {other:?}"
                ))),
            }
        })
        .collect()
}

/// Translate listing parameters into a store query.
pub async fn build_query(state: &AppState, user_id: i64, params: ListParams) -> ApiResult<FileQuery> {
    let mut query = FileQuery::children(user_id, None);
    match params.op.as_deref().unwrap_or("list") {
        "list" => {
            query.parent_id = Some(
                files::resolve_parent(state, user_id, params.parent_id, params.path.as_deref())
                    .await?,
            );
        }
        "find" => {
            query.parent_id = match (params.parent_id, params.path.as_deref()) {
                (None, None) => None,
                (parent_id, path) => {
                    Some(files::resolve_parent(state, user_id, parent_id, path).await?)
                }
            };
        }
        other => {
            return Err(ApiError::InvalidRequest(format!("unknown op {other:?}")));
        }
    }
    query.file_type = params.file_type.filter(|t| !t.is_empty());
    if let Some(categories) = params.category {
        query.categories = categories
            .split(',')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
    }
    query.mime_type = params.mime_type.filter(|m| !m.is_empty());
    query.name = params.query.filter(|q| !q.is_empty());
    if let Some(updated) = params.updated_at {
        query.updated = parse_updated(&updated)?;
    }
    if let Some(sort) = params.sort {
        query.sort = SortBy::parse(&sort)
            .ok_or_else(|| ApiError::InvalidRequest(format!("unknown sort {sort:?}")))?;
    }
    query.descending = match params.order.as_deref() {
        None | Some("asc") => false,
        Some("desc") => true,
        Some(other) => {
            return Err(ApiError::InvalidRequest(format!("unknown order {other:?}")));
        }
    };
    query.page = params.page.unwrap_or(1).max(1);
    query.limit = params
        .limit
        .unwrap_or(FileQuery::DEFAULT_LIMIT)
        .clamp(1, FileQuery::MAX_LIMIT);
    Ok(query)
}

pub fn list_response(query: &FileQuery, items: Vec<File>, total: i64) -> ListResponse {
    let limit = i64::from(query.limit.max(1));
    ListResponse {
        items,
        meta: ListMeta {
            count: total,
            total_pages: (total + limit - 1) / limit,
            current_page: query.page,
        },
    }
}

pub async fn list_files(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<ListResponse>> {
    let query = build_query(&state, user.user_id, params).await?;
    let (items, total) = files::list(&state, &query).await?;
    Ok(Json(list_response(&query, items, total)))
}

pub async fn create_file(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(req): Json<CreateFile>,
) -> ApiResult<(StatusCode, Json<File>)> {
    let file = files::create(&state, user.user_id, req).await?;
    Ok((StatusCode::CREATED, Json(file)))
}

pub async fn get_file(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<FileId>,
) -> ApiResult<Json<File>> {
    Ok(Json(files::get(&state, user.user_id, id).await?))
}

pub async fn update_file(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<FileId>,
    Json(req): Json<UpdateFile>,
) -> ApiResult<Json<File>> {
    Ok(Json(files::update(&state, user.user_id, id, req).await?))
}

pub async fn delete_files(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(req): Json<DeleteRequest>,
) -> ApiResult<Json<CountResponse>> {
    let count = files::delete(&state, user.user_id, &req.ids).await?;
    Ok(Json(CountResponse { count }))
}

pub async fn move_files(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(req): Json<MoveFiles>,
) -> ApiResult<Json<Vec<File>>> {
    Ok(Json(files::move_files(&state, user.user_id, req).await?))
}

pub async fn copy_file(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(req): Json<CopyFile>,
) -> ApiResult<(StatusCode, Json<File>)> {
    let file = files::copy(&state, &user, req).await?;
    Ok((StatusCode::CREATED, Json(file)))
}

pub async fn make_directory(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(req): Json<MkdirRequest>,
) -> ApiResult<(StatusCode, Json<File>)> {
    let folder = files::mkdir(&state, user.user_id, &req.path).await?;
    Ok((StatusCode::CREATED, Json(folder)))
}

pub async fn move_directory(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(req): Json<MoveDirectory>,
) -> ApiResult<Json<File>> {
    Ok(Json(files::move_directory(&state, user.user_id, req).await?))
}

/// `HEAD|GET /api/files/{id}/stream/{name}`.
pub async fn stream_file(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    method: Method,
    headers: HeaderMap,
    Path((id, _name)): Path<(FileId, String)>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Response> {
    let file = files::get(&state, user.user_id, id).await?;
    serve_file(
        &state,
        &file,
        Some(&user.session),
        &method,
        &headers,
        query.is_download(),
    )
    .await
}
