//! Upload part handlers.

use crate::auth::AuthenticatedUser;
use crate::error::ApiResult;
use crate::services::uploads::{self, CreatePart, UploadParams};
use crate::state::AppState;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use teldrive_core::UploadPart;

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    pub days: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyUpload {
    pub day: String,
    pub total_size: i64,
}

/// `POST /api/uploads/parts`.
pub async fn create_part(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(req): Json<CreatePart>,
) -> ApiResult<(StatusCode, Json<UploadPart>)> {
    let part = uploads::create_part(&state, user.user_id, req).await?;
    Ok((StatusCode::CREATED, Json(part)))
}

/// `GET /api/uploads/{id}`.
pub async fn get_parts(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<Vec<UploadPart>>> {
    Ok(Json(uploads::get_parts(&state, user.user_id, &upload_id).await?))
}

/// `POST /api/uploads/{id}` with the raw part as body.
pub async fn upload_part(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(upload_id): Path<String>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<UploadPart>)> {
    let part = uploads::upload_part(&state, &user, &upload_id, params, body).await?;
    Ok((StatusCode::CREATED, Json(part)))
}

/// `DELETE /api/uploads/{id}`.
pub async fn delete_upload(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(upload_id): Path<String>,
) -> ApiResult<StatusCode> {
    let removed = uploads::delete(&state, user.user_id, &upload_id).await?;
    tracing::debug!(user_id = user.user_id, upload_id, removed, "upload deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/uploads/stats?days=`.
pub async fn upload_stats(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<StatsParams>,
) -> ApiResult<Json<Vec<DailyUpload>>> {
    let usage = uploads::stats(&state, user.user_id, params.days.unwrap_or(7)).await?;
    Ok(Json(
        usage
            .into_iter()
            .map(|u| DailyUpload {
                day: u.day,
                total_size: u.total_size,
            })
            .collect(),
    ))
}
