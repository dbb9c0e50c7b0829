//! Per-user account handlers: usage stats, bots, channels and profile.

use crate::auth::AuthenticatedUser;
use crate::error::{ApiError, ApiResult};
use crate::services::channels::promote_bots;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use teldrive_core::channel::bot_id_from_token;
use teldrive_core::{Bot, Channel};
use teldrive_metadata::models::{BotRow, ChannelRow};
use teldrive_upstream::{Credential, UpstreamError};

const VERIFY_CONCURRENCY: usize = 4;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryUsage {
    pub category: String,
    pub total_files: i64,
    pub total_size: i64,
}

#[derive(Debug, Deserialize)]
pub struct AddBotsRequest {
    pub bots: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddBotsResponse {
    pub added: Vec<Bot>,
    /// Ids of bots that were valid but could not be made channel admins.
    pub failed: Vec<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateChannel {
    pub channel_id: i64,
    pub channel_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProfileParams {
    pub photo: Option<u8>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_id: i64,
    pub name: String,
    pub user_name: String,
}

/// `GET /api/users/stats`.
pub async fn stats(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<Vec<CategoryUsage>>> {
    let stats = state.metadata.category_stats(user.user_id).await?;
    Ok(Json(
        stats
            .into_iter()
            .map(|s| CategoryUsage {
                category: s.category,
                total_files: s.total_files,
                total_size: s.total_size,
            })
            .collect(),
    ))
}

/// `GET /api/users/bots`: bots of the selected channel.
pub async fn list_bots(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<Vec<Bot>>> {
    let channel_id = state.channels.current_channel(user.user_id).await?;
    let bots = state.metadata.list_bots(user.user_id, channel_id).await?;
    Ok(Json(bots.into_iter().map(Bot::from).collect()))
}

/// Resolve a bot token to its account, refusing anything but a bot.
async fn verify_bot(
    state: &AppState,
    user_id: i64,
    channel_id: i64,
    token: String,
) -> ApiResult<BotRow> {
    let credential = Credential::Bot(token.clone());
    let rejected = |e: UpstreamError| ApiError::InvalidRequest(format!("bot token rejected: {e}"));
    let client = state
        .connector
        .connect(user_id, &credential)
        .await
        .map_err(rejected)?;
    let identity = client.self_info().await.map_err(rejected)?;
    if !identity.is_bot {
        return Err(ApiError::InvalidRequest(format!(
            "account {} is not a bot",
            identity.user_id
        )));
    }
    Ok(BotRow {
        token,
        user_id,
        bot_id: identity.user_id,
        channel_id,
    })
}

/// `POST /api/users/bots`.
///
/// Every token is checked against the upstream, then promoted to admin of
/// the selected channel. Only promoted bots are stored.
pub async fn add_bots(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(req): Json<AddBotsRequest>,
) -> ApiResult<(StatusCode, Json<AddBotsResponse>)> {
    if req.bots.is_empty() {
        return Err(ApiError::InvalidRequest("bots must not be empty".to_string()));
    }
    for token in &req.bots {
        if bot_id_from_token(token).is_none() {
            return Err(ApiError::InvalidRequest(format!(
                "malformed bot token for {}",
                token.split(':').next().unwrap_or_default()
            )));
        }
    }
    let channel_id = state.channels.current_channel(user.user_id).await?;
    let user_id = user.user_id;

    let candidates: Vec<BotRow> = stream::iter(req.bots)
        .map(|token| verify_bot(&state, user_id, channel_id, token))
        .buffer_unordered(VERIFY_CONCURRENCY)
        .try_collect()
        .await?;

    let owner = state.user_client(user_id, Some(&user.session)).await?;
    let promoted = promote_bots(owner.as_ref(), channel_id, &candidates).await;
    let failed = candidates
        .iter()
        .filter(|c| !promoted.iter().any(|p| p.bot_id == c.bot_id))
        .map(|c| c.bot_id)
        .collect();
    if !promoted.is_empty() {
        state.metadata.add_bots(&promoted).await?;
    }
    state.invalidate_bots(user_id).await;
    tracing::info!(user_id, channel_id, added = promoted.len(), "bots added");

    Ok((
        StatusCode::CREATED,
        Json(AddBotsResponse {
            added: promoted.into_iter().map(Bot::from).collect(),
            failed,
        }),
    ))
}

/// `DELETE /api/users/bots`: forget the bots of the selected channel.
pub async fn delete_bots(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<StatusCode> {
    let channel_id = state.channels.current_channel(user.user_id).await?;
    let removed = state.metadata.delete_bots(user.user_id, channel_id).await?;
    state.invalidate_bots(user.user_id).await;
    tracing::info!(user_id = user.user_id, channel_id, removed, "bots removed");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/users/channels`.
pub async fn list_channels(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<Vec<Channel>>> {
    let channels = state.metadata.list_channels(user.user_id).await?;
    Ok(Json(channels.into_iter().map(Channel::from).collect()))
}

/// `PATCH /api/users/channels`: select the channel for new uploads.
///
/// A channel the user has not used before needs a name.
pub async fn update_channel(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(req): Json<UpdateChannel>,
) -> ApiResult<Json<Channel>> {
    let known = state
        .metadata
        .list_channels(user.user_id)
        .await?
        .into_iter()
        .find(|c| c.channel_id == req.channel_id);
    let channel_name = match (req.channel_name.filter(|n| !n.is_empty()), known) {
        (Some(name), _) => name,
        (None, Some(existing)) => existing.channel_name,
        (None, None) => {
            return Err(ApiError::InvalidRequest(format!(
                "channel {} is unknown, channelName is required",
                req.channel_id
            )));
        }
    };
    let channel = ChannelRow {
        channel_id: req.channel_id,
        channel_name,
        user_id: user.user_id,
        selected: true,
    };
    state.channels.select(&channel).await?;
    tracing::info!(user_id = user.user_id, channel_id = req.channel_id, "channel selected");
    Ok(Json(channel.into()))
}

/// `GET /api/users/profile`; `?photo=1` answers the profile photo instead.
pub async fn profile(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<ProfileParams>,
) -> ApiResult<Response> {
    if params.photo.unwrap_or(0) == 1 {
        let client = state.user_client(user.user_id, Some(&user.session)).await?;
        let photo = client
            .profile_photo()
            .await?
            .ok_or_else(|| ApiError::NotFound("profile photo".to_string()))?;
        return Ok((
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "public, max-age=86400"),
            ],
            photo,
        )
            .into_response());
    }
    let row = state
        .metadata
        .get_user(user.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("user {}", user.user_id)))?;
    Ok(Json(Profile {
        user_id: row.user_id,
        name: row.name,
        user_name: row.user_name,
    })
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::TestContext;
    use bytes::Bytes;
    use teldrive_core::config::AppConfig;

    #[tokio::test]
    async fn test_add_bots_promotes_and_stores() {
        let ctx = TestContext::new(AppConfig::for_testing()).await;
        let (user, channel_id) = ctx.user(7).await;

        let (status, Json(body)) = add_bots(
            State(ctx.state.clone()),
            user.clone(),
            Json(AddBotsRequest {
                bots: vec!["9001:a".to_string(), "9002:b".to_string()],
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body.added.len(), 2);
        assert!(body.failed.is_empty());
        assert!(ctx.network.is_admin(channel_id, 9001));

        let tokens = ctx.state.bot_tokens(7, channel_id).await.unwrap();
        assert_eq!(tokens.len(), 2);

        delete_bots(State(ctx.state.clone()), user).await.unwrap();
        assert!(ctx.state.bot_tokens(7, channel_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_bots_rejects_user_sessions() {
        let ctx = TestContext::new(AppConfig::for_testing()).await;
        let (user, _) = ctx.user(7).await;
        // Account 8 is known to the network as a user, not a bot.
        ctx.state
            .user_client(8, Some("8:session"))
            .await
            .unwrap()
            .self_info()
            .await
            .unwrap();
        let err = add_bots(
            State(ctx.state.clone()),
            user,
            Json(AddBotsRequest {
                bots: vec!["8:session".to_string()],
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[tokio::test]
    async fn test_unknown_channel_needs_a_name() {
        let ctx = TestContext::new(AppConfig::for_testing()).await;
        let (user, _) = ctx.user(7).await;
        let err = update_channel(
            State(ctx.state.clone()),
            user.clone(),
            Json(UpdateChannel {
                channel_id: 555,
                channel_name: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        let Json(channel) = update_channel(
            State(ctx.state.clone()),
            user,
            Json(UpdateChannel {
                channel_id: 555,
                channel_name: Some("archive".to_string()),
            }),
        )
        .await
        .unwrap();
        assert!(channel.selected);
        assert_eq!(ctx.state.channels.current_channel(7).await.unwrap(), 555);
    }

    #[tokio::test]
    async fn test_profile_photo() {
        let ctx = TestContext::new(AppConfig::for_testing()).await;
        let (user, _) = ctx.user(7).await;
        let err = profile(
            State(ctx.state.clone()),
            user.clone(),
            Query(ProfileParams { photo: Some(1) }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "not_found");

        ctx.network.set_profile_photo(7, Bytes::from_static(b"jpeg"));
        let response = profile(State(ctx.state.clone()), user, Query(ProfileParams { photo: Some(1) }))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
    }
}
