//! Login, logout and session handlers.
//!
//! A login presents an upstream session string. The server verifies it
//! through the connector, records the user, and hands back an opaque token
//! whose SHA-256 keys the stored session.

use crate::auth::{
    AuthenticatedUser, SESSION_COOKIE, generate_token, hash_token, session_cookie,
};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use teldrive_metadata::models::{ChannelRow, SessionRow, UserRow};
use teldrive_upstream::{Credential, UpstreamClient};
use time::OffsetDateTime;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub session: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub user_id: i64,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub user_id: i64,
    pub name: String,
    pub user_name: String,
    pub hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// Messages of the interactive login socket.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsMessage {
    Login { session: String },
    Auth { token: String },
    Error { message: String },
}

/// Give a first-time user a storage channel.
async fn ensure_channel(state: &AppState, user_id: i64, client: &dyn UpstreamClient) {
    match state.metadata.list_channels(user_id).await {
        Ok(channels) if !channels.is_empty() => return,
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(user_id, error = %e, "failed to list channels on login");
            return;
        }
    }
    let title = "teldrive storage 1".to_string();
    let created = match client.create_channel(&title).await {
        Ok(channel_id) => channel_id,
        Err(e) => {
            tracing::warn!(user_id, error = %e, "failed to create the first storage channel");
            return;
        }
    };
    let channel = ChannelRow {
        channel_id: created,
        channel_name: title,
        user_id,
        selected: true,
    };
    if let Err(e) = state.channels.select(&channel).await {
        tracing::warn!(user_id, channel_id = created, error = %e, "failed to select the first channel");
    }
}

/// Verify an upstream session and open a teldrive session for it.
pub async fn login(state: &AppState, session: &str) -> ApiResult<LoginResponse> {
    if session.is_empty() {
        return Err(ApiError::InvalidRequest("session is required".to_string()));
    }
    let client = state
        .connector
        .connect(0, &Credential::Session(session.to_string()))
        .await?;
    let identity = client
        .self_info()
        .await
        .map_err(|e| ApiError::Unauthorized(format!("upstream rejected the session: {e}")))?;
    if identity.is_bot {
        return Err(ApiError::Forbidden("bots cannot log in".to_string()));
    }
    if !state.config.server.is_allowed(identity.user_id) {
        return Err(ApiError::Forbidden(format!(
            "user {} is not allowed",
            identity.user_id
        )));
    }

    let now = OffsetDateTime::now_utc();
    let existing = state.metadata.get_user(identity.user_id).await?;
    state
        .metadata
        .upsert_user(&UserRow {
            user_id: identity.user_id,
            user_name: identity.name.clone(),
            name: identity.name.clone(),
            created_at: existing.map(|u| u.created_at).unwrap_or(now),
            updated_at: now,
        })
        .await?;

    let token = generate_token();
    let expires_at = now + state.config.server.session_ttl();
    state
        .metadata
        .create_session(&SessionRow {
            session_hash: hash_token(&token),
            user_id: identity.user_id,
            session: session.to_string(),
            created_at: now,
            expires_at,
        })
        .await?;
    ensure_channel(state, identity.user_id, client.as_ref()).await;
    tracing::info!(user_id = identity.user_id, "user logged in");

    Ok(LoginResponse {
        token,
        user_id: identity.user_id,
        name: identity.name,
        expires_at,
    })
}

fn with_cookie(mut response: Response, cookie: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

/// `POST /api/auth/login`.
pub async fn login_handler(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Response> {
    let response = login(&state, &req.session).await?;
    let cookie = session_cookie(
        &response.token,
        state.config.server.session_ttl().whole_seconds(),
        state.config.server.cookie_secure,
    );
    Ok(with_cookie(Json(response).into_response(), &cookie))
}

/// `POST /api/auth/logout`.
pub async fn logout_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Response> {
    state.metadata.delete_session(&user.session_hash).await?;
    tracing::info!(user_id = user.user_id, "user logged out");
    let cookie = format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    Ok(with_cookie(StatusCode::NO_CONTENT.into_response(), &cookie))
}

/// `GET /api/auth/session`. No content without a session.
pub async fn session_handler(
    State(state): State<AppState>,
    user: Option<AuthenticatedUser>,
) -> ApiResult<Response> {
    let Some(user) = user else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    let (name, user_name) = match state.metadata.get_user(user.user_id).await? {
        Some(row) => (row.name, row.user_name),
        None => (String::new(), String::new()),
    };
    Ok(Json(SessionResponse {
        user_id: user.user_id,
        name,
        user_name,
        hash: user.session_hash,
        expires_at: user.expires_at,
    })
    .into_response())
}

/// `GET /api/auth/ws`: interactive login over a WebSocket.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| login_socket(state, socket))
}

async fn reply(socket: &mut WebSocket, message: &WsMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode socket reply");
            false
        }
    }
}

async fn login_socket(state: AppState, mut socket: WebSocket) {
    while let Some(message) = socket.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let answer = match serde_json::from_str::<WsMessage>(text.as_str()) {
            Ok(WsMessage::Login { session }) => match login(&state, &session).await {
                Ok(login) => WsMessage::Auth { token: login.token },
                Err(e) => WsMessage::Error {
                    message: e.to_string(),
                },
            },
            Ok(_) => WsMessage::Error {
                message: "expected a login message".to_string(),
            },
            Err(e) => WsMessage::Error {
                message: format!("malformed message: {e}"),
            },
        };
        let done = matches!(answer, WsMessage::Auth { .. });
        if !reply(&mut socket, &answer).await || done {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::TestContext;
    use teldrive_core::config::AppConfig;

    #[test]
    fn test_ws_message_shape() {
        let msg: WsMessage = serde_json::from_str(r#"{"type":"login","session":"1:s"}"#).unwrap();
        assert!(matches!(msg, WsMessage::Login { ref session } if session == "1:s"));
        let out = serde_json::to_value(WsMessage::Auth { token: "t".into() }).unwrap();
        assert_eq!(out["type"], "auth");
        assert_eq!(out["token"], "t");
    }

    #[tokio::test]
    async fn test_login_creates_session_and_channel() {
        let ctx = TestContext::new(AppConfig::for_testing()).await;
        let first = login(&ctx.state, "42:secret").await.unwrap();
        assert_eq!(first.user_id, 42);

        let session = ctx
            .state
            .metadata
            .get_session(&hash_token(&first.token))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.session, "42:secret");
        assert!(ctx.state.channels.current_channel(42).await.is_ok());

        // A second login keeps the single channel.
        login(&ctx.state, "42:secret").await.unwrap();
        assert_eq!(ctx.state.metadata.list_channels(42).await.unwrap().len(), 1);
        assert_eq!(ctx.network.created_channels(), 1);
    }

    #[tokio::test]
    async fn test_login_rejects_bots_and_disallowed_users() {
        let mut config = AppConfig::for_testing();
        config.server.allowed_users = vec![1];
        let ctx = TestContext::new(config).await;
        assert_eq!(login(&ctx.state, "2:secret").await.unwrap_err().code(), "forbidden");
        assert!(login(&ctx.state, "garbage").await.is_err());
    }
}
