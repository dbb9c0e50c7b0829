//! Authentication middleware and session helpers.
//!
//! The identity collaborator is a session table: a client holds an opaque
//! token, the server stores only `sha256(token)` (the "session hash") next to
//! the user's upstream session string. Tokens arrive as a bearer header or
//! the `access_token` cookie; stream routes also accept `?hash=<session hash>`
//! so media players can fetch without custom headers.

use crate::error::{ApiError, ApiResult};
use crate::ratelimit::UserIdExtension;
use crate::state::AppState;
use axum::extract::{FromRequestParts, OptionalFromRequestParts, Request, State};
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::convert::Infallible;
use teldrive_metadata::models::SessionRow;
use time::OffsetDateTime;
use tracing::Instrument;
use uuid::Uuid;

/// Maximum length for trace IDs.
/// Longer trace IDs are truncated to prevent log bloat and potential log injection.
const MAX_TRACE_ID_LEN: usize = 128;

/// Cookie carrying the session token.
pub const SESSION_COOKIE: &str = "access_token";

/// Trace ID for request correlation.
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

impl TraceId {
    /// Generate a new random trace ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a trace ID from a client-provided value.
    /// The value is truncated to MAX_TRACE_ID_LEN characters and non-printable characters removed.
    pub fn from_client(value: &str) -> Self {
        let sanitized: String = value
            .chars()
            .take(MAX_TRACE_ID_LEN)
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect();

        if sanitized.is_empty() {
            Self::new()
        } else {
            Self(sanitized)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Verified caller identity.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub user_id: i64,
    pub session_hash: String,
    /// The user's upstream session credential.
    pub session: String,
    pub expires_at: OffsetDateTime,
}

impl<S: Send + Sync> FromRequestParts<S> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .cloned()
            .ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))
    }
}

impl<S: Send + Sync> OptionalFromRequestParts<S> for AuthenticatedUser {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<AuthenticatedUser>().cloned())
    }
}

/// Extract bearer token from Authorization header.
/// Per RFC 6750, the "Bearer" scheme is case-insensitive.
fn extract_bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(&v[7..])
            } else {
                None
            }
        })
}

fn extract_cookie_token(req: &Request) -> Option<&str> {
    req.headers()
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// `?hash=` is honoured on stream routes only.
fn extract_hash_param(req: &Request) -> Option<String> {
    if !req.uri().path().contains("/stream/") {
        return None;
    }
    req.uri()
        .query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == "hash")
        .map(|(_, value)| value.to_string())
        .filter(|value| value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Extract trace ID from X-Trace-Id header or generate a new one.
fn extract_or_generate_trace_id(req: &Request) -> TraceId {
    req.headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(TraceId::from_client)
        .unwrap_or_else(TraceId::new)
}

/// Hash a session token for storage lookup.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Generate a fresh opaque session token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Resolve a session hash to a live session of an allowed user.
pub async fn resolve_session(state: &AppState, session_hash: &str) -> ApiResult<AuthenticatedUser> {
    let session = state
        .metadata
        .get_session(session_hash)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("unknown session".to_string()))?;
    authorize_session(state, session)
}

fn authorize_session(state: &AppState, session: SessionRow) -> ApiResult<AuthenticatedUser> {
    if session.is_expired(OffsetDateTime::now_utc()) {
        return Err(ApiError::Unauthorized("session expired".to_string()));
    }
    if !state.config.server.is_allowed(session.user_id) {
        return Err(ApiError::Forbidden(format!(
            "user {} is not allowed",
            session.user_id
        )));
    }
    Ok(AuthenticatedUser {
        user_id: session.user_id,
        session_hash: session.session_hash,
        session: session.session,
        expires_at: session.expires_at,
    })
}

/// Build the `Set-Cookie` value for a session token.
pub fn session_cookie(token: &str, max_age_secs: i64, secure: bool) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_secs}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Authentication middleware that resolves sessions and sets up trace context.
///
/// Requests without credentials pass through unauthenticated; handlers that
/// need a user extract [`AuthenticatedUser`]. A credential that is present but
/// expired or not allowed is rejected here.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let trace_id = extract_or_generate_trace_id(&req);
    let trace_id_str = trace_id.0.clone();
    req.extensions_mut().insert(trace_id);

    let session_hash = extract_bearer_token(&req)
        .or_else(|| extract_cookie_token(&req))
        .map(hash_token)
        .or_else(|| extract_hash_param(&req));

    let mut user_id = None;
    if let Some(session_hash) = session_hash {
        match state.metadata.get_session(&session_hash).await? {
            Some(session) => {
                let user = authorize_session(&state, session)?;
                user_id = Some(user.user_id);
                req.extensions_mut().insert(UserIdExtension(user.user_id));
                req.extensions_mut().insert(user);
            }
            None => {
                tracing::debug!("request carries an unknown session");
            }
        }
    }

    let span = match user_id {
        Some(user_id) => tracing::info_span!("request", trace_id = %trace_id_str, user_id),
        None => tracing::info_span!("request", trace_id = %trace_id_str),
    };
    Ok(next.run(req).instrument(span).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_trace_id_is_sanitized() {
        let id = TraceId::from_client("abc\ndef");
        assert_eq!(id.as_str(), "abcdef");
        let long = "x".repeat(500);
        assert_eq!(TraceId::from_client(&long).as_str().len(), MAX_TRACE_ID_LEN);
        assert!(!TraceId::from_client("\n\t").as_str().is_empty());
    }

    #[test]
    fn test_cookie_token_is_found_among_others() {
        let req = Request::builder()
            .header(COOKIE, "theme=dark; access_token=abc123; lang=en")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_cookie_token(&req), Some("abc123"));
    }

    #[test]
    fn test_bearer_scheme_is_case_insensitive() {
        let req = Request::builder()
            .header(AUTHORIZATION, "bEaReR tok")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&req), Some("tok"));
    }

    #[test]
    fn test_hash_param_only_on_stream_routes() {
        let hash = hash_token("t");
        let req = Request::builder()
            .uri(format!("/api/files/x/stream/a.mp4?hash={hash}"))
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_hash_param(&req), Some(hash.clone()));

        let req = Request::builder()
            .uri(format!("/api/files?hash={hash}"))
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_hash_param(&req), None);
    }

    #[test]
    fn test_session_cookie_flags() {
        let cookie = session_cookie("tok", 60, true);
        assert!(cookie.starts_with("access_token=tok;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.ends_with("; Secure"));
        assert!(!session_cookie("tok", 60, false).contains("Secure"));
    }

    #[test]
    fn test_hash_token_is_hex_sha256() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(generate_token().len(), 64);
    }
}
