//! Change event feed.

use crate::auth::AuthenticatedUser;
use crate::error::ApiResult;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use teldrive_core::Event;
use teldrive_metadata::MetadataResult;

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 500;
const KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    pub limit: Option<u32>,
}

/// `GET /api/events?limit=`: newest first.
pub async fn recent_events(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<RecentParams>,
) -> ApiResult<Json<Vec<Event>>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let rows = state
        .metadata
        .recent_events(user.user_id, i64::from(limit))
        .await?;
    let events = rows
        .into_iter()
        .map(Event::try_from)
        .collect::<MetadataResult<Vec<_>>>()?;
    Ok(Json(events))
}

/// `GET /api/events/stream`: live events as server-sent events.
///
/// The subscription ends when the client goes away and the stream is dropped.
pub async fn event_stream(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Sse<impl Stream<Item = Result<SseEvent, axum::Error>>> {
    let subscription = state.events.subscribe(user.user_id);
    tracing::debug!(user_id = user.user_id, "event stream opened");
    let stream = subscription.into_stream().map(|event| {
        SseEvent::default()
            .id(event.id.to_string())
            .event(event.event_type.as_str())
            .json_data(&event)
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::TestContext;
    use teldrive_core::config::AppConfig;
    use teldrive_core::{EventSource, EventType, FileId, FileType};

    fn source(name: &str) -> EventSource {
        EventSource {
            id: FileId::new(),
            name: name.into(),
            file_type: FileType::File,
            parent_id: None,
            dest_parent_id: None,
        }
    }

    #[tokio::test]
    async fn test_recent_events_are_scoped_to_the_user() {
        let ctx = TestContext::new(AppConfig::for_testing()).await;
        let (user, _) = ctx.user(5).await;
        ctx.state.events.record(EventType::FileCreate, 5, source("a")).await;
        ctx.state.events.record(EventType::FileCreate, 6, source("b")).await;
        ctx.state.events.shutdown().await;

        let Json(events) = recent_events(
            State(ctx.state.clone()),
            user,
            Query(RecentParams { limit: None }),
        )
        .await
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source.name, "a");
    }
}
