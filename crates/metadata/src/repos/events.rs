//! Event log repository.

use crate::error::MetadataResult;
use crate::models::EventRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for the change-event log.
#[async_trait]
pub trait EventRepo: Send + Sync {
    async fn insert_event(&self, event: &EventRow) -> MetadataResult<()>;

    /// Events of all users created after `since`, oldest first.
    async fn events_since(&self, since: OffsetDateTime, limit: i64) -> MetadataResult<Vec<EventRow>>;

    /// A user's most recent events, newest first.
    async fn recent_events(&self, user_id: i64, limit: i64) -> MetadataResult<Vec<EventRow>>;

    async fn delete_events_before(&self, cutoff: OffsetDateTime) -> MetadataResult<u64>;
}
