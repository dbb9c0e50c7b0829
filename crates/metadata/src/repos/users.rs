//! Users, sessions and shared counters.

use crate::error::MetadataResult;
use crate::models::{SessionRow, UserRow};
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for accounts and login sessions.
#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Insert or refresh a user.
    async fn upsert_user(&self, user: &UserRow) -> MetadataResult<()>;

    async fn get_user(&self, user_id: i64) -> MetadataResult<Option<UserRow>>;

    async fn list_users(&self) -> MetadataResult<Vec<UserRow>>;

    async fn create_session(&self, session: &SessionRow) -> MetadataResult<()>;

    /// Look up a session by the SHA-256 of its token.
    async fn get_session(&self, session_hash: &str) -> MetadataResult<Option<SessionRow>>;

    async fn delete_session(&self, session_hash: &str) -> MetadataResult<()>;

    /// The newest unexpired session of a user.
    async fn latest_session(
        &self,
        user_id: i64,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<SessionRow>>;

    async fn delete_expired_sessions(&self, now: OffsetDateTime) -> MetadataResult<u64>;
}

/// Monotonic named counters shared by every process on the same database.
#[async_trait]
pub trait CounterRepo: Send + Sync {
    /// Increment `key` and return the new value (first call returns 1).
    async fn next_counter(&self, key: &str) -> MetadataResult<i64>;
}
