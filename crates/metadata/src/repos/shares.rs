//! Share repository.

use crate::error::MetadataResult;
use crate::models::ShareRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for file shares.
#[async_trait]
pub trait ShareRepo: Send + Sync {
    async fn create_share(&self, share: &ShareRow) -> MetadataResult<()>;

    async fn get_share(&self, id: Uuid) -> MetadataResult<Option<ShareRow>>;

    /// Shares of one file owned by `user_id`.
    async fn shares_for_file(&self, user_id: i64, file_id: Uuid) -> MetadataResult<Vec<ShareRow>>;

    async fn update_share(
        &self,
        id: Uuid,
        password: Option<&str>,
        expires_at: Option<OffsetDateTime>,
    ) -> MetadataResult<()>;

    async fn delete_share(&self, id: Uuid) -> MetadataResult<()>;
}
