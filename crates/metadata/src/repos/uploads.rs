//! Upload part repository.

use crate::error::MetadataResult;
use crate::models::UploadRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for in-progress upload parts.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Store a part. A repeated `(upload_id, part_no)` replaces the earlier row.
    async fn create_part(&self, part: &UploadRow) -> MetadataResult<()>;

    /// Parts of an upload in `part_no` order, hiding rows created before
    /// `not_before`.
    async fn get_parts(
        &self,
        upload_id: &str,
        user_id: i64,
        not_before: OffsetDateTime,
    ) -> MetadataResult<Vec<UploadRow>>;

    /// Remove every row of an upload. The messages are left for the cron.
    async fn delete_upload(&self, upload_id: &str, user_id: i64) -> MetadataResult<u64>;

    /// Parts created before `cutoff`.
    async fn expired_parts(&self, cutoff: OffsetDateTime) -> MetadataResult<Vec<UploadRow>>;

    /// Remove rows pointing at the given messages of a channel.
    async fn delete_parts_by_message(
        &self,
        channel_id: i64,
        part_ids: &[i64],
    ) -> MetadataResult<u64>;

    /// Message ids referenced by upload rows in a channel.
    async fn channel_upload_messages(&self, channel_id: i64) -> MetadataResult<Vec<i64>>;
}
