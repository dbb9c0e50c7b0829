//! File tree repository.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{CategoryStats, DailyUsage, FileRow, UploadRow};
use crate::query::FileQuery;
use async_trait::async_trait;
use sqlx::types::Json;
use teldrive_core::{Part, TreeHash};
use time::OffsetDateTime;
use uuid::Uuid;

/// The content fields of a file. They are always replaced together.
#[derive(Debug, Clone, PartialEq)]
pub struct FileContent {
    pub channel_id: i64,
    pub size: i64,
    pub parts: Vec<Part>,
    pub encrypted: bool,
    pub hash: Option<String>,
}

impl FileContent {
    /// Assemble content from a completed upload.
    ///
    /// Fails when no parts exist or any part has no message yet. The hash is
    /// the tree hash over the parts' block hashes in part order.
    pub fn from_uploads(upload_id: &str, rows: &[UploadRow]) -> MetadataResult<Self> {
        let first = rows
            .first()
            .ok_or_else(|| MetadataError::NotFound(format!("upload {upload_id}")))?;
        if let Some(row) = rows.iter().find(|r| r.part_id == 0) {
            return Err(MetadataError::Constraint(format!(
                "upload {upload_id} part {} has no message",
                row.part_no
            )));
        }
        let size = rows.iter().map(|r| r.size).sum::<i64>();
        let hash = if size == 0 {
            TreeHash::empty()
        } else {
            TreeHash::from_block_hashes(rows.iter().map(|r| r.block_hashes.as_slice()))?
        };
        let parts = rows
            .iter()
            .map(|r| Part {
                id: r.part_id,
                salt: r.salt.clone(),
            })
            .collect();
        Ok(Self {
            channel_id: first.channel_id,
            size,
            parts,
            encrypted: first.encrypted,
            hash: Some(hash.to_hex()),
        })
    }

    /// Write the content into a row.
    pub fn apply(self, row: &mut FileRow) {
        row.channel_id = Some(self.channel_id);
        row.size = Some(self.size);
        row.parts = Some(Json(self.parts));
        row.encrypted = self.encrypted;
        row.hash = self.hash;
    }
}

/// Where file content comes from on create/update.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentSource {
    /// Keep what the row carries.
    Row,
    /// Replace with an explicit part list.
    Parts(FileContent),
    /// Consume the parts of an upload.
    Upload(String),
}

/// Partial update of one file.
#[derive(Debug, Clone)]
pub struct FileUpdate {
    pub name: Option<String>,
    pub parent_id: Option<Option<Uuid>>,
    pub content: ContentSource,
    pub updated_at: OffsetDateTime,
}

/// A row created to hold replaced content until its messages are purged.
///
/// Only parts that `replacement` no longer references are kept; message
/// ids are per channel, so a channel change drops them all.
pub fn tombstone(previous: &FileRow, replacement: &FileRow, now: OffsetDateTime) -> Option<FileRow> {
    if previous.is_folder() {
        return None;
    }
    let same_channel = previous.channel_id == replacement.channel_id;
    let dropped: Vec<Part> = previous
        .part_list()
        .iter()
        .filter(|p| !same_channel || !replacement.part_list().iter().any(|k| k.id == p.id))
        .cloned()
        .collect();
    if dropped.is_empty() {
        return None;
    }
    let mut row = previous.clone();
    row.id = Uuid::now_v7();
    row.status = "pending_deletion".to_string();
    row.parts = Some(Json(dropped));
    row.updated_at = now;
    Some(row)
}

/// Repository for the file tree.
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Get a file by id, whatever its status.
    async fn get_file(&self, id: Uuid) -> MetadataResult<Option<FileRow>>;

    /// Get the active entry `name` under `parent_id`.
    async fn find_child(
        &self,
        user_id: i64,
        parent_id: Option<Uuid>,
        name: &str,
    ) -> MetadataResult<Option<FileRow>>;

    /// Insert, or replace the content of the active entry with the same
    /// `(name, parent, user)`, in one transaction.
    ///
    /// With [`ContentSource::Upload`] the upload's parts are loaded, checked
    /// and deleted in the same transaction. Replaced parts move to a
    /// `pending_deletion` row. Returns the stored row, whose id is the
    /// existing one on replace. A file/folder type clash is a constraint
    /// violation; re-creating a folder returns the existing folder.
    async fn upsert_file(&self, row: &FileRow, content: ContentSource) -> MetadataResult<FileRow>;

    /// Insert a new entry. An active entry with the same
    /// `(name, parent, user)` is [`MetadataError::AlreadyExists`].
    async fn insert_file(&self, row: &FileRow, content: ContentSource) -> MetadataResult<FileRow>;

    /// Apply a partial update in one transaction.
    async fn update_file(&self, id: Uuid, update: &FileUpdate) -> MetadataResult<FileRow>;

    /// One page of a listing plus the total match count.
    async fn list_files(&self, query: &FileQuery) -> MetadataResult<(Vec<FileRow>, i64)>;

    /// Mark the given files and every file below the given folders
    /// `pending_deletion`, and remove the folders. Returns affected rows.
    async fn delete_files(&self, user_id: i64, ids: &[Uuid]) -> MetadataResult<u64>;

    /// Move (and optionally rename) an entry.
    ///
    /// A folder moved onto a folder of the same name absorbs the
    /// destination's children that do not collide and the destination is
    /// removed; any other collision replaces the existing entry. Moving a
    /// folder below itself is a constraint violation.
    async fn move_file(
        &self,
        user_id: i64,
        id: Uuid,
        parent_id: Option<Uuid>,
        name: &str,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<FileRow>;

    /// The entry and its ancestors, nearest first.
    async fn ancestors(&self, id: Uuid) -> MetadataResult<Vec<FileRow>>;

    /// Files awaiting purge, oldest first.
    async fn pending_deletions(&self, limit: i64) -> MetadataResult<Vec<FileRow>>;

    /// Hard-delete rows by id.
    async fn purge_files(&self, ids: &[Uuid]) -> MetadataResult<u64>;

    /// All files (any status) stored in a channel.
    async fn channel_files(&self, user_id: i64, channel_id: i64) -> MetadataResult<Vec<FileRow>>;

    /// Per-category totals of active files.
    async fn category_stats(&self, user_id: i64) -> MetadataResult<Vec<CategoryStats>>;

    /// Bytes of files created per day since `since`.
    async fn daily_usage(
        &self,
        user_id: i64,
        since: OffsetDateTime,
    ) -> MetadataResult<Vec<DailyUsage>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(part_no: i32, part_id: i64, hashes: Vec<u8>) -> UploadRow {
        UploadRow {
            upload_id: "u".into(),
            user_id: 1,
            name: "f".into(),
            part_no,
            part_id,
            channel_id: 9,
            size: 10,
            encrypted: false,
            salt: None,
            block_hashes: hashes,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_content_from_uploads_hashes_in_order() {
        let rows = vec![upload(1, 11, vec![1; 32]), upload(2, 12, vec![2; 32])];
        let content = FileContent::from_uploads("u", &rows).unwrap();
        let expected =
            TreeHash::from_block_hashes([&[1u8; 32][..], &[2u8; 32][..]]).unwrap();
        assert_eq!(content.hash, Some(expected.to_hex()));
        assert_eq!(content.size, 20);
        assert_eq!(content.parts, vec![Part::plain(11), Part::plain(12)]);
        assert_eq!(content.channel_id, 9);
    }

    #[test]
    fn test_uncommitted_part_blocks_commit() {
        let rows = vec![upload(1, 11, vec![1; 32]), upload(2, 0, vec![2; 32])];
        assert!(matches!(
            FileContent::from_uploads("u", &rows),
            Err(MetadataError::Constraint(_))
        ));
        assert!(matches!(
            FileContent::from_uploads("u", &[]),
            Err(MetadataError::NotFound(_))
        ));
    }

    #[test]
    fn test_tombstone_only_for_files_with_parts() {
        let now = OffsetDateTime::now_utc();
        let folder = FileRow::folder(1, "d", None, now);
        assert!(tombstone(&folder, now).is_none());

        let mut file = folder.clone();
        file.file_type = "file".into();
        file.parts = Some(Json(vec![Part::plain(4)]));
        let t = tombstone(&file, now).unwrap();
        assert_ne!(t.id, file.id);
        assert_eq!(t.status, "pending_deletion");
        assert_eq!(t.part_list(), file.part_list());
    }
}
