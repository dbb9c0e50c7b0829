//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use sqlx::FromRow;
use sqlx::types::Json;
use teldrive_core::{
    Bot, Category, Channel, Event, EventSource, File, FileId, FileShare, FileStatus, FileType,
    Part, UploadPart,
};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Files
// =============================================================================

/// File or folder record.
#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub id: Uuid,
    pub name: String,
    #[sqlx(rename = "type")]
    pub file_type: String,
    pub mime_type: String,
    pub size: Option<i64>,
    pub category: String,
    pub encrypted: bool,
    pub user_id: i64,
    pub status: String,
    pub parent_id: Option<Uuid>,
    pub parts: Option<Json<Vec<Part>>>,
    pub channel_id: Option<i64>,
    pub hash: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl FileRow {
    /// A new active folder.
    pub fn folder(user_id: i64, name: &str, parent_id: Option<Uuid>, now: OffsetDateTime) -> Self {
        Self {
            id: FileId::new().into_uuid(),
            name: name.to_string(),
            file_type: FileType::Folder.as_str().to_string(),
            mime_type: "drive/folder".to_string(),
            size: None,
            category: Category::Other.as_str().to_string(),
            encrypted: false,
            user_id,
            status: FileStatus::Active.as_str().to_string(),
            parent_id,
            parts: None,
            channel_id: None,
            hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.file_type == FileType::Folder.as_str()
    }

    pub fn is_active(&self) -> bool {
        self.status == FileStatus::Active.as_str()
    }

    /// Part list, empty for folders.
    pub fn part_list(&self) -> &[Part] {
        self.parts.as_ref().map(|p| p.0.as_slice()).unwrap_or(&[])
    }
}

impl TryFrom<FileRow> for File {
    type Error = MetadataError;

    fn try_from(row: FileRow) -> MetadataResult<Self> {
        Ok(File {
            id: FileId::from_uuid(row.id),
            file_type: row.file_type.parse()?,
            mime_type: row.mime_type,
            category: row.category.parse()?,
            size: row.size,
            encrypted: row.encrypted,
            user_id: row.user_id,
            status: row.status.parse()?,
            parent_id: row.parent_id.map(FileId::from_uuid),
            channel_id: row.channel_id,
            parts: row.parts.map(|p| p.0).unwrap_or_default(),
            hash: row.hash,
            created_at: row.created_at,
            updated_at: row.updated_at,
            name: row.name,
        })
    }
}

impl From<&File> for FileRow {
    fn from(file: &File) -> Self {
        Self {
            id: file.id.into_uuid(),
            name: file.name.clone(),
            file_type: file.file_type.as_str().to_string(),
            mime_type: file.mime_type.clone(),
            size: file.size,
            category: file.category.as_str().to_string(),
            encrypted: file.encrypted,
            user_id: file.user_id,
            status: file.status.as_str().to_string(),
            parent_id: file.parent_id.map(FileId::into_uuid),
            parts: (!file.is_folder()).then(|| Json(file.parts.clone())),
            channel_id: file.channel_id,
            hash: file.hash.clone(),
            created_at: file.created_at,
            updated_at: file.updated_at,
        }
    }
}

/// File count and bytes per category.
#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct CategoryStats {
    pub category: String,
    pub total_files: i64,
    pub total_size: i64,
}

/// Bytes uploaded on one UTC day (`YYYY-MM-DD`).
#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct DailyUsage {
    pub day: String,
    pub total_size: i64,
}

// =============================================================================
// Uploads
// =============================================================================

/// One uploaded part of an in-progress file.
#[derive(Debug, Clone, FromRow)]
pub struct UploadRow {
    pub upload_id: String,
    pub user_id: i64,
    pub name: String,
    pub part_no: i32,
    pub part_id: i64,
    pub channel_id: i64,
    pub size: i64,
    pub encrypted: bool,
    pub salt: Option<String>,
    pub block_hashes: Vec<u8>,
    pub created_at: OffsetDateTime,
}

impl From<UploadRow> for UploadPart {
    fn from(row: UploadRow) -> Self {
        UploadPart {
            upload_id: row.upload_id,
            user_id: row.user_id,
            name: row.name,
            part_no: row.part_no,
            part_id: row.part_id,
            channel_id: row.channel_id,
            size: row.size,
            encrypted: row.encrypted,
            salt: row.salt,
            block_hashes: row.block_hashes,
            created_at: row.created_at,
        }
    }
}

impl From<&UploadPart> for UploadRow {
    fn from(part: &UploadPart) -> Self {
        UploadRow {
            upload_id: part.upload_id.clone(),
            user_id: part.user_id,
            name: part.name.clone(),
            part_no: part.part_no,
            part_id: part.part_id,
            channel_id: part.channel_id,
            size: part.size,
            encrypted: part.encrypted,
            salt: part.salt.clone(),
            block_hashes: part.block_hashes.clone(),
            created_at: part.created_at,
        }
    }
}

// =============================================================================
// Channels and bots
// =============================================================================

/// Storage channel owned by a user.
#[derive(Debug, Clone, FromRow)]
pub struct ChannelRow {
    pub channel_id: i64,
    pub channel_name: String,
    pub user_id: i64,
    pub selected: bool,
}

impl From<ChannelRow> for Channel {
    fn from(row: ChannelRow) -> Self {
        Channel {
            channel_id: row.channel_id,
            channel_name: row.channel_name,
            user_id: row.user_id,
            selected: row.selected,
        }
    }
}

/// Worker credential bound to a channel.
#[derive(Debug, Clone, FromRow)]
pub struct BotRow {
    pub token: String,
    pub user_id: i64,
    pub bot_id: i64,
    pub channel_id: i64,
}

impl From<BotRow> for Bot {
    fn from(row: BotRow) -> Self {
        Bot {
            token: row.token,
            user_id: row.user_id,
            bot_id: row.bot_id,
            channel_id: row.channel_id,
        }
    }
}

// =============================================================================
// Shares
// =============================================================================

/// Public handle to a file or folder.
#[derive(Debug, Clone, FromRow)]
pub struct ShareRow {
    pub id: Uuid,
    pub file_id: Uuid,
    pub user_id: i64,
    /// bcrypt hash.
    pub password: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl From<ShareRow> for FileShare {
    fn from(row: ShareRow) -> Self {
        FileShare {
            id: row.id,
            file_id: FileId::from_uuid(row.file_id),
            user_id: row.user_id,
            password: row.password,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// User-scoped change record.
#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub id: Uuid,
    #[sqlx(rename = "type")]
    pub event_type: String,
    pub user_id: i64,
    pub source: Json<EventSource>,
    pub created_at: OffsetDateTime,
}

impl TryFrom<EventRow> for Event {
    type Error = MetadataError;

    fn try_from(row: EventRow) -> MetadataResult<Self> {
        Ok(Event {
            id: row.id,
            event_type: row.event_type.parse()?,
            user_id: row.user_id,
            source: row.source.0,
            created_at: row.created_at,
        })
    }
}

impl From<&Event> for EventRow {
    fn from(event: &Event) -> Self {
        EventRow {
            id: event.id,
            event_type: event.event_type.as_str().to_string(),
            user_id: event.user_id,
            source: Json(event.source.clone()),
            created_at: event.created_at,
        }
    }
}

// =============================================================================
// Users and sessions
// =============================================================================

/// Account that has logged in at least once.
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub user_id: i64,
    pub user_name: String,
    pub name: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Login session. Only the SHA-256 of the bearer token is stored.
#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub session_hash: String,
    pub user_id: i64,
    /// Upstream session credential used for the user's own client.
    pub session: String,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl SessionRow {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_row_roundtrip() {
        let now = OffsetDateTime::now_utc();
        let mut row = FileRow::folder(7, "docs", None, now);
        let file = File::try_from(row.clone()).unwrap();
        assert!(file.is_folder());
        assert!(file.parts.is_empty());

        row.file_type = "file".into();
        row.parts = Some(Json(vec![Part::plain(3)]));
        row.size = Some(10);
        let file = File::try_from(row).unwrap();
        let back = FileRow::from(&file);
        assert_eq!(back.part_list(), &[Part::plain(3)]);
        assert_eq!(back.size, Some(10));
    }

    #[test]
    fn test_bad_status_is_rejected() {
        let mut row = FileRow::folder(7, "docs", None, OffsetDateTime::now_utc());
        row.status = "gone".into();
        assert!(matches!(
            File::try_from(row),
            Err(MetadataError::InvalidRow(_))
        ));
    }
}
