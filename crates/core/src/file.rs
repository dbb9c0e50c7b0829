//! File nodes, parts and category derivation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Time-ordered file identifier (UUIDv7).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(Uuid);

impl FileId {
    /// Generate a new time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidId(format!("invalid file id {s:?}: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn into_uuid(self) -> Uuid {
        self.0
    }

    /// Raw bytes, used by the ETag computation.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node type in the namespace tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Folder,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Folder => "folder",
        }
    }
}

impl FromStr for FileType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "folder" => Ok(Self::Folder),
            other => Err(crate::Error::InvalidFileType(other.to_string())),
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Visibility state of a file row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Active,
    /// Terminal: invisible to listings, awaiting the deletion worker.
    PendingDeletion,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PendingDeletion => "pending_deletion",
        }
    }
}

impl FromStr for FileStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "pending_deletion" => Ok(Self::PendingDeletion),
            other => Err(crate::Error::InvalidFileType(format!("status {other}"))),
        }
    }
}

/// Coarse content category derived from the mime type and extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Document,
    Image,
    Video,
    Audio,
    Archive,
    Other,
}

const ARCHIVE_EXTENSIONS: &[&str] = &[
    "zip", "rar", "7z", "tar", "gz", "tgz", "bz2", "xz", "zst", "iso", "dmg",
];

const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "odt", "ods", "odp", "txt", "rtf", "md",
    "csv", "epub",
];

impl Category {
    /// Derive a category from a mime type, falling back to the file extension.
    pub fn from_mime(mime_type: &str, name: &str) -> Self {
        let mime = mime_type.to_ascii_lowercase();
        if mime.starts_with("image/") {
            return Self::Image;
        }
        if mime.starts_with("video/") {
            return Self::Video;
        }
        if mime.starts_with("audio/") {
            return Self::Audio;
        }

        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if ARCHIVE_EXTENSIONS.contains(&ext.as_str())
            || mime.contains("zip")
            || mime.contains("compressed")
            || mime.contains("x-tar")
        {
            return Self::Archive;
        }
        if DOCUMENT_EXTENSIONS.contains(&ext.as_str())
            || mime.starts_with("text/")
            || mime == "application/pdf"
            || mime.contains("document")
            || mime.contains("spreadsheet")
            || mime.contains("presentation")
        {
            return Self::Document;
        }
        Self::Other
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Archive => "archive",
            Self::Other => "other",
        }
    }
}

impl FromStr for Category {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document" => Ok(Self::Document),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "archive" => Ok(Self::Archive),
            "other" => Ok(Self::Other),
            other => Err(crate::Error::InvalidFileType(format!("category {other}"))),
        }
    }
}

/// One message-attached blob of a file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    /// Message id in the file's channel.
    pub id: i64,
    /// Per-part KDF salt, present iff the file is encrypted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
}

impl Part {
    pub fn plain(id: i64) -> Self {
        Self { id, salt: None }
    }

    pub fn encrypted(id: i64, salt: impl Into<String>) -> Self {
        Self {
            id,
            salt: Some(salt.into()),
        }
    }
}

/// Check the part-list invariants for a file.
///
/// Encrypted files need a non-empty salt on every part.
pub fn validate_parts(parts: &[Part], encrypted: bool) -> crate::Result<()> {
    for part in parts {
        if part.id == 0 {
            return Err(crate::Error::InvalidParts("part id 0 is not committable".into()));
        }
        if encrypted && part.salt.as_deref().is_none_or(str::is_empty) {
            return Err(crate::Error::InvalidParts(format!(
                "part {} of an encrypted file has no salt",
                part.id
            )));
        }
    }
    Ok(())
}

/// A node in a user's namespace tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    pub id: FileId,
    pub name: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub mime_type: String,
    pub category: Category,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    pub encrypted: bool,
    pub user_id: i64,
    pub status: FileStatus,
    pub parent_id: Option<FileId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<Part>,
    pub hash: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl File {
    pub fn is_folder(&self) -> bool {
        self.file_type == FileType::Folder
    }

    pub fn size_bytes(&self) -> u64 {
        self.size.unwrap_or(0).max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_from_mime_prefix() {
        assert_eq!(Category::from_mime("image/png", "a.png"), Category::Image);
        assert_eq!(Category::from_mime("video/mp4", "a.mp4"), Category::Video);
        assert_eq!(Category::from_mime("audio/ogg", "a.ogg"), Category::Audio);
    }

    #[test]
    fn test_category_from_extension() {
        assert_eq!(
            Category::from_mime("application/octet-stream", "backup.tar.gz"),
            Category::Archive
        );
        assert_eq!(
            Category::from_mime("application/octet-stream", "notes.md"),
            Category::Document
        );
        assert_eq!(
            Category::from_mime("application/octet-stream", "blob.bin"),
            Category::Other
        );
    }

    #[test]
    fn test_file_id_is_time_ordered() {
        let a = FileId::new();
        let b = FileId::new();
        assert!(a < b);
        assert_eq!(FileId::parse(&a.to_string()).unwrap(), a);
    }

    #[test]
    fn test_validate_parts_requires_salt_when_encrypted() {
        let parts = vec![Part::plain(1)];
        assert!(validate_parts(&parts, false).is_ok());
        assert!(validate_parts(&parts, true).is_err());
        assert!(validate_parts(&[Part::encrypted(1, "s")], true).is_ok());
        assert!(validate_parts(&[Part::plain(0)], false).is_err());
    }

    #[test]
    fn test_part_json_omits_missing_salt() {
        let json = serde_json::to_string(&Part::plain(7)).unwrap();
        assert_eq!(json, r#"{"id":7}"#);
    }
}
