//! Shared file handles.

use crate::file::FileId;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// A public or password-protected handle to a file or folder subtree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileShare {
    pub id: Uuid,
    pub file_id: FileId,
    pub user_id: i64,
    /// bcrypt hash; never serialised to clients.
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl FileShare {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_protected(&self) -> bool {
        self.password.is_some()
    }
}
