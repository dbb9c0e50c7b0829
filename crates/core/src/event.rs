//! User-scoped change events.

use crate::file::FileId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Kind of namespace mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FileCreate,
    FileUpdate,
    FileDelete,
    FileMove,
    FileCopy,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileCreate => "file_create",
            Self::FileUpdate => "file_update",
            Self::FileDelete => "file_delete",
            Self::FileMove => "file_move",
            Self::FileCopy => "file_copy",
        }
    }
}

impl FromStr for EventType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_create" => Ok(Self::FileCreate),
            "file_update" => Ok(Self::FileUpdate),
            "file_delete" => Ok(Self::FileDelete),
            "file_move" => Ok(Self::FileMove),
            "file_copy" => Ok(Self::FileCopy),
            other => Err(crate::Error::InvalidEventType(other.to_string())),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The node an event refers to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    pub id: FileId,
    #[serde(rename = "type")]
    pub file_type: crate::file::FileType,
    pub name: String,
    pub parent_id: Option<FileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_parent_id: Option<FileId>,
}

/// A change record, as stored and as published.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub user_id: i64,
    pub source: EventSource,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Event {
    pub fn new(event_type: EventType, user_id: i64, source: EventSource) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type,
            user_id,
            source,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}
