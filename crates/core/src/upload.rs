//! Upload part records.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One uploaded part of an in-progress file.
///
/// Parts are grouped by a client-chosen `upload_id` and consumed atomically
/// when the file row is committed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPart {
    pub upload_id: String,
    pub user_id: i64,
    pub name: String,
    /// 1-based part number, unique within the upload.
    pub part_no: i32,
    /// Message id in the channel; 0 means not yet committable.
    pub part_id: i64,
    pub channel_id: i64,
    pub size: i64,
    pub encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    /// Concatenated 32-byte BLAKE3 digests, one per 16 MiB block.
    #[serde(with = "hex_bytes")]
    pub block_hashes: Vec<u8>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl UploadPart {
    /// A part is committable once it references a real message.
    pub fn is_committable(&self) -> bool {
        self.part_id != 0
    }

    /// Whether the part is older than the retention window.
    pub fn is_expired(&self, now: OffsetDateTime, retention: time::Duration) -> bool {
        self.created_at + retention < now
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
