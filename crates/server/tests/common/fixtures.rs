//! Test fixtures for generating test data.

use bytes::Bytes;
use teldrive_core::TreeHash;
use teldrive_core::hash::block_hashes;
use teldrive_metadata::models::{FileRow, UploadRow};
use time::OffsetDateTime;
use uuid::Uuid;

/// Generate deterministic test data based on a seed.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Tree hash of a buffer uploaded as a single part, as hex.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub fn tree_hash_hex(data: &[u8]) -> String {
    if data.is_empty() {
        return TreeHash::empty().to_hex();
    }
    let hashes = block_hashes(data);
    TreeHash::from_block_hashes([hashes.as_slice()])
        .expect("block hashes are whole digests")
        .to_hex()
}

/// An active file row with one part per message id.
#[allow(dead_code)]
pub fn file_row(user_id: i64, name: &str, parent_id: Option<Uuid>, channel_id: i64, parts: &[i64]) -> FileRow {
    let now = OffsetDateTime::now_utc();
    let mut row = FileRow::folder(user_id, name, parent_id, now);
    row.file_type = "file".to_string();
    row.mime_type = "application/octet-stream".to_string();
    row.category = "other".to_string();
    row.size = Some(parts.len() as i64 * 10);
    row.channel_id = Some(channel_id);
    row.parts = Some(sqlx::types::Json(
        parts.iter().map(|id| teldrive_core::Part::plain(*id)).collect(),
    ));
    row
}

/// One upload part row pointing at `part_id` with a single block hash.
#[allow(dead_code)]
pub fn upload_row(upload_id: &str, user_id: i64, part_no: i32, part_id: i64, channel_id: i64) -> UploadRow {
    UploadRow {
        upload_id: upload_id.to_string(),
        user_id,
        name: "upload.bin".to_string(),
        part_no,
        part_id,
        channel_id,
        size: 10,
        encrypted: false,
        salt: None,
        block_hashes: vec![part_no as u8; 32],
        created_at: OffsetDateTime::now_utc(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_bytes_deterministic() {
        let a = seeded_bytes(42, 100);
        let b = seeded_bytes(42, 100);
        assert_eq!(a, b);

        let c = seeded_bytes(43, 100);
        assert_ne!(a, c);
    }

    #[test]
    fn test_file_row_is_a_file() {
        let row = file_row(1, "a.bin", None, 5, &[1, 2]);
        assert!(!row.is_folder());
        assert_eq!(row.part_list().len(), 2);
    }
}
