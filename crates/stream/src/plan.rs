//! Mapping byte windows onto parts and chunks.
//!
//! A window `[start, end]` (inclusive) over a file of uniform parts of size
//! `P` intersects part `k` at `[max(start - kP, 0), min(P - 1, end - kP)]`.
//! Within a part, reads are aligned to the fetch granularity `C`: the first
//! chunk drops `s mod C` leading bytes and the last keeps `e mod C + 1`.

use std::ops::Range;
use teldrive_core::{DEFAULT_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// Fetch granularity for reading `[start, end]` of one part.
///
/// Starts at 1 MiB and halves while larger than 1 KiB and larger than the
/// requested span.
pub fn chunk_size(start: u64, end: u64) -> u64 {
    let span = end.saturating_sub(start);
    let mut size = DEFAULT_CHUNK_SIZE;
    while size > MIN_CHUNK_SIZE && size > span {
        size /= 2;
    }
    size
}

/// The slice of one part covered by a window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartRange {
    pub part: usize,
    /// First byte within the part.
    pub start: u64,
    /// Last byte within the part (inclusive).
    pub end: u64,
}

impl PartRange {
    pub fn byte_len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Per-part sub-ranges of `[start, end]` for parts of size `part_size`.
pub fn part_ranges(part_size: u64, parts: usize, start: u64, end: u64) -> Vec<PartRange> {
    if part_size == 0 || parts == 0 || end < start {
        return Vec::new();
    }
    let first = (start / part_size) as usize;
    let last = ((end / part_size) as usize).min(parts - 1);
    (first..=last)
        .map(|k| {
            let base = k as u64 * part_size;
            PartRange {
                part: k,
                start: start.saturating_sub(base),
                end: (part_size - 1).min(end - base),
            }
        })
        .collect()
}

/// One upstream fetch and the bytes to keep from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkTask {
    pub part: usize,
    pub offset: u64,
    pub limit: u64,
    /// Bytes of the fetched chunk that belong to the window.
    pub keep: Range<usize>,
}

impl ChunkTask {
    /// Bytes this task contributes to the output.
    pub fn output_len(&self) -> u64 {
        (self.keep.end - self.keep.start) as u64
    }
}

/// Chunk fetches for one part range, given its granularity.
pub fn part_tasks(range: &PartRange, chunk: u64) -> Vec<ChunkTask> {
    let left_cut = range.start % chunk;
    let right_cut = range.end % chunk + 1;
    let first_offset = range.start - left_cut;
    let count = (range.end - first_offset) / chunk + 1;
    (0..count)
        .map(|i| {
            let keep_start = if i == 0 { left_cut } else { 0 };
            let keep_end = if i == count - 1 { right_cut } else { chunk };
            ChunkTask {
                part: range.part,
                offset: first_offset + i * chunk,
                limit: chunk,
                keep: keep_start as usize..keep_end as usize,
            }
        })
        .collect()
}

/// Total output bytes of a task list.
pub fn planned_len(tasks: &[ChunkTask]) -> u64 {
    tasks.iter().map(ChunkTask::output_len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_chunk_size_halves_for_small_spans() {
        assert_eq!(chunk_size(0, 10 * MIB), MIB);
        assert_eq!(chunk_size(0, MIB), MIB);
        assert_eq!(chunk_size(0, MIB - 1), MIB / 2);
        assert_eq!(chunk_size(100, 100), 1024);
        assert_eq!(chunk_size(0, 3000), 2048);
    }

    #[test]
    fn test_part_ranges_across_three_parts() {
        let ranges = part_ranges(MIB, 3, 1_000_000, 2_100_000);
        assert_eq!(
            ranges,
            vec![
                PartRange { part: 0, start: 1_000_000, end: MIB - 1 },
                PartRange { part: 1, start: 0, end: MIB - 1 },
                PartRange { part: 2, start: 0, end: 2_100_000 - 2 * MIB },
            ]
        );
        let total: u64 = ranges.iter().map(PartRange::byte_len).sum();
        assert_eq!(total, 1_100_001);
    }

    #[test]
    fn test_part_ranges_single_part_window() {
        let ranges = part_ranges(100, 5, 250, 260);
        assert_eq!(ranges, vec![PartRange { part: 2, start: 50, end: 60 }]);
    }

    #[test]
    fn test_part_ranges_clamps_to_last_part() {
        // Short tail part: the window cannot run past the part list.
        let ranges = part_ranges(100, 2, 150, 500);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].part, 1);
    }

    #[test]
    fn test_single_chunk_applies_both_cuts() {
        let tasks = part_tasks(&PartRange { part: 0, start: 10, end: 20 }, 1024);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].offset, 0);
        assert_eq!(tasks[0].keep, 10..21);
        assert_eq!(planned_len(&tasks), 11);
    }

    #[test]
    fn test_multi_chunk_cuts() {
        let range = PartRange { part: 1, start: 1500, end: 5000 };
        let tasks = part_tasks(&range, 1024);
        assert_eq!(tasks.first().unwrap().offset, 1024);
        assert_eq!(tasks.first().unwrap().keep, 476..1024);
        assert_eq!(tasks.last().unwrap().offset, 4096);
        assert_eq!(tasks.last().unwrap().keep, 0..905);
        assert_eq!(planned_len(&tasks), range.byte_len());
    }

    #[test]
    fn test_window_aligned_to_chunk_end() {
        let range = PartRange { part: 0, start: 0, end: 2047 };
        let tasks = part_tasks(&range, 1024);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].keep, 0..1024);
    }
}
