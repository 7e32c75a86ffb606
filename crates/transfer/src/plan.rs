//! Chunk planning: split an object into contiguous byte ranges.

use serde::{Deserialize, Serialize};

/// An inclusive byte range of the source object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub index: usize,
    pub start: u64,
    pub end_inclusive: u64,
}

impl ChunkRange {
    /// Number of bytes covered by this range.
    pub fn len(&self) -> u64 {
        self.end_inclusive - self.start + 1
    }

    /// Always `false`; ranges cover at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Splits `size` bytes into `⌈size / chunk_size⌉` contiguous ranges.
///
/// The first range starts at 0, each following range starts right after the
/// previous one ends, and the last ends at `size - 1`. An empty object yields
/// no ranges. `chunk_size` must be non-zero; callers validate it up front.
pub fn plan_chunks(size: u64, chunk_size: u64) -> Vec<ChunkRange> {
    debug_assert!(chunk_size > 0, "chunk size must be non-zero");
    if size == 0 || chunk_size == 0 {
        return Vec::new();
    }

    let count = size.div_ceil(chunk_size) as usize;
    let mut ranges = Vec::with_capacity(count);
    let mut start = 0u64;
    while start < size {
        let end_inclusive = start.saturating_add(chunk_size - 1).min(size - 1);
        ranges.push(ChunkRange {
            index: ranges.len(),
            start,
            end_inclusive,
        });
        start = end_inclusive + 1;
    }
    ranges
}
