//! Chunk arithmetic and received-index tracking.

use crate::core::config::{MAX_CHUNK_SIZE, MAX_FILE_CHUNKS};
use crate::core::error::CallError;

/// Number of chunks a file of `size` bytes is split into. An empty file is
/// still sent as one (empty) chunk.
pub fn expected_chunk_count(size: u64, chunk_size: u32) -> u32 {
    if size == 0 || chunk_size == 0 {
        return 1;
    }
    size.div_ceil(chunk_size as u64).min(u32::MAX as u64) as u32
}

/// Reject a chunk size or chunk count outside the configured bounds.
pub fn check_bounds(size: u64, chunk_size: u32) -> Result<u32, CallError> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(CallError::Protocol(format!(
            "chunk size {chunk_size} outside 1..={MAX_CHUNK_SIZE}"
        )));
    }
    if size.div_ceil(chunk_size as u64) > MAX_FILE_CHUNKS as u64 {
        return Err(CallError::Protocol(format!(
            "{size} bytes in {chunk_size}-byte chunks exceeds {MAX_FILE_CHUNKS} chunks"
        )));
    }
    Ok(expected_chunk_count(size, chunk_size))
}

/// Byte range `[offset, offset + len)` of chunk `index`.
pub fn chunk_range(index: u32, size: u64, chunk_size: u32) -> (u64, usize) {
    let offset = index as u64 * chunk_size as u64;
    let len = size.saturating_sub(offset).min(chunk_size as u64) as usize;
    (offset, len)
}

/// Whether the chunk starting at `offset` with `len` bytes ends the file.
pub fn is_last(offset: u64, len: usize, size: u64) -> bool {
    offset + len as u64 >= size
}

/// Send progress in whole percent.
pub fn progress_percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((sent as f64 / total as f64) * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Bitmap of chunk indices seen for one inbound transfer, so a re-sent pair
/// does not count its bytes twice.
#[derive(Debug, Clone)]
pub struct ChunkBitmap {
    total_chunks: u32,
    bits: Vec<u64>,
}

impl ChunkBitmap {
    pub fn new(total_chunks: u32) -> Self {
        let words = (total_chunks as usize).div_ceil(64);
        Self {
            total_chunks,
            bits: vec![0u64; words],
        }
    }

    /// Mark `index`. Returns `true` if it was not set before. Out-of-range
    /// indices are never recorded.
    pub fn set(&mut self, index: u32) -> bool {
        if index >= self.total_chunks {
            return false;
        }
        let word = (index / 64) as usize;
        let mask = 1u64 << (index % 64);
        let fresh = self.bits[word] & mask == 0;
        self.bits[word] |= mask;
        fresh
    }

    #[cfg(test)]
    pub fn is_set(&self, index: u32) -> bool {
        if index >= self.total_chunks {
            return false;
        }
        (self.bits[(index / 64) as usize] >> (index % 64)) & 1 == 1
    }

    #[cfg(test)]
    pub fn received_count(&self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }

    #[cfg(test)]
    pub fn total(&self) -> u32 {
        self.total_chunks
    }
}
