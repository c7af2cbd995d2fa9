//! # swarmsync files
//!
//! File-level building blocks for the swarmsync transfer engine.
//!
//! This crate provides:
//! - Byte range sets for tracking filled and in-flight regions of a file
//! - Out-of-order range reassembly into a temp file
//! - Range reads for uploads (in-memory, positioned, or sequential)
//! - Parts records: rolling checksum + BLAKE3 per block, and block matching
//!   for resuming partial downloads

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunker;
pub mod parts;
pub mod ranges;
pub mod reader;

pub use chunker::RangeReassembler;
pub use parts::{BlockMatch, FilePartsRecord, PartInfo, PartsMatcher, RollingChecksum};
pub use ranges::RangeSet;
pub use reader::RangeReader;

/// Default part size requested from a single source (64 KiB).
pub const DEFAULT_PART_SIZE: usize = 64 * 1024;

/// Smallest block size used for a parts record (4 KiB).
pub const MIN_RECORD_BLOCK_SIZE: usize = 4 * 1024;

/// Largest block size used for a parts record (1 MiB).
pub const MAX_RECORD_BLOCK_SIZE: usize = 1024 * 1024;

/// Pick the parts-record block size for a file.
///
/// Aims for roughly 1024 blocks per file, rounded to a power of two and
/// clamped to [`MIN_RECORD_BLOCK_SIZE`, `MAX_RECORD_BLOCK_SIZE`].
#[must_use]
pub fn record_block_size(file_size: u64) -> usize {
    let target = (file_size / 1024).max(1);
    let rounded = target.next_power_of_two();
    (rounded as usize).clamp(MIN_RECORD_BLOCK_SIZE, MAX_RECORD_BLOCK_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_block_size_bounds() {
        assert_eq!(record_block_size(0), MIN_RECORD_BLOCK_SIZE);
        assert_eq!(record_block_size(1024), MIN_RECORD_BLOCK_SIZE);
        assert_eq!(record_block_size(64 * 1024 * 1024), 64 * 1024);
        assert_eq!(record_block_size(u64::MAX / 2), MAX_RECORD_BLOCK_SIZE);
    }
}
