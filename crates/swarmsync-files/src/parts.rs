//! Parts records for resuming partial downloads.
//!
//! A [`FilePartsRecord`] describes one version of a file as a sequence of
//! fixed-size blocks, each with a weak rolling checksum (Adler-32) and a
//! strong BLAKE3 digest. A downloader that already holds an older or partial
//! copy runs a [`PartsMatcher`] over it to find blocks it does not need to
//! transfer again, wherever they sit in the local copy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::ops::Range;
use std::path::Path;
use tracing::debug;

use crate::{MAX_RECORD_BLOCK_SIZE, MIN_RECORD_BLOCK_SIZE};

const MOD_ADLER: u32 = 65521;

/// Checksums of one block of the file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    /// Block index
    pub index: u64,
    /// Weak rolling checksum (Adler-32)
    pub weak: u32,
    /// Strong hash (BLAKE3)
    pub strong: [u8; 32],
}

/// Block checksums of one file version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePartsRecord {
    /// Block size used for this record
    pub block_size: usize,
    /// Total file size
    pub file_size: u64,
    /// File-level BLAKE3 hash
    pub file_hash: [u8; 32],
    /// Per-block checksums, ordered by index
    pub parts: Vec<PartInfo>,
}

impl FilePartsRecord {
    /// Compute the record of the file at `path`
    ///
    /// `progress` is called with a value between 0.0 and 1.0 after every block.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, or `InvalidInput` for a
    /// zero block size.
    pub fn compute<P, F>(path: P, block_size: usize, mut progress: F) -> io::Result<Self>
    where
        P: AsRef<Path>,
        F: FnMut(f64),
    {
        if block_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Block size must be non-zero",
            ));
        }

        let mut file = File::open(path.as_ref())?;
        let file_size = file.metadata()?.len();
        let mut file_hasher = blake3::Hasher::new();
        let mut parts = Vec::with_capacity(file_size.div_ceil(block_size as u64) as usize);
        let mut buffer = vec![0u8; block_size];
        let mut offset = 0u64;

        loop {
            let bytes_read = read_full(&mut file, &mut buffer)?;
            if bytes_read == 0 {
                break;
            }

            let block = &buffer[..bytes_read];
            file_hasher.update(block);
            parts.push(PartInfo {
                index: parts.len() as u64,
                weak: rolling_checksum(block),
                strong: *blake3::hash(block).as_bytes(),
            });

            offset += bytes_read as u64;
            if file_size > 0 {
                progress(offset as f64 / file_size as f64);
            }
        }
        progress(1.0);

        debug!(
            "Computed parts record for {}: {} blocks of {} bytes",
            path.as_ref().display(),
            parts.len(),
            block_size
        );

        Ok(Self {
            block_size,
            file_size: offset,
            file_hash: *file_hasher.finalize().as_bytes(),
            parts,
        })
    }

    /// Byte range covered by block `index`
    #[must_use]
    pub fn block_range(&self, index: u64) -> Range<u64> {
        let start = index.saturating_mul(self.block_size as u64).min(self.file_size);
        let end = start.saturating_add(self.block_size as u64).min(self.file_size);
        start..end
    }

    /// Length of block `index` (the last block may be short)
    #[must_use]
    pub fn block_len(&self, index: u64) -> usize {
        let range = self.block_range(index);
        (range.end - range.start) as usize
    }

    /// Check that a record received from a peer is self-consistent
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if the block size lies outside
    /// [`MIN_RECORD_BLOCK_SIZE`, `MAX_RECORD_BLOCK_SIZE`], or if the parts do
    /// not cover `file_size` with one entry per block in index order.
    pub fn validate(&self) -> io::Result<()> {
        check_block_size(self.block_size)?;

        let expected = self.file_size.div_ceil(self.block_size as u64);
        if self.parts.len() as u64 != expected {
            return Err(invalid_record(format!(
                "{} parts for {} bytes in blocks of {}, expected {}",
                self.parts.len(),
                self.file_size,
                self.block_size,
                expected
            )));
        }
        if let Some((position, part)) = self
            .parts
            .iter()
            .enumerate()
            .find(|(position, part)| part.index != *position as u64)
        {
            return Err(invalid_record(format!(
                "part {} carries index {}",
                position, part.index
            )));
        }
        Ok(())
    }
}

fn check_block_size(block_size: usize) -> io::Result<()> {
    if (MIN_RECORD_BLOCK_SIZE..=MAX_RECORD_BLOCK_SIZE).contains(&block_size) {
        Ok(())
    } else {
        Err(invalid_record(format!(
            "block size {} outside {}..={}",
            block_size, MIN_RECORD_BLOCK_SIZE, MAX_RECORD_BLOCK_SIZE
        )))
    }
}

fn invalid_record(detail: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("Invalid parts record: {}", detail))
}

/// A block of the record found in a local file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMatch {
    /// Block index in the record
    pub index: u64,
    /// Offset of identical bytes in the local file
    pub local_offset: u64,
}

/// Finds record blocks inside a local file using the rolling checksum
pub struct PartsMatcher<'a> {
    record: &'a FilePartsRecord,
    by_weak: HashMap<u32, Vec<usize>>,
}

impl<'a> PartsMatcher<'a> {
    /// Index a record for lookups
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if the record fails [`FilePartsRecord::validate`].
    pub fn new(record: &'a FilePartsRecord) -> io::Result<Self> {
        record.validate()?;
        let mut by_weak: HashMap<u32, Vec<usize>> = HashMap::new();
        for (position, part) in record.parts.iter().enumerate() {
            by_weak.entry(part.weak).or_default().push(position);
        }
        Ok(Self { record, by_weak })
    }

    /// Scan `path` and return every record block found in it
    ///
    /// Blocks are matched at any byte offset, so data that moved inside the
    /// file is still found. Each record block is reported at most once.
    ///
    /// # Errors
    ///
    /// Returns an error if the local file cannot be read, or `InvalidData` for
    /// a block size outside the record bounds.
    pub fn find_matches<P: AsRef<Path>>(&self, path: P) -> io::Result<Vec<BlockMatch>> {
        let block = self.record.block_size;
        check_block_size(block)?;
        let mut matches = Vec::new();
        if self.record.parts.is_empty() {
            return Ok(matches);
        }

        let mut file = File::open(path.as_ref())?;
        let mut matched = vec![false; self.record.parts.len()];
        let mut chunk = vec![0u8; block * 4];
        let mut buf: Vec<u8> = Vec::with_capacity(block * 8);
        let mut base = 0u64;
        let mut pos = 0usize;
        let mut eof = false;
        let mut rolling: Option<RollingChecksum> = None;

        loop {
            // Keep at least one byte beyond the window so it can roll
            if !eof && buf.len() - pos <= block {
                buf.drain(..pos);
                base += pos as u64;
                pos = 0;
                let n = file.read(&mut chunk)?;
                if n == 0 {
                    eof = true;
                } else {
                    buf.extend_from_slice(&chunk[..n]);
                }
                continue;
            }

            let available = buf.len() - pos;
            if available < block {
                // Only a short final block can still match
                if available > 0 {
                    let tail = &buf[pos..];
                    let found = self.lookup(rolling_checksum(tail), tail, &matched);
                    for index in found {
                        matched[index] = true;
                        matches.push(BlockMatch {
                            index: index as u64,
                            local_offset: base + pos as u64,
                        });
                    }
                }
                break;
            }

            let window = &buf[pos..pos + block];
            let weak = match &rolling {
                Some(r) => r.get(),
                None => {
                    let r = RollingChecksum::new(window);
                    let weak = r.get();
                    rolling = Some(r);
                    weak
                }
            };

            let found = self.lookup(weak, window, &matched);
            if !found.is_empty() {
                for index in found {
                    matched[index] = true;
                    matches.push(BlockMatch {
                        index: index as u64,
                        local_offset: base + pos as u64,
                    });
                }
                pos += block;
                rolling = None;
                continue;
            }

            if available > block {
                if let Some(r) = rolling.as_mut() {
                    r.roll(buf[pos], buf[pos + block]);
                }
                pos += 1;
            } else {
                break;
            }
        }

        matches.sort_by_key(|m| m.index);
        Ok(matches)
    }

    /// All unmatched record blocks with this content
    fn lookup(&self, weak: u32, data: &[u8], matched: &[bool]) -> Vec<usize> {
        let Some(candidates) = self.by_weak.get(&weak) else {
            return Vec::new();
        };

        let strong = blake3::hash(data);
        candidates
            .iter()
            .copied()
            .filter(|&position| {
                let part = &self.record.parts[position];
                !matched[position]
                    && self.record.block_len(part.index) == data.len()
                    && &part.strong == strong.as_bytes()
            })
            .collect()
    }
}

/// Calculate Adler-32 checksum of a block
#[must_use]
pub fn rolling_checksum(data: &[u8]) -> u32 {
    let mut a = 1u32;
    let mut b = 0u32;

    for &byte in data {
        a = (a + u32::from(byte)) % MOD_ADLER;
        b = (b + a) % MOD_ADLER;
    }

    (b << 16) | a
}

/// Adler-32 over a fixed-size window that slides one byte at a time
#[derive(Debug, Clone)]
pub struct RollingChecksum {
    a: u32,
    b: u32,
    window_size: u32,
}

impl RollingChecksum {
    /// Start a checksum over `window`
    #[must_use]
    pub fn new(window: &[u8]) -> Self {
        let value = rolling_checksum(window);
        Self {
            a: value & 0xffff,
            b: value >> 16,
            window_size: (window.len() as u64 % u64::from(MOD_ADLER)) as u32,
        }
    }

    /// Slide the window: drop `old_byte` from the front, append `new_byte`
    pub fn roll(&mut self, old_byte: u8, new_byte: u8) -> u32 {
        let old = u32::from(old_byte);
        let new = u32::from(new_byte);

        self.a = (self.a + MOD_ADLER - old + new) % MOD_ADLER;
        let dropped = (self.window_size * old) % MOD_ADLER;
        self.b = (self.b + self.a + 2 * MOD_ADLER - dropped - 1) % MOD_ADLER;

        self.get()
    }

    /// Get current checksum value
    #[must_use]
    pub fn get(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

/// Read until `buffer` is full or the file ends
fn read_full(file: &mut File, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match file.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::SmallRng};
    use tempfile::tempdir;

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = SmallRng::seed_from_u64(seed);
        (0..len).map(|_| rng.r#gen()).collect()
    }

    #[test]
    fn test_rolling_checksum() {
        let data = b"Hello, World!";
        let checksum = rolling_checksum(data);
        assert!(checksum > 0);
        assert_eq!(checksum, rolling_checksum(data));
        assert_ne!(checksum, rolling_checksum(b"Goodbye, World!"));
    }

    #[test]
    fn test_roll_matches_fresh_checksum() {
        let data = random_bytes(4096, 7);
        let window = 512;

        let mut rolling = RollingChecksum::new(&data[..window]);
        for start in 1..=(data.len() - window) {
            let rolled = rolling.roll(data[start - 1], data[start + window - 1]);
            assert_eq!(rolled, rolling_checksum(&data[start..start + window]));
        }
    }

    #[test]
    fn test_compute_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");
        let data = random_bytes(10_000, 1);
        std::fs::write(&path, &data).unwrap();

        let mut reports = Vec::new();
        let record = FilePartsRecord::compute(&path, 4096, |p| reports.push(p)).unwrap();

        assert_eq!(record.file_size, 10_000);
        assert_eq!(record.parts.len(), 3);
        assert_eq!(record.block_len(2), 10_000 - 8192);
        assert_eq!(record.file_hash, *blake3::hash(&data).as_bytes());
        assert_eq!(reports.last().copied(), Some(1.0));
        assert!(reports.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_identical_file_matches_every_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, random_bytes(20_000, 2)).unwrap();

        let record = FilePartsRecord::compute(&path, 4096, |_| {}).unwrap();
        let matches = PartsMatcher::new(&record).unwrap().find_matches(&path).unwrap();

        assert_eq!(matches.len(), record.parts.len());
        for m in &matches {
            assert_eq!(m.local_offset, record.block_range(m.index).start);
        }
    }

    #[test]
    fn test_shifted_blocks_are_found() {
        let dir = tempdir().unwrap();
        let remote = dir.path().join("remote.bin");
        let local = dir.path().join("local.bin");

        let remote_data = random_bytes(16_384, 3);
        let mut local_data = b"inserted prefix".to_vec();
        local_data.extend_from_slice(&remote_data[..8192]);
        std::fs::write(&remote, &remote_data).unwrap();
        std::fs::write(&local, &local_data).unwrap();

        let record = FilePartsRecord::compute(&remote, 4096, |_| {}).unwrap();
        let matches = PartsMatcher::new(&record).unwrap().find_matches(&local).unwrap();

        let indices: Vec<u64> = matches.iter().map(|m| m.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(matches[0].local_offset, 15);
        assert_eq!(matches[1].local_offset, 15 + 4096);
    }

    #[test]
    fn test_repeated_content_matches_all_copies() {
        let dir = tempdir().unwrap();
        let remote = dir.path().join("zeros.bin");
        let local = dir.path().join("local.bin");
        std::fs::write(&remote, vec![0u8; 4 * 4096]).unwrap();
        std::fs::write(&local, vec![0u8; 4096]).unwrap();

        let record = FilePartsRecord::compute(&remote, 4096, |_| {}).unwrap();
        let matches = PartsMatcher::new(&record).unwrap().find_matches(&local).unwrap();

        assert_eq!(matches.len(), 4);
        assert!(matches.iter().all(|m| m.local_offset == 0));
    }

    #[test]
    fn test_short_tail_block_matches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, random_bytes(4096 + 100, 4)).unwrap();

        let record = FilePartsRecord::compute(&path, 4096, |_| {}).unwrap();
        let matches = PartsMatcher::new(&record).unwrap().find_matches(&path).unwrap();

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[1].local_offset, 4096);
    }

    #[test]
    fn test_unrelated_file_matches_nothing() {
        let dir = tempdir().unwrap();
        let remote = dir.path().join("remote.bin");
        let local = dir.path().join("local.bin");
        std::fs::write(&remote, random_bytes(8192, 5)).unwrap();
        std::fs::write(&local, random_bytes(8192, 6)).unwrap();

        let record = FilePartsRecord::compute(&remote, 4096, |_| {}).unwrap();
        assert!(PartsMatcher::new(&record).unwrap().find_matches(&local).unwrap().is_empty());
    }

    #[test]
    fn test_oversized_block_record_rejected() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("local.bin");
        std::fs::write(&local, random_bytes(4096, 8)).unwrap();

        let record = FilePartsRecord {
            block_size: 1 << 44,
            file_size: 4096,
            file_hash: [0u8; 32],
            parts: vec![PartInfo {
                index: 0,
                weak: 1,
                strong: [0u8; 32],
            }],
        };
        let err = PartsMatcher::new(&record).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let tiny = FilePartsRecord {
            block_size: 16,
            ..record.clone()
        };
        assert!(tiny.validate().is_err());
    }

    #[test]
    fn test_inconsistent_parts_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, random_bytes(10_000, 9)).unwrap();
        let record = FilePartsRecord::compute(&path, 4096, |_| {}).unwrap();
        assert!(record.validate().is_ok());

        let mut short = record.clone();
        short.parts.pop();
        assert!(PartsMatcher::new(&short).is_err());

        let mut oversized = record.clone();
        oversized.file_size = 1 << 40;
        assert!(oversized.validate().is_err());

        let mut shuffled = record;
        shuffled.parts.swap(0, 1);
        assert!(shuffled.validate().is_err());
    }
}
