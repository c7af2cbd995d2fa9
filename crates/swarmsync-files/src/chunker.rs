//! Out-of-order range reassembly into a temp file.
//!
//! Sources of a swarmed download deliver chunks for arbitrary byte ranges in
//! arbitrary order. [`RangeReassembler`] writes each chunk at its offset and
//! tracks which bytes of the file are filled.

use crate::ranges::RangeSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Temp-file writer for a download assembled from many byte ranges
pub struct RangeReassembler {
    file: File,
    path: PathBuf,
    total_size: u64,
    filled: RangeSet,
}

impl RangeReassembler {
    /// Create a fresh temp file, discarding any previous content
    ///
    /// Pre-allocates the file to `total_size`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or pre-allocated.
    pub fn create<P: AsRef<Path>>(path: P, total_size: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(total_size)?;

        Ok(Self {
            file,
            path,
            total_size,
            filled: RangeSet::new(),
        })
    }

    /// Total size of the file being assembled
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Location of the temp file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `data` at `offset`
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the chunk does not fit inside the file, or
    /// the underlying write error.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= self.total_size)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "Chunk {}+{} exceeds file size {}",
                        offset,
                        data.len(),
                        self.total_size
                    ),
                )
            })?;

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.filled.insert(offset..end);

        Ok(())
    }

    /// Copy `len` bytes at `source_offset` of another file into `offset` of this one
    ///
    /// Used to reuse blocks of an earlier copy of the file when resuming.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the source or writing the target fails.
    pub fn copy_from(
        &mut self,
        source: &mut File,
        source_offset: u64,
        offset: u64,
        len: usize,
    ) -> io::Result<()> {
        let mut buffer = vec![0u8; len];
        source.seek(SeekFrom::Start(source_offset))?;
        source.read_exact(&mut buffer)?;
        self.write_at(offset, &buffer)
    }

    /// Bytes written so far
    #[must_use]
    pub fn filled(&self) -> &RangeSet {
        &self.filled
    }

    /// Ranges still missing, in ascending order
    #[must_use]
    pub fn missing(&self) -> Vec<Range<u64>> {
        self.filled.gaps(0..self.total_size)
    }

    /// Whether `range` has already been written
    #[must_use]
    pub fn has_range(&self, range: &Range<u64>) -> bool {
        self.filled.contains_range(range)
    }

    /// Number of bytes written
    #[must_use]
    pub fn filled_len(&self) -> u64 {
        self.filled.covered_len()
    }

    /// Progress (0.0 to 1.0)
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            1.0
        } else {
            self.filled_len() as f64 / self.total_size as f64
        }
    }

    /// Check if every byte has been written
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.filled.contains_range(&(0..self.total_size))
    }

    /// Sync file to disk
    ///
    /// # Errors
    ///
    /// Returns an error if syncing fails.
    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Finalize and close the file, returning its path
    ///
    /// # Errors
    ///
    /// Returns an error if not all bytes are written or syncing fails.
    pub fn finalize(mut self) -> io::Result<PathBuf> {
        if !self.is_complete() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Transfer incomplete: {}/{} bytes written",
                    self.filled_len(),
                    self.total_size
                ),
            ));
        }

        self.sync()?;
        Ok(self.path)
    }
}
