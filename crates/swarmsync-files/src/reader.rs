//! Range reads for the upload side.
//!
//! Three strategies, picked when the reader is opened:
//! - small files are read into memory once
//! - larger files are read with a seek + read per range
//! - if seeking is not supported the file is streamed forward, reopening it
//!   when a request goes backwards

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};
use tracing::debug;

/// Which strategy a [`RangeReader`] ended up with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderKind {
    /// Whole file held in memory
    Buffered,
    /// Random access through seek
    Positioned,
    /// Forward-only stream
    Sequential,
}

/// Reader serving arbitrary byte ranges of one file
pub enum RangeReader {
    /// Whole file held in memory
    Buffered(Vec<u8>),
    /// Random access through seek
    Positioned(File),
    /// Forward-only stream
    Sequential {
        /// Open stream
        stream: BufReader<File>,
        /// Path used to reopen the stream
        path: PathBuf,
        /// Offset of the next byte the stream yields
        position: u64,
    },
}

impl RangeReader {
    /// Open `path`, buffering it in memory if it is at most `buffer_threshold` bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open(path: &Path, buffer_threshold: u64) -> io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;

        if metadata.len() <= buffer_threshold {
            match tokio::fs::read(path).await {
                Ok(data) => return Ok(Self::Buffered(data)),
                Err(e) => debug!("In-memory read of {} failed: {}", path.display(), e),
            }
        }

        let mut file = File::open(path).await?;
        match file.seek(SeekFrom::Start(0)).await {
            Ok(_) => Ok(Self::Positioned(file)),
            Err(e) => {
                debug!(
                    "Random access on {} unavailable ({}), streaming instead",
                    path.display(),
                    e
                );
                Self::open_sequential(path).await
            }
        }
    }

    /// Open `path` as a forward-only stream
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open_sequential(path: &Path) -> io::Result<Self> {
        let file = File::open(path).await?;
        Ok(Self::Sequential {
            stream: BufReader::new(file),
            path: path.to_path_buf(),
            position: 0,
        })
    }

    /// Strategy in use
    #[must_use]
    pub fn kind(&self) -> ReaderKind {
        match self {
            Self::Buffered(_) => ReaderKind::Buffered,
            Self::Positioned(_) => ReaderKind::Positioned,
            Self::Sequential { .. } => ReaderKind::Sequential,
        }
    }

    /// Read exactly `len` bytes starting at `offset`
    ///
    /// # Errors
    ///
    /// Returns `UnexpectedEof` if the range extends past the end of the file,
    /// or the underlying I/O error.
    pub async fn read_range(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        match self {
            Self::Buffered(data) => {
                let start = usize::try_from(offset).map_err(|_| eof(offset, len))?;
                let end = start.checked_add(len).ok_or_else(|| eof(offset, len))?;
                data.get(start..end)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| eof(offset, len))
            }
            Self::Positioned(file) => {
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buffer = vec![0u8; len];
                file.read_exact(&mut buffer).await?;
                Ok(buffer)
            }
            Self::Sequential {
                stream,
                path,
                position,
            } => {
                if offset < *position {
                    *stream = BufReader::new(File::open(&*path).await?);
                    *position = 0;
                }

                let skip = offset - *position;
                if skip > 0 {
                    let skipped =
                        tokio::io::copy(&mut (&mut *stream).take(skip), &mut tokio::io::sink())
                            .await?;
                    *position += skipped;
                    if skipped < skip {
                        return Err(eof(offset, len));
                    }
                }

                let mut buffer = vec![0u8; len];
                stream.read_exact(&mut buffer).await?;
                *position += len as u64;
                Ok(buffer)
            }
        }
    }
}

fn eof(offset: u64, len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("Range {}+{} past end of file", offset, len),
    )
}
