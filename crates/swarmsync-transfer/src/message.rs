//! Transfer protocol messages.
//!
//! Encoding on the wire belongs to the connection layer; the engine only
//! produces and consumes these values.

use crate::model::FileInfo;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use swarmsync_files::FilePartsRecord;

/// Protocol framing overhead counted per message in the "real traffic" counters
pub const MESSAGE_OVERHEAD: u64 = 48;

/// A message of the transfer protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMessage {
    /// Downloader asks for a file
    RequestDownload {
        /// Requested version
        file: FileInfo,
        /// Offset the downloader wants to start from
        start_offset: u64,
    },
    /// Uploader accepted the request but has no free slot yet
    DownloadQueued {
        /// File concerned
        file: FileInfo,
    },
    /// Uploader is ready to serve part requests
    StartUpload {
        /// File concerned
        file: FileInfo,
    },
    /// Downloader asks for one byte range
    RequestPart {
        /// File concerned
        file: FileInfo,
        /// Requested bytes
        range: Range<u64>,
    },
    /// Bytes of the file
    FileChunk {
        /// File concerned
        file: FileInfo,
        /// Offset of `data` in the file
        offset: u64,
        /// Payload
        data: Vec<u8>,
    },
    /// Downloader needs nothing more
    StopUpload {
        /// File concerned
        file: FileInfo,
    },
    /// Downloader cancelled the download
    AbortDownload {
        /// File concerned
        file: FileInfo,
    },
    /// Uploader gave up serving the file
    AbortUpload {
        /// File concerned
        file: FileInfo,
    },
    /// Downloader asks for the parts record of the file
    RequestPartsRecord {
        /// File concerned
        file: FileInfo,
    },
    /// Parts record of the file
    ReplyPartsRecord {
        /// File concerned
        file: FileInfo,
        /// Block checksums
        record: FilePartsRecord,
    },
}

impl TransferMessage {
    /// File the message is about
    #[must_use]
    pub fn file(&self) -> &FileInfo {
        match self {
            Self::RequestDownload { file, .. }
            | Self::DownloadQueued { file }
            | Self::StartUpload { file }
            | Self::RequestPart { file, .. }
            | Self::FileChunk { file, .. }
            | Self::StopUpload { file }
            | Self::AbortDownload { file }
            | Self::AbortUpload { file }
            | Self::RequestPartsRecord { file }
            | Self::ReplyPartsRecord { file, .. } => file,
        }
    }

    /// Short name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestDownload { .. } => "RequestDownload",
            Self::DownloadQueued { .. } => "DownloadQueued",
            Self::StartUpload { .. } => "StartUpload",
            Self::RequestPart { .. } => "RequestPart",
            Self::FileChunk { .. } => "FileChunk",
            Self::StopUpload { .. } => "StopUpload",
            Self::AbortDownload { .. } => "AbortDownload",
            Self::AbortUpload { .. } => "AbortUpload",
            Self::RequestPartsRecord { .. } => "RequestPartsRecord",
            Self::ReplyPartsRecord { .. } => "ReplyPartsRecord",
        }
    }

    /// File bytes carried by the message
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            Self::FileChunk { data, .. } => data.len(),
            _ => 0,
        }
    }
}
