//! Error types for the transfer engine

use crate::provider::ConnectionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Typed reason a transfer ended in the broken (or aborted) state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferProblem {
    /// Folder was left or removed
    FolderRemoved,
    /// Partner disconnected
    NodeDisconnected,
    /// File changed on disk during the transfer
    FileChanged,
    /// Replaced by a newer request for the same file and peer
    OldUpload,
    /// Uploader ended the transfer
    BrokenUpload,
    /// Downloader ended the transfer
    BrokenDownload,
    /// Protocol misuse by the partner
    TransferException,
    /// Chunk did not match any request
    InvalidPart,
    /// File disappeared
    FileNotFoundException,
    /// Local I/O failure
    IoException,
    /// Anything else
    GeneralException,
    /// Last source of a multi-source download went away
    OutOfSources,
    /// Engine shut down
    Shutdown,
    /// A source offered a different version than the running download
    VersionMismatch,
    /// The folder refused the downloaded file
    ScanFailed,
    /// Cancelled on request
    Aborted,
}

impl TransferProblem {
    /// Stable code for logs and events
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::FolderRemoved => "FOLDER_REMOVED",
            Self::NodeDisconnected => "NODE_DISCONNECTED",
            Self::FileChanged => "FILE_CHANGED",
            Self::OldUpload => "OLD_UPLOAD",
            Self::BrokenUpload => "BROKEN_UPLOAD",
            Self::BrokenDownload => "BROKEN_DOWNLOAD",
            Self::TransferException => "TRANSFER_EXCEPTION",
            Self::InvalidPart => "INVALID_PART",
            Self::FileNotFoundException => "FILE_NOT_FOUND_EXCEPTION",
            Self::IoException => "IO_EXCEPTION",
            Self::GeneralException => "GENERAL_EXCEPTION",
            Self::OutOfSources => "OUT_OF_SOURCES",
            Self::Shutdown => "SHUTDOWN",
            Self::VersionMismatch => "VERSION_MISMATCH",
            Self::ScanFailed => "SCAN_FAILED",
            Self::Aborted => "ABORTED",
        }
    }

    /// Whether a non-automatic download broken for this reason goes back to pending
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::FolderRemoved | Self::Shutdown | Self::Aborted)
    }
}

impl fmt::Display for TransferProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::FolderRemoved => "folder removed",
            Self::NodeDisconnected => "peer disconnected",
            Self::FileChanged => "file changed",
            Self::OldUpload => "replaced by a newer upload",
            Self::BrokenUpload => "upload broken",
            Self::BrokenDownload => "download broken",
            Self::TransferException => "transfer protocol error",
            Self::InvalidPart => "invalid part",
            Self::FileNotFoundException => "file not found",
            Self::IoException => "I/O error",
            Self::GeneralException => "general error",
            Self::OutOfSources => "out of sources",
            Self::Shutdown => "shutdown",
            Self::VersionMismatch => "version mismatch",
            Self::ScanFailed => "post-transfer scan failed",
            Self::Aborted => "aborted",
        };
        f.write_str(text)
    }
}

/// Errors that can occur in transfer operations
#[derive(Debug, Error)]
pub enum TransferError {
    /// Connection layer failed to deliver a message
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File missing on disk
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// On-disk modification time differs from the expected version
    #[error("last modification date mismatch on {path}: expected {expected_ms}, found {actual_ms}")]
    ModificationMismatch {
        /// File concerned
        path: String,
        /// Modification time of the expected version (ms)
        expected_ms: i64,
        /// Modification time on disk (ms)
        actual_ms: i64,
    },

    /// File content changed (size differs)
    #[error("File changed: {0}")]
    FileChanged(String),

    /// Chunk or part request outside of what was agreed
    #[error("Invalid part: {0}")]
    InvalidPart(String),

    /// Upload request queue exceeded its cap
    #[error("Request queue overflow: {queued} pending requests, limit {limit}")]
    QueueOverflow {
        /// Requests already queued
        queued: usize,
        /// Cap of the queue
        limit: usize,
    },

    /// Different versions of the same file met
    #[error("Version mismatch: {0}")]
    VersionMismatch(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Persisted state could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Task join error
    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl TransferError {
    /// Problem code a transfer broken by this error reports
    #[must_use]
    pub fn problem(&self) -> TransferProblem {
        match self {
            Self::Connection(_) => TransferProblem::NodeDisconnected,
            Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                TransferProblem::FileNotFoundException
            }
            Self::Io(_) => TransferProblem::IoException,
            Self::FileNotFound(_) => TransferProblem::FileNotFoundException,
            Self::ModificationMismatch { .. } | Self::FileChanged(_) => TransferProblem::FileChanged,
            Self::InvalidPart(_) => TransferProblem::InvalidPart,
            Self::QueueOverflow { .. } => TransferProblem::TransferException,
            Self::VersionMismatch(_) => TransferProblem::VersionMismatch,
            Self::InvalidConfig(_)
            | Self::ConfigParse(_)
            | Self::Serialization(_)
            | Self::InvalidState(_)
            | Self::TaskJoin(_) => TransferProblem::GeneralException,
        }
    }
}

/// Result type for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PeerId;

    #[test]
    fn test_problem_mapping() {
        let overflow = TransferError::QueueOverflow {
            queued: 75,
            limit: 75,
        };
        assert_eq!(overflow.problem(), TransferProblem::TransferException);

        let mismatch = TransferError::ModificationMismatch {
            path: "a.bin".into(),
            expected_ms: 0,
            actual_ms: 2500,
        };
        assert_eq!(mismatch.problem(), TransferProblem::FileChanged);
        assert!(mismatch.to_string().contains("last modification date mismatch"));

        let missing = TransferError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(missing.problem(), TransferProblem::FileNotFoundException);

        let conn = TransferError::from(ConnectionError::NotConnected(PeerId::new("b")));
        assert_eq!(conn.problem(), TransferProblem::NodeDisconnected);
    }

    #[test]
    fn test_retryable() {
        assert!(TransferProblem::OutOfSources.is_retryable());
        assert!(TransferProblem::NodeDisconnected.is_retryable());
        assert!(!TransferProblem::Shutdown.is_retryable());
        assert!(!TransferProblem::FolderRemoved.is_retryable());
    }

    #[test]
    fn test_codes() {
        assert_eq!(TransferProblem::OldUpload.code(), "OLD_UPLOAD");
        assert_eq!(TransferProblem::OutOfSources.to_string(), "out of sources");
    }
}
