//! Point-in-time view of the transfer engine.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Snapshot returned by [`TransferManager::status`](crate::TransferManager::status)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferStatus {
    /// Uploads being served
    pub active_uploads: usize,
    /// Uploads waiting for a slot
    pub queued_uploads: usize,
    /// Uploads finished and kept in the completed list
    pub completed_uploads: usize,
    /// Downloads with at least one source
    pub active_downloads: usize,
    /// Downloads waiting for a source
    pub pending_downloads: usize,
    /// Downloads finished and kept in the completed list
    pub completed_downloads: usize,
    /// Payload upload rate (bytes/sec)
    pub upload_rate: f64,
    /// Payload download rate (bytes/sec)
    pub download_rate: f64,
    /// Payload bytes uploaded since start
    pub uploaded_bytes: u64,
    /// Payload bytes downloaded since start
    pub downloaded_bytes: u64,
    /// Bytes uploaded including message overhead
    pub real_uploaded_bytes: u64,
    /// Bytes downloaded including message overhead
    pub real_downloaded_bytes: u64,
    /// Configured upload slots
    pub max_concurrent_uploads: usize,
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
}

impl TransferStatus {
    /// Whether anything is moving or waiting
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.active_uploads == 0
            && self.queued_uploads == 0
            && self.active_downloads == 0
            && self.pending_downloads == 0
    }
}
