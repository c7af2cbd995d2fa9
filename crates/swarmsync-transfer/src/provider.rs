//! Collaborator interfaces: the folder database and the peer connection layer.

use crate::message::TransferMessage;
use crate::model::{FileInfo, FolderId, PeerId};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// First protocol version able to exchange parts records
pub const PARTS_RECORD_PROTOCOL_VERSION: u32 = 2;

/// A synchronized folder, as seen by the transfer engine
pub trait Folder: Send + Sync {
    /// Folder identity
    fn id(&self) -> &FolderId;

    /// Whether `peer` may read files of this folder
    fn has_read_permission(&self, peer: &PeerId) -> bool;

    /// Whether the file is on the exclude/ignore list
    fn is_excluded(&self, file: &FileInfo) -> bool;

    /// Whether the storage device backing the folder is unavailable
    fn is_device_disconnected(&self) -> bool {
        false
    }

    /// Local database entry for the file, any version
    fn local_file(&self, file: &FileInfo) -> Option<FileInfo>;

    /// Version of the file `peer` announced
    fn remote_file(&self, peer: &PeerId, file: &FileInfo) -> Option<FileInfo>;

    /// Newest version of the file across the local database and every peer
    fn newest_version(&self, file: &FileInfo) -> Option<FileInfo>;

    /// Peers that joined this folder
    fn members(&self) -> Vec<PeerId>;

    /// Location of the file on disk
    fn disk_path(&self, file: &FileInfo) -> PathBuf;

    /// Location of the temp file a download of `file` is assembled in
    fn temp_download_path(&self, file: &FileInfo) -> PathBuf;

    /// Verify the downloaded temp file and install it atomically as `file`
    ///
    /// Returns `false` if verification or installation failed.
    fn scan_download_file(&self, file: &FileInfo, temp_file: &Path) -> bool;

    /// Schedule an immediate rescan of the folder
    fn request_rescan(&self);

    /// Re-read the ignore patterns (parent folders of metadata folders)
    fn reload_ignore_patterns(&self) {}

    /// Partial-sync statistics: bytes transferred so far for a file in flight
    fn record_partial_transfer(&self, _file: &FileInfo, _bytes: u64) {}
}

/// Lookup of joined folders
pub trait FolderRepository: Send + Sync {
    /// Folder with this id, if joined
    fn folder(&self, id: &FolderId) -> Option<Arc<dyn Folder>>;
}

/// Errors reported by the connection layer
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Peer is not connected
    #[error("Peer {0} is not connected")]
    NotConnected(PeerId),

    /// Sending failed
    #[error("Send failed: {0}")]
    Send(String),
}

/// A connected (or once connected) remote peer
#[async_trait]
pub trait Peer: Send + Sync {
    /// Peer identity
    fn id(&self) -> &PeerId;

    /// Whether the peer is reached over the local network
    fn is_on_lan(&self) -> bool;

    /// Whether the connection is fully established
    fn is_completely_connected(&self) -> bool;

    /// Protocol version spoken by the peer
    fn protocol_version(&self) -> u32;

    /// Whether the peer can exchange parts records
    fn supports_parts_record(&self) -> bool {
        self.protocol_version() >= PARTS_RECORD_PROTOCOL_VERSION
    }

    /// Send a message
    async fn send_message(&self, message: TransferMessage) -> Result<(), ConnectionError>;
}

/// Lookup of known peers
pub trait PeerDirectory: Send + Sync {
    /// Peer with this id, connected or not
    fn peer(&self, id: &PeerId) -> Option<Arc<dyn Peer>>;
}
