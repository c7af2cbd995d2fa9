//! # swarmsync transfer
//!
//! Multi-source transfer engine of the swarmsync folder synchronization client.
//!
//! This crate provides:
//! - [`TransferManager`]: the coordinator of every upload and download, with
//!   source selection, a periodic maintenance loop and persistence of pending
//!   and completed downloads
//! - [`DownloadManager`]: one file downloaded from several peers at once, with
//!   byte range assignment, reassembly and commit into the folder
//! - [`Upload`]: the per-peer serving state machine
//! - Bandwidth limiters per network class and direction, transfer counters and
//!   a typed event bus
//!
//! Folders and peers are collaborators reached through the traits in
//! [`provider`]; the engine never touches the file database or the wire format.
//!
//! # Message Flow
//!
//! ```text
//! Downloader                         Uploader
//!     |                                  |
//!     |-- RequestDownload -------------->|
//!     |<------------------ DownloadQueued-|  (only if not started at once)
//!     |<--------------------- StartUpload-|
//!     |-- RequestPartsRecord ----------->|  (resume only)
//!     |<----------------- ReplyPartsRecord|
//!     |-- RequestPart (range) ---------->|
//!     |<----------------------- FileChunk-|
//!     |-- ...                            |
//!     |-- StopUpload ------------------->|
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bandwidth;
pub mod config;
pub mod counter;
pub mod download;
pub mod download_manager;
pub mod error;
pub mod events;
pub mod manager;
pub mod message;
pub mod model;
pub mod persistence;
pub mod provider;
pub mod record_provider;
pub mod status;
pub mod transfer;
pub mod upload;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bandwidth::{BandwidthLimiter, BandwidthProvider, Direction, NetworkClass};
pub use config::{BandwidthSettings, TransferConfig};
pub use counter::TransferCounter;
pub use download::Download;
pub use download_manager::DownloadManager;
pub use error::{Result, TransferError, TransferProblem};
pub use events::{EventBus, ListenerId, TransferEvent, TransferListener};
pub use manager::{BreakScope, TransferManager};
pub use message::TransferMessage;
pub use model::{FileInfo, FileKey, FolderId, PeerId};
pub use provider::{ConnectionError, Folder, FolderRepository, Peer, PeerDirectory};
pub use record_provider::FileRecordProvider;
pub use status::TransferStatus;
pub use transfer::{Transfer, TransferCore, TransferState};
pub use upload::Upload;
