//! One source of a multi-source download.

use crate::download_manager::DownloadManager;
use crate::error::Result;
use crate::message::TransferMessage;
use crate::model::FileInfo;
use crate::provider::Peer;
use crate::transfer::{Transfer, TransferCore};
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// A (file, peer) download, attached to the file's [`DownloadManager`]
pub struct Download {
    core: TransferCore,
    peer: Arc<dyn Peer>,
    automatic: bool,
    manager: Weak<DownloadManager>,
}

impl Download {
    /// Create a source for `manager` served by `peer`
    #[must_use]
    pub fn new(
        file: FileInfo,
        peer: Arc<dyn Peer>,
        automatic: bool,
        manager: &Arc<DownloadManager>,
    ) -> Self {
        let partner = peer.id().clone();
        Self {
            core: TransferCore::new(file, partner),
            peer,
            automatic,
            manager: Arc::downgrade(manager),
        }
    }

    /// Serving peer
    #[must_use]
    pub fn peer(&self) -> &Arc<dyn Peer> {
        &self.peer
    }

    /// Whether background sync logic requested it
    #[must_use]
    pub fn is_automatic(&self) -> bool {
        self.automatic
    }

    /// Manager this source belongs to, if it still exists
    #[must_use]
    pub fn manager(&self) -> Option<Arc<DownloadManager>> {
        self.manager.upgrade()
    }

    /// Ask the peer for the file
    pub(crate) async fn request(&self, start_offset: u64) -> Result<()> {
        debug!(file = %self.file().key(), peer = %self.partner(), "Requesting download");
        self.peer
            .send_message(TransferMessage::RequestDownload {
                file: self.file().clone(),
                start_offset,
            })
            .await?;
        Ok(())
    }

    /// Ask the peer for byte ranges
    pub(crate) async fn request_parts(&self, ranges: Vec<Range<u64>>) -> Result<()> {
        for range in ranges {
            trace!(peer = %self.partner(), "Requesting part {}..{}", range.start, range.end);
            self.peer
                .send_message(TransferMessage::RequestPart {
                    file: self.file().clone(),
                    range,
                })
                .await?;
        }
        Ok(())
    }

    /// Ask the peer for the parts record of the file
    pub(crate) async fn request_parts_record(&self) -> Result<()> {
        debug!(file = %self.file().key(), peer = %self.partner(), "Requesting parts record");
        self.peer
            .send_message(TransferMessage::RequestPartsRecord {
                file: self.file().clone(),
            })
            .await?;
        Ok(())
    }

    /// Tell the peer we are done
    pub(crate) async fn stop(&self) {
        let message = TransferMessage::StopUpload {
            file: self.file().clone(),
        };
        if let Err(e) = self.peer.send_message(message).await {
            debug!(peer = %self.partner(), "Stop not delivered: {}", e);
        }
    }

    /// Tell the peer we cancelled
    pub(crate) async fn send_abort(&self) {
        let message = TransferMessage::AbortDownload {
            file: self.file().clone(),
        };
        if let Err(e) = self.peer.send_message(message).await {
            debug!(peer = %self.partner(), "Abort not delivered: {}", e);
        }
    }
}

impl Transfer for Download {
    fn core(&self) -> &TransferCore {
        &self.core
    }

    /// Also broken once the connection is gone
    fn is_broken(&self) -> bool {
        self.core.is_broken() || !self.peer.is_completely_connected()
    }
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("file", &self.core.file().key())
            .field("peer", self.core.partner())
            .field("state", &self.core.state())
            .field("automatic", &self.automatic)
            .finish_non_exhaustive()
    }
}
