//! Inbound message dispatch.

use super::TransferManager;
use crate::error::TransferProblem;
use crate::message::{MESSAGE_OVERHEAD, TransferMessage};
use crate::model::{FileInfo, PeerId};
use tracing::{debug, trace};

impl TransferManager {
    /// Handle a transfer message received from `from`
    ///
    /// Called by the connection layer for every inbound transfer message, in
    /// the order they arrived on that connection.
    pub async fn handle_message(&self, from: &PeerId, message: TransferMessage) {
        trace!(peer = %from, message = message.name(), "Transfer message received");
        match message {
            TransferMessage::RequestDownload { file, start_offset } => {
                self.queue_upload(from, file, start_offset).await;
            }
            TransferMessage::DownloadQueued { file } => self.on_download_queued(from, &file),
            TransferMessage::StartUpload { file } => self.on_upload_started(from, &file).await,
            TransferMessage::RequestPart { file, range } => {
                let Some(upload) = self.find_upload(from, &file) else {
                    self.reject_unknown_upload(from, file).await;
                    return;
                };
                if let Err(e) = upload.enqueue_part_request(range) {
                    self.break_upload(&upload, e.problem(), &e.to_string(), true)
                        .await;
                }
            }
            TransferMessage::RequestPartsRecord { file } => {
                let Some(upload) = self.find_upload(from, &file) else {
                    self.reject_unknown_upload(from, file).await;
                    return;
                };
                if let Err(e) = upload.enqueue_parts_record_request() {
                    self.break_upload(&upload, e.problem(), &e.to_string(), true)
                        .await;
                }
            }
            TransferMessage::FileChunk { file, offset, data } => {
                self.on_file_chunk(from, &file, offset, data).await;
            }
            TransferMessage::ReplyPartsRecord { file, record } => {
                self.on_parts_record(from, &file, record).await;
            }
            TransferMessage::StopUpload { file } => {
                if let Some(upload) = self.find_upload(from, &file) {
                    upload.enqueue_stop();
                }
            }
            TransferMessage::AbortDownload { file } => {
                if let Some(upload) = self.find_upload(from, &file) {
                    debug!(peer = %from, file = %file.key(), "Download cancelled by peer");
                    self.break_upload(
                        &upload,
                        TransferProblem::BrokenDownload,
                        "download cancelled by peer",
                        false,
                    )
                    .await;
                }
            }
            TransferMessage::AbortUpload { file } => self.on_upload_aborted(from, &file).await,
        }
    }

    /// A request for an upload we do not run: tell the peer to drop its source
    async fn reject_unknown_upload(&self, from: &PeerId, file: FileInfo) {
        debug!(peer = %from, file = %file.key(), "Request for unknown upload");
        let Some(peer) = self.inner.peers.peer(from) else {
            return;
        };
        if peer
            .send_message(TransferMessage::AbortUpload { file })
            .await
            .is_ok()
        {
            self.inner.real_upload_counter.add(MESSAGE_OVERHEAD);
        }
    }
}
