//! Per-peer upload state machine.
//!
//! An [`Upload`] is created when a peer requests a file. The manager queues
//! it until a slot is free, then runs [`Upload::run`] on a worker task. The
//! worker announces the start, answers an optional parts-record request and
//! serves part requests in FIFO order until the peer sends a stop, the queue
//! stays empty for a full request timeout, or the upload is aborted/broken.

use crate::bandwidth::BandwidthLimiter;
use crate::config::MAX_PART_SIZE;
use crate::counter::TransferCounter;
use crate::error::{Result, TransferError, TransferProblem};
use crate::message::{MESSAGE_OVERHEAD, TransferMessage};
use crate::model::{FileInfo, same_modification};
use crate::provider::{Folder, Peer};
use crate::record_provider::FileRecordProvider;
use crate::transfer::{Transfer, TransferCore};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use swarmsync_files::RangeReader;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// A request waiting in an upload's queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadRequest {
    /// Send these bytes
    Part(Range<u64>),
    /// Send the parts record of the file
    PartsRecord,
    /// Peer needs nothing more
    Stop,
}

/// How a worker run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Served until stop or idle timeout
    Completed,
    /// Failed inside the worker
    Broken(TransferProblem, String),
    /// Someone else ended the upload (abort, break) while it ran
    Interrupted,
}

/// Shared resources an upload worker needs
pub(crate) struct UploadEnv {
    pub limiter: Arc<BandwidthLimiter>,
    pub records: Arc<FileRecordProvider>,
    pub effective: Arc<TransferCounter>,
    pub real: Arc<TransferCounter>,
    pub buffer_threshold: u64,
    pub request_timeout: Duration,
    pub first_request_timeout: Duration,
}

/// One file served to one peer
pub struct Upload {
    core: TransferCore,
    peer: Arc<dyn Peer>,
    folder: Arc<dyn Folder>,
    start_offset: u64,
    queue_limit: usize,
    pending: Mutex<VecDeque<UploadRequest>>,
    wake: Notify,
}

impl Upload {
    /// Create an upload of `file` to `peer`
    ///
    /// # Arguments
    ///
    /// * `file` - Local version being served
    /// * `peer` - Requesting peer
    /// * `folder` - Folder holding the file
    /// * `start_offset` - Offset the peer asked to start from
    /// * `queue_limit` - Cap of pending requests before the upload breaks
    #[must_use]
    pub fn new(
        file: FileInfo,
        peer: Arc<dyn Peer>,
        folder: Arc<dyn Folder>,
        start_offset: u64,
        queue_limit: usize,
    ) -> Self {
        let partner = peer.id().clone();
        Self {
            core: TransferCore::new(file, partner),
            peer,
            folder,
            start_offset,
            queue_limit,
            pending: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
        }
    }

    /// Receiving peer
    #[must_use]
    pub fn peer(&self) -> &Arc<dyn Peer> {
        &self.peer
    }

    /// Folder of the file
    #[must_use]
    pub fn folder(&self) -> &Arc<dyn Folder> {
        &self.folder
    }

    /// Requests waiting to be served
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Queue a part request
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidPart`] for an empty range, one past the
    /// end of the file, one starting before the requested start offset or one
    /// longer than [`MAX_PART_SIZE`], and [`TransferError::QueueOverflow`] if
    /// the queue is full.
    pub fn enqueue_part_request(&self, range: Range<u64>) -> Result<()> {
        let size = self.file().size;
        let invalid = range.start >= range.end
            || range.end > size
            || range.start < self.start_offset
            || range.end - range.start > MAX_PART_SIZE as u64;
        if invalid {
            return Err(TransferError::InvalidPart(format!(
                "requested {}..{} of {} ({} bytes, start offset {})",
                range.start,
                range.end,
                self.file().path,
                size,
                self.start_offset
            )));
        }
        self.enqueue(UploadRequest::Part(range))
    }

    /// Queue a parts-record request
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::QueueOverflow`] if the queue is full.
    pub fn enqueue_parts_record_request(&self) -> Result<()> {
        self.enqueue(UploadRequest::PartsRecord)
    }

    /// Queue the peer's stop signal
    pub fn enqueue_stop(&self) {
        self.pending.lock().push_back(UploadRequest::Stop);
        self.wake.notify_one();
    }

    fn enqueue(&self, request: UploadRequest) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.len() >= self.queue_limit {
            return Err(TransferError::QueueOverflow {
                queued: pending.len(),
                limit: self.queue_limit,
            });
        }
        pending.push_back(request);
        drop(pending);
        self.wake.notify_one();
        Ok(())
    }

    /// Cancel the upload, returns false if it had already ended
    pub fn abort(&self) -> bool {
        let changed = self.core.mark_aborted();
        self.release();
        changed
    }

    /// Mark the upload broken, returns false if it had already ended
    pub fn break_with(&self, problem: TransferProblem, detail: impl Into<String>) -> bool {
        let changed = self.core.mark_broken(problem, detail);
        self.release();
        changed
    }

    fn release(&self) {
        self.pending.lock().clear();
        self.wake.notify_one();
    }

    /// Serve the upload until it ends
    pub(crate) async fn run(&self, env: UploadEnv) -> UploadOutcome {
        if self.core.is_done() {
            return UploadOutcome::Interrupted;
        }
        self.core.mark_started();

        let result = self.serve(&env).await;
        self.pending.lock().clear();

        match result {
            Ok(()) if self.core.mark_completed() => {
                info!(
                    file = %self.file().key(),
                    peer = %self.partner(),
                    bytes = self.core.counter().bytes_transferred(),
                    "Upload completed"
                );
                UploadOutcome::Completed
            }
            Err(e) if self.core.mark_broken(e.problem(), e.to_string()) => {
                warn!(
                    file = %self.file().key(),
                    peer = %self.partner(),
                    "Upload broken: {}",
                    e
                );
                UploadOutcome::Broken(e.problem(), e.to_string())
            }
            _ => UploadOutcome::Interrupted,
        }
    }

    async fn serve(&self, env: &UploadEnv) -> Result<()> {
        let file = self.file().clone();
        let path = self.folder.disk_path(&file);

        self.check_unchanged(&path).await?;
        let mut reader = RangeReader::open(&path, env.buffer_threshold).await?;
        debug!(file = %file.key(), reader = ?reader.kind(), "Upload reader opened");

        self.peer
            .send_message(TransferMessage::StartUpload { file: file.clone() })
            .await?;
        env.real.add(MESSAGE_OVERHEAD);

        let mut timeout = env.first_request_timeout;
        loop {
            let Some(request) = self.next_request(timeout).await else {
                if !self.core.is_done() {
                    debug!(file = %file.key(), peer = %self.partner(), "Upload idle, ending");
                }
                return Ok(());
            };
            timeout = env.request_timeout;

            match request {
                UploadRequest::Stop => {
                    debug!(file = %file.key(), peer = %self.partner(), "Upload stopped by peer");
                    return Ok(());
                }
                UploadRequest::PartsRecord => {
                    if !self.peer.supports_parts_record() {
                        debug!(peer = %self.partner(), "Parts record requested by old peer, ignored");
                        continue;
                    }
                    let record = env
                        .records
                        .retrieve_record(&self.folder, &file, |_| {})
                        .await?;
                    self.peer
                        .send_message(TransferMessage::ReplyPartsRecord {
                            file: file.clone(),
                            record: record.as_ref().clone(),
                        })
                        .await?;
                    env.real.add(MESSAGE_OVERHEAD);
                }
                UploadRequest::Part(range) => {
                    self.check_unchanged(&path).await?;

                    let len = (range.end - range.start) as usize;
                    let data = reader.read_range(range.start, len).await?;
                    env.limiter.acquire(len).await;
                    if self.core.is_done() {
                        return Ok(());
                    }

                    self.peer
                        .send_message(TransferMessage::FileChunk {
                            file: file.clone(),
                            offset: range.start,
                            data,
                        })
                        .await?;

                    self.core.counter().add(len as u64);
                    env.effective.add(len as u64);
                    env.real.add(len as u64 + MESSAGE_OVERHEAD);
                    trace!(file = %file.key(), offset = range.start, len, "Chunk sent");
                }
            }
        }
    }

    /// Next queued request, or `None` on timeout or once the upload ended
    async fn next_request(&self, timeout: Duration) -> Option<UploadRequest> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.core.is_done() {
                return None;
            }
            let next = self.pending.lock().pop_front();
            if next.is_some() {
                return next;
            }
            if tokio::time::timeout_at(deadline, self.wake.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    /// Fail if the file on disk no longer matches the version being served
    ///
    /// A mismatch requests a rescan of the folder.
    async fn check_unchanged(&self, path: &Path) -> Result<()> {
        let file = self.file();
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.folder.request_rescan();
                return Err(TransferError::FileNotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let actual_ms = crate::model::modified_ms(&metadata)?;
        if !same_modification(actual_ms, file.modified_ms) {
            self.folder.request_rescan();
            return Err(TransferError::ModificationMismatch {
                path: file.path.clone(),
                expected_ms: file.modified_ms,
                actual_ms,
            });
        }
        if metadata.len() != file.size {
            self.folder.request_rescan();
            return Err(TransferError::FileChanged(format!(
                "{}: expected {} bytes, found {}",
                file.path,
                file.size,
                metadata.len()
            )));
        }
        Ok(())
    }
}

impl Transfer for Upload {
    fn core(&self) -> &TransferCore {
        &self.core
    }

    /// Also broken once the peer is gone or the file vanished from disk
    fn is_broken(&self) -> bool {
        self.core.is_broken()
            || !self.peer.is_completely_connected()
            || !self.folder.disk_path(self.file()).exists()
    }
}

impl fmt::Debug for Upload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upload")
            .field("file", &self.core.file().key())
            .field("peer", self.core.partner())
            .field("state", &self.core.state())
            .field("pending", &self.pending_requests())
            .finish_non_exhaustive()
    }
}
