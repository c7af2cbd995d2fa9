//! Download side: source start, chunk receipt, resume, commit and breaking.

use super::TransferManager;
use crate::bandwidth::{Direction, NetworkClass};
use crate::download::Download;
use crate::download_manager::{ChunkOutcome, DownloadManager, RefillPlan, StartPlan};
use crate::error::{TransferError, TransferProblem};
use crate::events::TransferEvent;
use crate::message::MESSAGE_OVERHEAD;
use crate::model::{FileInfo, PeerId};
use crate::transfer::Transfer;
use std::ops::Range;
use std::sync::Arc;
use swarmsync_files::{FilePartsRecord, PartsMatcher};
use tracing::{debug, info, trace, warn};

impl TransferManager {
    /// Running download of exactly this file version
    pub(crate) fn active_download(&self, file: &FileInfo) -> Option<Arc<DownloadManager>> {
        self.inner
            .downloads
            .get(&file.key())
            .filter(|entry| entry.value().file().is_version_date_and_size_identical(file))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Drop a manager from the registry unless another one replaced it
    pub(super) fn unregister(&self, manager: &Arc<DownloadManager>) {
        self.inner
            .downloads
            .remove_if(&manager.file().key(), |_, current| Arc::ptr_eq(current, manager));
    }

    /// The peer started serving one of our sources
    pub(crate) async fn on_upload_started(&self, from: &PeerId, file: &FileInfo) {
        let Some(manager) = self.active_download(file) else {
            debug!(peer = %from, file = %file.key(), "Start for unknown download");
            return;
        };
        let plan = manager.source_started(from);
        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                self.break_download_manager(&manager, e.problem(), &e.to_string())
                    .await;
                return;
            }
        };

        match plan {
            StartPlan::Ignore => {}
            StartPlan::RequestRecord(download) => {
                self.publish(TransferEvent::DownloadStarted(Arc::clone(&download)));
                if let Err(e) = download.request_parts_record().await {
                    self.remove_download_source(&manager, from, e.problem(), &e.to_string())
                        .await;
                }
            }
            StartPlan::Request(download, ranges) => {
                self.publish(TransferEvent::DownloadStarted(Arc::clone(&download)));
                self.dispatch(&manager, vec![(download, ranges)], false).await;
            }
            StartPlan::Complete => self.finish_download(&manager).await,
        }
    }

    /// A chunk arrived
    pub(crate) async fn on_file_chunk(&self, from: &PeerId, file: &FileInfo, offset: u64, data: Vec<u8>) {
        let Some(manager) = self.active_download(file) else {
            trace!(peer = %from, file = %file.key(), "Chunk for unknown download dropped");
            return;
        };
        let Some(source) = manager.source(from) else {
            trace!(peer = %from, "Chunk from detached source dropped");
            return;
        };

        let len = data.len();
        self.inner
            .bandwidth
            .limiter(NetworkClass::of(source.peer().is_on_lan()), Direction::Download)
            .acquire(len)
            .await;
        self.inner
            .real_download_counter
            .add(len as u64 + MESSAGE_OVERHEAD);

        let outcome = manager.receive_chunk(from, offset, &data);
        match outcome {
            Ok(ChunkOutcome::Ignored) => {}
            Ok(ChunkOutcome::Continue(download, ranges)) => {
                self.inner.download_counter.add(len as u64);
                trace!(file = %file.key(), offset, len, "Chunk stored");
                self.dispatch(&manager, vec![(download, ranges)], false).await;
            }
            Ok(ChunkOutcome::Complete) => {
                self.inner.download_counter.add(len as u64);
                self.finish_download(&manager).await;
            }
            Err(TransferError::InvalidPart(detail)) => {
                warn!(peer = %from, file = %file.key(), "Invalid chunk: {}", detail);
                source.send_abort().await;
                self.remove_download_source(&manager, from, TransferProblem::InvalidPart, &detail)
                    .await;
            }
            Err(e) => {
                self.break_download_manager(&manager, e.problem(), &e.to_string())
                    .await;
            }
        }
    }

    /// The parts record we asked for arrived
    ///
    /// Blocks of the resume base matching the record are copied into the temp
    /// file on a blocking thread; only the remaining ranges are requested.
    pub(crate) async fn on_parts_record(&self, from: &PeerId, file: &FileInfo, record: FilePartsRecord) {
        let Some(manager) = self.active_download(file) else {
            return;
        };
        let Some(base) = manager.pending_record_base(from) else {
            debug!(peer = %from, "Unexpected parts record ignored");
            return;
        };

        if let Err(e) = record.validate() {
            warn!(peer = %from, file = %file.key(), "Parts record ignored: {}", e);
        } else if record.file_size == file.size {
            let worker = Arc::clone(&manager);
            let peer = from.clone();
            let result = tokio::task::spawn_blocking(move || -> crate::error::Result<u64> {
                let matches = PartsMatcher::new(&record)?.find_matches(&base)?;
                worker.apply_record_matches(&peer, &base, &record, &matches)
            })
            .await;
            match result {
                Ok(Ok(reused)) => info!(file = %file.key(), reused, "Resumed from local blocks"),
                Ok(Err(e)) => debug!(file = %file.key(), "Local blocks not reused: {}", e),
                Err(e) => warn!("Block matching task failed: {}", e),
            }
        } else {
            debug!(
                file = %file.key(),
                "Parts record describes {} bytes, expected {}",
                record.file_size,
                file.size
            );
        }

        let plan = manager.finish_record(from);
        self.dispatch(&manager, plan.requests, plan.complete).await;
    }

    /// Send part requests; sources that fail are detached and their ranges
    /// handed to the others
    async fn dispatch(
        &self,
        manager: &Arc<DownloadManager>,
        mut work: Vec<(Arc<Download>, Vec<Range<u64>>)>,
        mut complete: bool,
    ) {
        while !work.is_empty() {
            let mut failed = Vec::new();
            for (download, ranges) in work.drain(..) {
                if ranges.is_empty() {
                    continue;
                }
                if let Err(e) = download.request_parts(ranges).await {
                    failed.push((download.partner().clone(), e));
                }
            }
            for (peer, e) in failed {
                let plan = self.detach_source(manager, &peer, e.problem(), &e.to_string());
                work.extend(plan.requests);
                complete |= plan.complete;
            }
        }
        if complete {
            self.finish_download(manager).await;
        }
    }

    /// Remove one source of a download
    ///
    /// The last source leaving breaks the download; otherwise the freed ranges
    /// go to the remaining sources.
    pub(crate) async fn remove_download_source(
        &self,
        manager: &Arc<DownloadManager>,
        peer: &PeerId,
        problem: TransferProblem,
        detail: &str,
    ) {
        let plan = self.detach_source(manager, peer, problem, detail);
        self.dispatch(manager, plan.requests, plan.complete).await;
    }

    fn detach_source(
        &self,
        manager: &Arc<DownloadManager>,
        peer: &PeerId,
        problem: TransferProblem,
        detail: &str,
    ) -> RefillPlan {
        let Some(removal) = manager.remove_source(peer) else {
            return RefillPlan::default();
        };
        removal.download.core().mark_broken(problem, detail);
        debug!(
            file = %manager.file().key(),
            peer = %peer,
            problem = %problem.code(),
            "Download source removed: {}",
            detail
        );
        self.publish(TransferEvent::DownloadBroken {
            manager: Arc::clone(manager),
            source: Some(peer.clone()),
            problem,
            detail: detail.to_string(),
        });

        if removal.out_of_sources {
            self.unregister(manager);
            self.publish(TransferEvent::DownloadBroken {
                manager: Arc::clone(manager),
                source: None,
                problem: TransferProblem::OutOfSources,
                detail: "no sources left".to_string(),
            });
            if !manager.is_automatic() {
                self.enqueue_pending(manager.file().clone(), false);
            }
            self.trigger();
            return RefillPlan::default();
        }
        manager.refill()
    }

    /// Verify, install and complete a fully received download
    pub(crate) async fn finish_download(&self, manager: &Arc<DownloadManager>) {
        if let Err(e) = manager.verify_local_unchanged() {
            self.break_download_manager(manager, e.problem(), &e.to_string())
                .await;
            return;
        }
        let temp = match manager.finalize_temp() {
            Ok(temp) => temp,
            Err(e) => {
                self.break_download_manager(manager, e.problem(), &e.to_string())
                    .await;
                return;
            }
        };

        let folder = Arc::clone(manager.folder());
        let file = manager.file().clone();
        let installed = tokio::task::spawn_blocking(move || folder.scan_download_file(&file, &temp))
            .await
            .unwrap_or_else(|e| {
                warn!("Install task failed: {}", e);
                false
            });
        if !installed {
            self.break_download_manager(
                manager,
                TransferProblem::ScanFailed,
                "downloaded file failed verification",
            )
            .await;
            return;
        }

        let Some(sources) = manager.mark_completed() else {
            debug!(file = %manager.file().key(), "Download ended while installing");
            return;
        };
        for download in &sources {
            download.core().mark_completed();
            download.stop().await;
        }
        self.unregister(manager);
        self.unpark_pending(&manager.file().key());
        self.inner.completed_downloads.lock().push(Arc::clone(manager));
        self.inner.records.invalidate(&manager.file().key());

        let folder_id = &manager.file().folder;
        if folder_id.is_meta() && manager.file().is_sync_pattern_file() {
            if let Some(parent) = folder_id.parent().and_then(|id| self.inner.folders.folder(&id)) {
                debug!(folder = %parent.id(), "Reloading ignore patterns");
                parent.reload_ignore_patterns();
            }
        }

        self.publish(TransferEvent::DownloadCompleted(Arc::clone(manager)));
        self.trigger();
    }

    /// Break a download as a whole
    ///
    /// Sources are told to stop uploading. A non-automatic download broken for
    /// a retryable reason is parked as pending.
    pub(crate) async fn break_download_manager(
        &self,
        manager: &Arc<DownloadManager>,
        problem: TransferProblem,
        detail: &str,
    ) {
        let Some(sources) = manager.set_broken(problem, detail) else {
            return;
        };
        self.unregister(manager);
        warn!(
            file = %manager.file().key(),
            problem = %problem.code(),
            "Download broken: {}",
            detail
        );
        for download in &sources {
            download.core().mark_broken(problem, detail);
            download.send_abort().await;
        }
        self.publish(TransferEvent::DownloadBroken {
            manager: Arc::clone(manager),
            source: None,
            problem,
            detail: detail.to_string(),
        });
        if !manager.is_automatic() && problem.is_retryable() {
            self.enqueue_pending(manager.file().clone(), false);
        }
        self.trigger();
    }

    /// Cancel the download of a file
    ///
    /// Returns false if no download of the file was running or pending.
    pub async fn abort_download(&self, file: &FileInfo) -> bool {
        let key = file.key();
        let parked = {
            let mut pending = self.inner.pending_downloads.lock();
            let before = pending.len();
            pending.retain(|p| p.file.key() != key);
            pending.len() != before
        };

        let Some(manager) = self.download_manager(&key) else {
            return parked;
        };
        let Some(sources) = manager.abort() else {
            return parked;
        };
        self.unregister(&manager);
        for download in &sources {
            download.core().mark_aborted();
            download.send_abort().await;
        }
        info!(file = %key, "Download aborted");
        self.publish(TransferEvent::DownloadAborted(manager));
        self.trigger();
        true
    }

    /// Park a download and announce it
    pub(crate) fn enqueue_pending(&self, file: FileInfo, automatic: bool) {
        if self.park_pending(file.clone(), automatic) {
            debug!(file = %file.key(), "Download pending until a source appears");
            self.publish(TransferEvent::PendingDownloadEnqueued(file));
        }
    }

    /// The uploader gave up on one of our sources
    pub(crate) async fn on_upload_aborted(&self, from: &PeerId, file: &FileInfo) {
        let Some(manager) = self.active_download(file) else {
            return;
        };
        if manager.has_source(from) {
            self.remove_download_source(
                &manager,
                from,
                TransferProblem::BrokenUpload,
                "upload aborted by peer",
            )
            .await;
        }
    }

    /// The uploader queued our request
    pub(crate) fn on_download_queued(&self, from: &PeerId, file: &FileInfo) {
        if let Some(download) = self
            .active_download(file)
            .and_then(|manager| manager.source(from))
        {
            self.publish(TransferEvent::DownloadQueued(download));
        }
    }
}
