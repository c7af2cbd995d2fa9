//! Upload queueing, admission and workers.

use super::TransferManager;
use crate::bandwidth::{Direction, NetworkClass};
use crate::error::TransferProblem;
use crate::events::TransferEvent;
use crate::message::{MESSAGE_OVERHEAD, TransferMessage};
use crate::model::{FileInfo, PeerId, modified_ms, same_modification};
use crate::provider::{Folder, Peer};
use crate::transfer::Transfer;
use crate::upload::{Upload, UploadEnv, UploadOutcome};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl TransferManager {
    /// Validate a peer's download request and queue an upload for it
    ///
    /// Returns `None` without telling the peer if the request is refused:
    /// internal database files, peers without read permission, and files whose
    /// disk state or database entry does not match the requested version. The
    /// last case also requests a rescan of the folder.
    ///
    /// An earlier upload of the same file to the same peer is broken with
    /// [`TransferProblem::OldUpload`]. The peer gets a queued acknowledgement
    /// only if the upload did not start within the configured delay.
    pub async fn queue_upload(
        &self,
        from: &PeerId,
        file: FileInfo,
        start_offset: u64,
    ) -> Option<Arc<Upload>> {
        if !self.is_started() {
            debug!(peer = %from, "Upload request while stopped, ignored");
            return None;
        }
        if file.is_internal_database_file() {
            warn!(peer = %from, file = %file.key(), "Upload of internal database file refused");
            return None;
        }
        let folder = self.inner.folders.folder(&file.folder)?;
        let Some(peer) = self.inner.peers.peer(from) else {
            debug!(peer = %from, "Upload request from unknown peer");
            return None;
        };
        if !folder.has_read_permission(from) {
            info!(peer = %from, folder = %file.folder, "Upload refused, no read permission");
            return None;
        }
        let local = self.validate_local(&folder, &file).await?;

        let upload = Arc::new(Upload::new(
            local,
            peer,
            Arc::clone(&folder),
            start_offset,
            self.inner.config.upload_queue_limit(),
        ));

        let replaced: Vec<_> = {
            let mut queued = self.inner.queued_uploads.lock();
            let active = self.inner.active_uploads.lock();
            let old = queued
                .iter()
                .chain(active.iter())
                .filter(|u| u.partner() == from && u.file().same_key(&file))
                .cloned()
                .collect();
            queued.push(Arc::clone(&upload));
            old
        };
        for old in replaced {
            self.break_upload(&old, TransferProblem::OldUpload, "replaced by a new request", false)
                .await;
        }

        debug!(file = %file.key(), peer = %from, start_offset, "Upload requested");
        self.publish(TransferEvent::UploadRequested(Arc::clone(&upload)));
        self.check_queued_uploads().await;
        self.schedule_queued_ack(&upload);
        Some(upload)
    }

    /// Local database entry for `file`, if it and the disk match the request
    async fn validate_local(&self, folder: &Arc<dyn Folder>, file: &FileInfo) -> Option<FileInfo> {
        let local = folder.local_file(file);
        let Some(local) = local.filter(|l| !l.deleted && l.is_version_date_and_size_identical(file))
        else {
            debug!(file = %file.key(), "Requested version not in local database, rescanning");
            folder.request_rescan();
            return None;
        };

        let path = folder.disk_path(&local);
        let in_sync = match tokio::fs::metadata(&path).await {
            Ok(metadata) => {
                metadata.len() == local.size
                    && modified_ms(&metadata)
                        .is_ok_and(|actual| same_modification(actual, local.modified_ms))
            }
            Err(_) => false,
        };
        if !in_sync {
            info!(file = %file.key(), "File on disk differs from database, rescanning");
            folder.request_rescan();
            return None;
        }
        Some(local)
    }

    fn schedule_queued_ack(&self, upload: &Arc<Upload>) {
        let manager = self.clone();
        let upload = Arc::clone(upload);
        let delay = self.inner.config.queued_ack_delay();
        self.inner.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if upload.core().is_started() || upload.core().is_done() {
                return;
            }
            let message = TransferMessage::DownloadQueued {
                file: upload.file().clone(),
            };
            match upload.peer().send_message(message).await {
                Ok(()) => {
                    manager.inner.real_upload_counter.add(MESSAGE_OVERHEAD);
                    manager.publish(TransferEvent::UploadQueued(upload));
                }
                Err(e) => debug!(peer = %upload.partner(), "Queued ack not delivered: {}", e),
            }
        });
    }

    /// Whether an upload to `peer` could start now
    ///
    /// LAN peers always get a slot. Otherwise the number of distinct WAN peers
    /// being served must stay below `max_concurrent_uploads`; a peer already
    /// served does not add a destination.
    #[must_use]
    pub fn has_free_upload_slot(&self, peer: &Arc<dyn Peer>) -> bool {
        let active = self.inner.active_uploads.lock();
        Self::slot_free(&active, peer, self.inner.config.max_concurrent_uploads)
    }

    fn slot_free(active: &[Arc<Upload>], peer: &Arc<dyn Peer>, max: usize) -> bool {
        if peer.is_on_lan() {
            return true;
        }
        let destinations: HashSet<&PeerId> = active
            .iter()
            .filter(|u| !u.peer().is_on_lan())
            .map(|u| u.partner())
            .collect();
        destinations.contains(peer.id()) || destinations.len() < max
    }

    /// Start queued uploads that got a slot, break the ones found broken
    pub(crate) async fn check_queued_uploads(&self) {
        let max = self.inner.config.max_concurrent_uploads;
        let mut to_start = Vec::new();
        let mut broken = Vec::new();
        {
            let mut queued = self.inner.queued_uploads.lock();
            let mut active = self.inner.active_uploads.lock();
            queued.retain(|upload| {
                if upload.core().is_done() {
                    return false;
                }
                if Transfer::is_broken(upload.as_ref()) {
                    broken.push(Arc::clone(upload));
                    return true;
                }
                if Self::slot_free(&active, upload.peer(), max) {
                    active.push(Arc::clone(upload));
                    to_start.push(Arc::clone(upload));
                    return false;
                }
                true
            });
            broken.extend(
                active
                    .iter()
                    .filter(|u| !u.core().is_done() && Transfer::is_broken(u.as_ref()))
                    .cloned(),
            );
        }

        for upload in broken {
            let connected = upload.peer().is_completely_connected();
            let (problem, detail) = if connected {
                (TransferProblem::FileNotFoundException, "file vanished from disk")
            } else {
                (TransferProblem::NodeDisconnected, "peer disconnected")
            };
            self.break_upload(&upload, problem, detail, connected).await;
        }
        for upload in to_start {
            self.spawn_upload(upload);
        }
    }

    fn spawn_upload(&self, upload: Arc<Upload>) {
        // Started before the worker runs so the queued ack is skipped
        upload.core().mark_started();
        info!(file = %upload.file().key(), peer = %upload.partner(), "Upload started");
        self.publish(TransferEvent::UploadStarted(Arc::clone(&upload)));

        let manager = self.clone();
        let workers = Arc::clone(&self.inner.workers);
        self.inner.runtime.spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            let env = manager.upload_env(&upload);
            let outcome = upload.run(env).await;
            manager.upload_finished(&upload, outcome).await;
        });
    }

    fn upload_env(&self, upload: &Upload) -> UploadEnv {
        let config = &self.inner.config;
        UploadEnv {
            limiter: self
                .inner
                .bandwidth
                .limiter(NetworkClass::of(upload.peer().is_on_lan()), Direction::Upload),
            records: Arc::clone(&self.inner.records),
            effective: Arc::clone(&self.inner.upload_counter),
            real: Arc::clone(&self.inner.real_upload_counter),
            buffer_threshold: config.upload_buffer_threshold,
            request_timeout: config.request_timeout(),
            first_request_timeout: config.first_request_timeout(),
        }
    }

    async fn upload_finished(&self, upload: &Arc<Upload>, outcome: UploadOutcome) {
        self.remove_upload(upload);
        match outcome {
            UploadOutcome::Completed => {
                self.inner.completed_uploads.lock().push(Arc::clone(upload));
                self.publish(TransferEvent::UploadCompleted(Arc::clone(upload)));
            }
            UploadOutcome::Broken(problem, detail) => {
                self.send_abort_upload(upload).await;
                self.publish(TransferEvent::UploadBroken {
                    upload: Arc::clone(upload),
                    problem,
                    detail,
                });
            }
            UploadOutcome::Interrupted => {}
        }
        self.trigger();
    }

    pub(super) fn remove_upload(&self, upload: &Arc<Upload>) {
        self.inner
            .queued_uploads
            .lock()
            .retain(|u| !Arc::ptr_eq(u, upload));
        self.inner
            .active_uploads
            .lock()
            .retain(|u| !Arc::ptr_eq(u, upload));
    }

    async fn send_abort_upload(&self, upload: &Upload) {
        let message = TransferMessage::AbortUpload {
            file: upload.file().clone(),
        };
        if let Err(e) = upload.peer().send_message(message).await {
            debug!(peer = %upload.partner(), "Upload abort not delivered: {}", e);
        }
    }

    /// Break an upload and drop it from the queues
    pub(crate) async fn break_upload(
        &self,
        upload: &Arc<Upload>,
        problem: TransferProblem,
        detail: &str,
        notify_peer: bool,
    ) {
        self.remove_upload(upload);
        if !upload.break_with(problem, detail) {
            return;
        }
        warn!(
            file = %upload.file().key(),
            peer = %upload.partner(),
            problem = %problem.code(),
            "Upload broken: {}",
            detail
        );
        if notify_peer {
            self.send_abort_upload(upload).await;
        }
        self.publish(TransferEvent::UploadBroken {
            upload: Arc::clone(upload),
            problem,
            detail: detail.to_string(),
        });
        self.trigger();
    }

    /// Cancel an upload and tell the peer
    ///
    /// Returns false if the upload had already ended.
    pub async fn abort_upload(&self, upload: &Arc<Upload>) -> bool {
        self.remove_upload(upload);
        if !upload.abort() {
            return false;
        }
        self.send_abort_upload(upload).await;
        self.publish(TransferEvent::UploadAborted(Arc::clone(upload)));
        self.trigger();
        true
    }

    /// Upload of `file` to `peer`, queued or active
    pub(crate) fn find_upload(&self, peer: &PeerId, file: &FileInfo) -> Option<Arc<Upload>> {
        let active = self.inner.active_uploads.lock();
        let found = active
            .iter()
            .find(|u| u.partner() == peer && u.file().same_key(file))
            .cloned();
        drop(active);
        found.or_else(|| {
            self.inner
                .queued_uploads
                .lock()
                .iter()
                .find(|u| u.partner() == peer && u.file().same_key(file))
                .cloned()
        })
    }
}
