//! Transfer coordination for a swarmsync node
//!
//! The [`TransferManager`] owns every upload and download of the node:
//! - Upload queues with slot-based admission and a bounded worker pool
//! - One [`DownloadManager`] per file, fed by source selection
//! - Pending downloads parked until a source appears
//! - A maintenance loop woken by a timer tick or an explicit trigger
//! - Persistence of pending and completed downloads across restarts
//!
//! The connection layer feeds inbound messages to
//! [`TransferManager::handle_message`]; collaborators observe the engine
//! through [`TransferEvent`]s and [`TransferManager::status`].

mod downloads;
mod maintenance;
mod messages;
mod selection;
mod uploads;

use crate::bandwidth::{BandwidthProvider, Direction, NetworkClass};
use crate::config::{BandwidthSettings, MIN_UPLOAD_CPS, TransferConfig};
use crate::counter::TransferCounter;
use crate::download_manager::{DownloadManager, ManagerLimits};
use crate::error::{Result, TransferError, TransferProblem};
use crate::events::{EventBus, ListenerId, TransferEvent, TransferListener};
use crate::model::{FileInfo, FileKey, FolderId, PeerId};
use crate::persistence::{PersistedStatus, PersistedTransfer, TransferStore};
use crate::provider::{FolderRepository, PeerDirectory};
use crate::record_provider::FileRecordProvider;
use crate::status::TransferStatus;
use crate::transfer::Transfer;
use crate::upload::Upload;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub use selection::Selection;

/// Which transfers [`TransferManager::break_transfers`] ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakScope {
    /// Everything of a folder (folder left or removed)
    Folder(FolderId),
    /// Everything with a peer (disconnect); downloads only lose that source
    Peer(PeerId),
    /// Every transfer of a file, any version
    File(FileKey),
}

#[derive(Debug, Clone)]
pub(crate) struct PendingDownload {
    file: FileInfo,
    automatic: bool,
}

pub(crate) struct ManagerInner {
    config: TransferConfig,
    folders: Arc<dyn FolderRepository>,
    peers: Arc<dyn PeerDirectory>,
    runtime: Handle,

    queued_uploads: Mutex<Vec<Arc<Upload>>>,
    active_uploads: Mutex<Vec<Arc<Upload>>>,
    completed_uploads: Mutex<Vec<Arc<Upload>>>,

    downloads: DashMap<FileKey, Arc<DownloadManager>>,
    pending_downloads: Mutex<Vec<PendingDownload>>,
    completed_downloads: Mutex<Vec<Arc<DownloadManager>>>,

    upload_counter: Arc<TransferCounter>,
    real_upload_counter: Arc<TransferCounter>,
    download_counter: Arc<TransferCounter>,
    real_download_counter: Arc<TransferCounter>,

    started: AtomicBool,
    trigger: Notify,
    shutdown: watch::Sender<bool>,
    workers: Arc<Semaphore>,
    selection: tokio::sync::Mutex<()>,

    events: EventBus,
    bandwidth: BandwidthProvider,
    records: Arc<FileRecordProvider>,
    store: Option<TransferStore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Coordinator of all uploads and downloads of a node
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<ManagerInner>,
}

impl TransferManager {
    /// Create a manager on the current Tokio runtime
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or no runtime is
    /// running.
    pub fn new(
        config: TransferConfig,
        folders: Arc<dyn FolderRepository>,
        peers: Arc<dyn PeerDirectory>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| TransferError::InvalidState(format!("no Tokio runtime: {}", e)))?;
        Self::with_runtime(config, folders, peers, runtime)
    }

    /// Create a manager spawning its tasks on `runtime`
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_runtime(
        config: TransferConfig,
        folders: Arc<dyn FolderRepository>,
        peers: Arc<dyn PeerDirectory>,
        runtime: Handle,
    ) -> Result<Self> {
        config.validate()?;

        let store = config
            .state_dir
            .as_ref()
            .map(|dir| TransferStore::new(dir, &config.profile));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                folders,
                peers,
                runtime,
                queued_uploads: Mutex::new(Vec::new()),
                active_uploads: Mutex::new(Vec::new()),
                completed_uploads: Mutex::new(Vec::new()),
                downloads: DashMap::new(),
                pending_downloads: Mutex::new(Vec::new()),
                completed_downloads: Mutex::new(Vec::new()),
                upload_counter: Arc::new(TransferCounter::new()),
                real_upload_counter: Arc::new(TransferCounter::new()),
                download_counter: Arc::new(TransferCounter::new()),
                real_download_counter: Arc::new(TransferCounter::new()),
                started: AtomicBool::new(false),
                trigger: Notify::new(),
                shutdown,
                workers: Arc::new(Semaphore::new(config.upload_workers)),
                selection: tokio::sync::Mutex::new(()),
                events: EventBus::new(),
                bandwidth: BandwidthProvider::new(config.bandwidth.clone()),
                records: Arc::new(FileRecordProvider::new()),
                store,
                tasks: Mutex::new(Vec::new()),
                config,
            }),
        })
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    /// Parts record cache
    #[must_use]
    pub fn record_provider(&self) -> &Arc<FileRecordProvider> {
        &self.inner.records
    }

    /// Bandwidth limiters
    #[must_use]
    pub fn bandwidth(&self) -> &BandwidthProvider {
        &self.inner.bandwidth
    }

    /// Whether [`start`](Self::start) ran and no shutdown happened since
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Restore persisted downloads and start the background tasks
    ///
    /// Does nothing if transfers are disabled or the manager already runs.
    pub async fn start(&self) {
        if !self.inner.config.enabled {
            info!("Transfers disabled, transfer manager not started");
            return;
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.send_replace(false);

        self.restore_state().await;

        let handles = vec![
            self.inner
                .runtime
                .spawn(maintenance::maintenance_loop(self.clone(), self.inner.shutdown.subscribe())),
            self.inner
                .runtime
                .spawn(maintenance::partial_stats_loop(self.clone(), self.inner.shutdown.subscribe())),
            self.inner
                .runtime
                .spawn(maintenance::cleanup_loop(self.clone(), self.inner.shutdown.subscribe())),
        ];
        self.inner.tasks.lock().extend(handles);

        info!(profile = %self.inner.config.profile, "Transfer manager started");
        self.trigger();
    }

    /// Persist downloads, end every transfer and stop the background tasks
    pub async fn shutdown(&self) {
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.send_replace(true);

        if let Err(e) = self.persist_state().await {
            error!("Unable to persist transfer state: {}", e);
        }

        let managers: Vec<_> = self
            .inner
            .downloads
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for manager in managers {
            self.break_download_manager(&manager, TransferProblem::Shutdown, "shutdown")
                .await;
        }

        let uploads: Vec<_> = {
            let mut queued = self.inner.queued_uploads.lock();
            let mut active = self.inner.active_uploads.lock();
            queued.drain(..).chain(active.drain(..)).collect()
        };
        for upload in uploads {
            self.abort_upload(&upload).await;
        }

        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        info!("Transfer manager stopped");
    }

    /// Wake the maintenance loop
    ///
    /// Signals arriving while the loop is busy collapse into one extra pass.
    pub fn trigger(&self) {
        self.inner.trigger.notify_one();
    }

    /// Write pending, in-progress and completed downloads to the state file
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be written.
    pub async fn persist_state(&self) -> Result<()> {
        let Some(store) = &self.inner.store else {
            return Ok(());
        };

        let mut records: Vec<PersistedTransfer> = self
            .inner
            .pending_downloads
            .lock()
            .iter()
            .map(|pending| PersistedTransfer {
                file: pending.file.clone(),
                automatic: pending.automatic,
                status: PersistedStatus::Pending,
                peers: Vec::new(),
                completed_at: None,
            })
            .collect();
        records.extend(
            self.inner
                .downloads
                .iter()
                .filter(|entry| entry.value().is_active())
                .map(|entry| PersistedTransfer {
                    file: entry.value().file().clone(),
                    automatic: entry.value().is_automatic(),
                    status: PersistedStatus::InProgress,
                    peers: entry.value().contributors(),
                    completed_at: None,
                }),
        );
        records.extend(self.inner.completed_downloads.lock().iter().map(|manager| {
            PersistedTransfer {
                file: manager.file().clone(),
                automatic: manager.is_automatic(),
                status: PersistedStatus::Completed,
                peers: manager.contributors(),
                completed_at: manager.completed_at(),
            }
        }));

        store.store(&records).await
    }

    async fn restore_state(&self) {
        let Some(store) = &self.inner.store else {
            return;
        };
        let records = store.load().await;
        let (mut pending, mut completed) = (0usize, 0usize);

        for record in records {
            let Some(folder) = self.inner.folders.folder(&record.file.folder) else {
                debug!(file = %record.file.key(), "Folder of persisted transfer gone, dropped");
                continue;
            };
            match record.status {
                PersistedStatus::Pending | PersistedStatus::InProgress => {
                    if self.park_pending(record.file, record.automatic) {
                        pending += 1;
                    }
                }
                PersistedStatus::Completed => {
                    let mut list = self.inner.completed_downloads.lock();
                    // One manager per completed file version
                    if list
                        .iter()
                        .any(|m| m.file().is_version_date_and_size_identical(&record.file))
                    {
                        continue;
                    }
                    list.push(DownloadManager::restored(
                        record.file,
                        folder,
                        self.manager_limits(),
                        record.automatic,
                        record.peers,
                        record.completed_at,
                    ));
                    completed += 1;
                }
            }
        }
        info!(pending, completed, "Persisted downloads restored");
    }

    pub(crate) fn manager_limits(&self) -> ManagerLimits {
        let config = &self.inner.config;
        ManagerLimits {
            part_size: config.part_size as u64,
            max_requests_queued: config.max_requests_queued,
            max_sources: config.max_sources_per_download,
            parts_record_min_size: config.parts_record_min_size,
        }
    }

    /// Park a download until a source appears, returns false if already parked
    ///
    /// A newer version replaces a parked older one.
    fn park_pending(&self, file: FileInfo, automatic: bool) -> bool {
        let mut pending = self.inner.pending_downloads.lock();
        if let Some(existing) = pending.iter_mut().find(|p| p.file.same_key(&file)) {
            if file.is_newer_than(&existing.file) {
                existing.file = file;
            }
            existing.automatic &= automatic;
            return false;
        }
        pending.push(PendingDownload { file, automatic });
        true
    }

    fn unpark_pending(&self, key: &FileKey) {
        self.inner
            .pending_downloads
            .lock()
            .retain(|p| &p.file.key() != key);
    }

    /// End transfers in `scope` with `problem`
    ///
    /// Uploads are broken. Downloads of a folder or file are broken as a whole;
    /// for a peer only that peer's source is removed, which breaks the download
    /// if it was the last one. Leaving a folder also drops its pending
    /// downloads.
    pub async fn break_transfers(&self, scope: BreakScope, problem: TransferProblem) {
        let detail = match &scope {
            BreakScope::Folder(id) => format!("folder {} removed", id),
            BreakScope::Peer(peer) => format!("peer {} gone", peer),
            BreakScope::File(key) => format!("file {} changed", key),
        };
        info!(problem = %problem.code(), "Breaking transfers: {}", detail);

        let uploads: Vec<_> = {
            let queued = self.inner.queued_uploads.lock();
            let active = self.inner.active_uploads.lock();
            queued
                .iter()
                .chain(active.iter())
                .filter(|upload| match &scope {
                    BreakScope::Folder(id) => &upload.file().folder == id,
                    BreakScope::Peer(peer) => upload.partner() == peer,
                    BreakScope::File(key) => &upload.file().key() == key,
                })
                .cloned()
                .collect()
        };
        let notify_peer = !matches!(scope, BreakScope::Peer(_));
        for upload in uploads {
            self.break_upload(&upload, problem, &detail, notify_peer).await;
        }

        let managers: Vec<_> = self
            .inner
            .downloads
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for manager in managers {
            match &scope {
                BreakScope::Folder(id) if &manager.file().folder == id => {
                    self.break_download_manager(&manager, problem, &detail).await;
                }
                BreakScope::File(key) if &manager.file().key() == key => {
                    self.break_download_manager(&manager, problem, &detail).await;
                }
                BreakScope::Peer(peer) if manager.has_source(peer) => {
                    self.remove_download_source(&manager, peer, problem, &detail)
                        .await;
                }
                _ => {}
            }
        }

        if let BreakScope::Folder(id) = &scope {
            self.inner
                .pending_downloads
                .lock()
                .retain(|p| &p.file.folder != id);
        }
        self.trigger();
    }

    /// A peer's connection closed
    pub async fn peer_disconnected(&self, peer: &PeerId) {
        self.break_transfers(BreakScope::Peer(peer.clone()), TransferProblem::NodeDisconnected)
            .await;
    }

    /// Register an event listener
    pub fn subscribe(&self, listener: Arc<dyn TransferListener>) -> ListenerId {
        self.inner.events.subscribe(listener)
    }

    /// Remove an event listener
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Drop all events while set (tests, bulk operations)
    pub fn set_events_suppressed(&self, suppressed: bool) {
        self.inner.events.set_suppressed(suppressed);
    }

    fn publish(&self, event: TransferEvent) {
        self.inner.events.publish(event);
    }

    /// Uploads being served
    #[must_use]
    pub fn active_uploads(&self) -> Vec<Arc<Upload>> {
        self.inner.active_uploads.lock().clone()
    }

    /// Uploads waiting for a slot
    #[must_use]
    pub fn queued_uploads(&self) -> Vec<Arc<Upload>> {
        self.inner.queued_uploads.lock().clone()
    }

    /// Finished uploads
    #[must_use]
    pub fn completed_uploads(&self) -> Vec<Arc<Upload>> {
        self.inner.completed_uploads.lock().clone()
    }

    /// Running downloads
    #[must_use]
    pub fn active_downloads(&self) -> Vec<Arc<DownloadManager>> {
        self.inner
            .downloads
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Downloads waiting for a source
    #[must_use]
    pub fn pending_downloads(&self) -> Vec<FileInfo> {
        self.inner
            .pending_downloads
            .lock()
            .iter()
            .map(|p| p.file.clone())
            .collect()
    }

    /// Finished downloads
    #[must_use]
    pub fn completed_downloads(&self) -> Vec<Arc<DownloadManager>> {
        self.inner.completed_downloads.lock().clone()
    }

    /// Running download of a file, any version
    #[must_use]
    pub fn download_manager(&self, key: &FileKey) -> Option<Arc<DownloadManager>> {
        self.inner.downloads.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Uploads (queued and active) of a folder
    #[must_use]
    pub fn uploads_of_folder(&self, folder: &FolderId) -> Vec<Arc<Upload>> {
        let queued = self.inner.queued_uploads.lock();
        let active = self.inner.active_uploads.lock();
        queued
            .iter()
            .chain(active.iter())
            .filter(|u| &u.file().folder == folder)
            .cloned()
            .collect()
    }

    /// Running downloads of a folder
    #[must_use]
    pub fn downloads_of_folder(&self, folder: &FolderId) -> Vec<Arc<DownloadManager>> {
        self.inner
            .downloads
            .iter()
            .filter(|entry| &entry.key().folder == folder)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Uploads (queued and active) to a peer
    #[must_use]
    pub fn uploads_to_peer(&self, peer: &PeerId) -> Vec<Arc<Upload>> {
        let queued = self.inner.queued_uploads.lock();
        let active = self.inner.active_uploads.lock();
        queued
            .iter()
            .chain(active.iter())
            .filter(|u| u.partner() == peer)
            .cloned()
            .collect()
    }

    /// Number of running downloads a peer serves a source of
    #[must_use]
    pub fn downloads_from_peer(&self, peer: &PeerId) -> usize {
        self.inner
            .downloads
            .iter()
            .filter(|entry| entry.value().has_source(peer))
            .count()
    }

    /// Point-in-time snapshot of the engine
    #[must_use]
    pub fn status(&self) -> TransferStatus {
        let inner = &self.inner;
        let queued_uploads = inner.queued_uploads.lock().len();
        let active_uploads = inner.active_uploads.lock().len();
        let completed_uploads = inner.completed_uploads.lock().len();
        let pending_downloads = inner.pending_downloads.lock().len();
        let completed_downloads = inner.completed_downloads.lock().len();
        TransferStatus {
            active_uploads,
            queued_uploads,
            completed_uploads,
            active_downloads: inner.downloads.len(),
            pending_downloads,
            completed_downloads,
            upload_rate: inner.upload_counter.current_rate(),
            download_rate: inner.download_counter.current_rate(),
            uploaded_bytes: inner.upload_counter.bytes_transferred(),
            downloaded_bytes: inner.download_counter.bytes_transferred(),
            real_uploaded_bytes: inner.real_upload_counter.bytes_transferred(),
            real_downloaded_bytes: inner.real_download_counter.bytes_transferred(),
            max_concurrent_uploads: inner.config.max_concurrent_uploads,
            taken_at: Utc::now(),
        }
    }

    /// Drop every completed upload from the list
    pub fn clear_completed_uploads(&self) -> usize {
        let removed: Vec<_> = self.inner.completed_uploads.lock().drain(..).collect();
        for upload in &removed {
            self.publish(TransferEvent::CompletedUploadRemoved(Arc::clone(upload)));
        }
        removed.len()
    }

    /// Drop every completed download from the list
    pub fn clear_completed_downloads(&self) -> usize {
        let removed: Vec<_> = self.inner.completed_downloads.lock().drain(..).collect();
        for manager in &removed {
            self.publish(TransferEvent::CompletedDownloadRemoved(Arc::clone(manager)));
        }
        removed.len()
    }

    /// Remove completed transfers older than `max_age`
    ///
    /// Returns the number of removed uploads and downloads.
    pub fn cleanup_completed(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let expired = |at: Option<chrono::DateTime<Utc>>| at.is_some_and(|at| at < cutoff);

        let uploads: Vec<_> = {
            let mut list = self.inner.completed_uploads.lock();
            let (old, keep) = list
                .drain(..)
                .partition(|u: &Arc<Upload>| expired(u.core().completed_at()));
            *list = keep;
            old
        };
        let downloads: Vec<_> = {
            let mut list = self.inner.completed_downloads.lock();
            let (old, keep) = list
                .drain(..)
                .partition(|m: &Arc<DownloadManager>| expired(m.completed_at()));
            *list = keep;
            old
        };

        for upload in &uploads {
            self.publish(TransferEvent::CompletedUploadRemoved(Arc::clone(upload)));
        }
        for manager in &downloads {
            self.publish(TransferEvent::CompletedDownloadRemoved(Arc::clone(manager)));
        }
        if !uploads.is_empty() || !downloads.is_empty() {
            debug!(
                uploads = uploads.len(),
                downloads = downloads.len(),
                "Old completed transfers removed"
            );
        }
        uploads.len() + downloads.len()
    }

    /// Current bandwidth settings
    #[must_use]
    pub fn bandwidth_settings(&self) -> BandwidthSettings {
        self.inner.bandwidth.settings()
    }

    /// Set the upload limit for a network class (bytes/sec, 0 = unlimited)
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidConfig`] for a non-zero limit below
    /// [`MIN_UPLOAD_CPS`].
    pub fn set_upload_limit(&self, class: NetworkClass, limit: u64) -> Result<()> {
        if limit != 0 && limit < MIN_UPLOAD_CPS {
            return Err(TransferError::InvalidConfig(format!(
                "upload limit {} below minimum {}",
                limit, MIN_UPLOAD_CPS
            )));
        }
        self.inner.bandwidth.update(|settings| match class {
            NetworkClass::Lan => settings.lan_upload = limit,
            NetworkClass::Wan => settings.wan_upload = limit,
        });
        debug!(?class, limit, "Upload limit changed");
        Ok(())
    }

    /// Set the download limit for a network class (bytes/sec, 0 = unlimited)
    pub fn set_download_limit(&self, class: NetworkClass, limit: u64) {
        self.inner.bandwidth.update(|settings| match class {
            NetworkClass::Lan => settings.lan_download = limit,
            NetworkClass::Wan => settings.wan_download = limit,
        });
        debug!(?class, limit, "Download limit changed");
    }

    /// Enter or leave silent mode
    pub fn set_silent_mode(&self, silent: bool) {
        self.inner
            .bandwidth
            .update(|settings| settings.silent_mode = silent);
    }

    /// Share of the limits used in silent mode
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidConfig`] outside 10..=100.
    pub fn set_silent_throttle(&self, percent: u8) -> Result<()> {
        if !(10..=100).contains(&percent) {
            return Err(TransferError::InvalidConfig(format!(
                "throttle {}% outside 10..=100",
                percent
            )));
        }
        self.inner
            .bandwidth
            .update(|settings| settings.silent_throttle_percent = percent);
        Ok(())
    }

    /// Effective limit currently applied to a class and direction
    #[must_use]
    pub fn effective_limit(&self, class: NetworkClass, direction: Direction) -> u64 {
        self.inner.bandwidth.limiter(class, direction).limit()
    }
}

impl fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queued = self.inner.queued_uploads.lock().len();
        let active = self.inner.active_uploads.lock().len();
        let pending = self.inner.pending_downloads.lock().len();
        f.debug_struct("TransferManager")
            .field("started", &self.is_started())
            .field("active_uploads", &active)
            .field("queued_uploads", &queued)
            .field("downloads", &self.inner.downloads.len())
            .field("pending", &pending)
            .finish_non_exhaustive()
    }
}
