//! Source selection for downloads.
//!
//! Runs under one lock per manager so concurrent requests for the same file
//! never create two download managers.

use super::TransferManager;
use crate::download::Download;
use crate::download_manager::DownloadManager;
use crate::error::TransferProblem;
use crate::events::TransferEvent;
use crate::model::{FileInfo, modified_ms, same_modification};
use crate::provider::{Folder, Peer};
use crate::transfer::Transfer;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of a source selection
#[derive(Debug, Clone)]
pub enum Selection {
    /// Download running with at least one source
    Started(Arc<DownloadManager>),
    /// No source available right now
    NoSource,
    /// Local copy already current
    NotNeeded,
    /// Transfers stopped, folder unknown or its device disconnected
    Unavailable,
    /// File excluded or invalid
    Refused,
}

impl Selection {
    /// The running download, if any
    #[must_use]
    pub fn manager(self) -> Option<Arc<DownloadManager>> {
        match self {
            Self::Started(manager) => Some(manager),
            _ => None,
        }
    }
}

impl TransferManager {
    /// Download the newest known version of `file`
    ///
    /// Picks connected folder members announcing exactly that version and
    /// having capacity left, least loaded first, and attaches them as sources
    /// of the file's [`DownloadManager`]. Returns `None` if the file is
    /// current, refused, or no source exists; a non-automatic request without
    /// sources is parked as pending.
    pub async fn download_newest_version(
        &self,
        file: &FileInfo,
        automatic: bool,
    ) -> Option<Arc<DownloadManager>> {
        self.select_sources(file, automatic, true).await.manager()
    }

    pub(crate) async fn select_sources(
        &self,
        file: &FileInfo,
        automatic: bool,
        park_if_sourceless: bool,
    ) -> Selection {
        let _guard = self.inner.selection.lock().await;

        let Some(folder) = self.inner.folders.folder(&file.folder) else {
            debug!(folder = %file.folder, "Download for unknown folder");
            return Selection::Unavailable;
        };
        if !self.inner.config.enabled || !self.is_started() || folder.is_device_disconnected() {
            return Selection::Unavailable;
        }
        if !file.is_valid() || folder.is_excluded(file) {
            debug!(file = %file.key(), "Download refused");
            return Selection::Refused;
        }

        let newest = folder.newest_version(file).unwrap_or_else(|| file.clone());
        if newest.deleted {
            return Selection::NotNeeded;
        }
        let local = folder.local_file(&newest);
        if let Some(local) = &local
            && !newest.is_newer_than(local)
        {
            return Selection::NotNeeded;
        }
        if Self::disk_matches(&folder, &newest).await {
            debug!(file = %newest.key(), "Disk already holds the newest version");
            return Selection::NotNeeded;
        }

        let existing = self.download_manager(&newest.key());
        let manager = match existing {
            Some(m) if m.file().is_version_date_and_size_identical(&newest) => Some(m),
            Some(m) => {
                info!(
                    file = %newest.key(),
                    running = m.file().version,
                    newest = newest.version,
                    "Running download outdated"
                );
                self.break_download_manager(
                    &m,
                    TransferProblem::VersionMismatch,
                    "a newer version is available",
                )
                .await;
                None
            }
            None => None,
        };

        let candidates = self.candidates(&folder, &newest, manager.as_ref());
        if candidates.is_empty() {
            if let Some(manager) = manager {
                return Selection::Started(manager);
            }
            if !automatic && park_if_sourceless {
                self.enqueue_pending(newest, automatic);
            }
            return Selection::NoSource;
        }

        let manager = match manager {
            Some(manager) => manager,
            None => {
                let manager = DownloadManager::new(
                    newest.clone(),
                    Arc::clone(&folder),
                    automatic,
                    self.manager_limits(),
                );
                self.inner
                    .downloads
                    .insert(newest.key(), Arc::clone(&manager));
                manager
            }
        };

        let mut added = Vec::new();
        for peer in candidates {
            let download = Arc::new(Download::new(newest.clone(), peer, automatic, &manager));
            match manager.add_source(Arc::clone(&download)) {
                Ok(true) => added.push(download),
                Ok(false) => {}
                Err(e) => {
                    self.break_download_manager(&manager, e.problem(), &e.to_string())
                        .await;
                    return Selection::Unavailable;
                }
            }
        }

        for download in added {
            debug!(file = %newest.key(), peer = %download.partner(), "Requesting source");
            self.publish(TransferEvent::DownloadRequested(Arc::clone(&download)));
            if let Err(e) = download.request(0).await {
                self.remove_download_source(&manager, download.partner(), e.problem(), &e.to_string())
                    .await;
            }
        }

        if manager.source_count() == 0 {
            if manager.is_active() {
                self.unregister(&manager);
            }
            return Selection::NoSource;
        }
        self.unpark_pending(&newest.key());
        Selection::Started(manager)
    }

    /// Connected members with the exact version and spare capacity
    ///
    /// Shuffled, then ordered by the number of downloads they already serve so
    /// ties are broken randomly.
    fn candidates(
        &self,
        folder: &Arc<dyn Folder>,
        file: &FileInfo,
        manager: Option<&Arc<DownloadManager>>,
    ) -> Vec<Arc<dyn Peer>> {
        let config = &self.inner.config;
        let mut candidates: Vec<(usize, Arc<dyn Peer>)> = folder
            .members()
            .iter()
            .filter_map(|id| self.inner.peers.peer(id))
            .filter(|peer| peer.is_completely_connected())
            .filter(|peer| manager.is_none_or(|m| !m.has_source(peer.id())))
            .filter(|peer| {
                folder
                    .remote_file(peer.id(), file)
                    .is_some_and(|remote| !remote.deleted && remote.is_version_date_and_size_identical(file))
            })
            .filter_map(|peer| {
                let load = self.downloads_from_peer(peer.id());
                let limit = if peer.is_on_lan() {
                    config.max_downloads_per_peer_lan
                } else {
                    config.max_downloads_per_peer_wan
                };
                (load < limit).then_some((load, peer))
            })
            .collect();

        candidates.shuffle(&mut SmallRng::from_entropy());
        candidates.sort_by_key(|(load, _)| *load);
        candidates.into_iter().map(|(_, peer)| peer).collect()
    }

    /// Whether the file on disk already is `file`
    async fn disk_matches(folder: &Arc<dyn Folder>, file: &FileInfo) -> bool {
        if file.deleted {
            return false;
        }
        match tokio::fs::metadata(folder.disk_path(file)).await {
            Ok(metadata) => {
                metadata.is_file()
                    && metadata.len() == file.size
                    && modified_ms(&metadata).is_ok_and(|ms| same_modification(ms, file.modified_ms))
            }
            Err(_) => false,
        }
    }
}
