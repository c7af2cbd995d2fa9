//! Background tasks: the maintenance loop, partial-sync sampling and cleanup.

use super::{PendingDownload, TransferManager};
use super::selection::Selection;
use crate::download_manager::ManagerPhase;
use crate::error::TransferProblem;
use crate::transfer::Transfer;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, trace};

/// Runs a maintenance pass on every trigger or after `wait_time` of silence
pub(super) async fn maintenance_loop(manager: TransferManager, mut shutdown: watch::Receiver<bool>) {
    debug!("Maintenance loop started");
    loop {
        tokio::select! {
            _ = manager.inner.trigger.notified() => {}
            _ = sleep(manager.inner.config.wait_time()) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        manager.run_maintenance().await;
    }
    debug!("Maintenance loop stopped");
}

/// Reports bytes received so far of every running download to its folder
pub(super) async fn partial_stats_loop(manager: TransferManager, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(manager.inner.config.partial_stats_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        for download in manager.active_downloads() {
            download
                .folder()
                .record_partial_transfer(download.file(), download.counter().bytes_transferred());
        }
    }
}

/// Drops old completed transfers when automatic cleanup is enabled
pub(super) async fn cleanup_loop(manager: TransferManager, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(manager.inner.config.cleanup_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let config = &manager.inner.config;
        if config.auto_cleanup {
            let max_age = chrono::Duration::days(i64::from(config.cleanup_days));
            manager.cleanup_completed(max_age);
        }
    }
}

impl TransferManager {
    /// One maintenance pass
    ///
    /// Starts queued uploads that got a slot, drops broken download sources
    /// and looks for new sources, then retries parked downloads.
    pub async fn run_maintenance(&self) {
        if !self.is_started() {
            return;
        }
        trace!("Maintenance pass");
        self.check_queued_uploads().await;
        self.check_downloads().await;
        self.check_pending_downloads().await;
    }

    async fn check_downloads(&self) {
        for manager in self.active_downloads() {
            if manager.phase() == ManagerPhase::Active
                && let Err(e) = manager.verify_local_unchanged()
            {
                self.break_download_manager(&manager, e.problem(), &e.to_string())
                    .await;
                continue;
            }

            let broken: Vec<_> = manager
                .sources()
                .into_iter()
                .filter(|download| Transfer::is_broken(download.as_ref()))
                .map(|download| download.partner().clone())
                .collect();
            for peer in broken {
                self.remove_download_source(
                    &manager,
                    &peer,
                    TransferProblem::NodeDisconnected,
                    "source disconnected",
                )
                .await;
            }

            if manager.is_active() {
                let file = manager.file().clone();
                self.select_sources(&file, manager.is_automatic(), false)
                    .await;
            }
        }
    }

    async fn check_pending_downloads(&self) {
        let pending: Vec<PendingDownload> = self.inner.pending_downloads.lock().clone();
        for entry in pending {
            if self.inner.folders.folder(&entry.file.folder).is_none() {
                debug!(file = %entry.file.key(), "Folder of pending download gone, dropped");
                self.unpark_pending(&entry.file.key());
                continue;
            }
            let selection = self
                .select_sources(&entry.file, entry.automatic, false)
                .await;
            match selection {
                Selection::Started(_) | Selection::NotNeeded | Selection::Refused => {
                    self.unpark_pending(&entry.file.key());
                }
                Selection::NoSource | Selection::Unavailable => {}
            }
        }
    }
}
