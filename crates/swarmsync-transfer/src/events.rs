//! Transfer events for the UI and other collaborators.
//!
//! Publishing is fire-and-forget: listeners return nothing and cannot veto.

use crate::download::Download;
use crate::download_manager::DownloadManager;
use crate::error::TransferProblem;
use crate::model::{FileInfo, PeerId};
use crate::upload::Upload;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::trace;

/// Something happened to an upload or download
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A peer requested a file
    UploadRequested(Arc<Upload>),
    /// Request waits for a free upload slot
    UploadQueued(Arc<Upload>),
    /// Upload worker started
    UploadStarted(Arc<Upload>),
    /// Upload cancelled
    UploadAborted(Arc<Upload>),
    /// Upload failed
    UploadBroken {
        /// Upload concerned
        upload: Arc<Upload>,
        /// Typed reason
        problem: TransferProblem,
        /// Human-readable detail
        detail: String,
    },
    /// Upload finished
    UploadCompleted(Arc<Upload>),
    /// Completed upload dropped from the completed list
    CompletedUploadRemoved(Arc<Upload>),
    /// Source requested from a peer
    DownloadRequested(Arc<Download>),
    /// Peer queued our request
    DownloadQueued(Arc<Download>),
    /// Peer started serving a source
    DownloadStarted(Arc<Download>),
    /// Download cancelled
    DownloadAborted(Arc<DownloadManager>),
    /// Download or one of its sources failed
    DownloadBroken {
        /// Download concerned
        manager: Arc<DownloadManager>,
        /// Failed source, none if the whole download broke
        source: Option<PeerId>,
        /// Typed reason
        problem: TransferProblem,
        /// Human-readable detail
        detail: String,
    },
    /// File downloaded and installed
    DownloadCompleted(Arc<DownloadManager>),
    /// No source available, download parked until one appears
    PendingDownloadEnqueued(FileInfo),
    /// Completed download dropped from the completed list
    CompletedDownloadRemoved(Arc<DownloadManager>),
}

impl TransferEvent {
    /// Short name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::UploadRequested(_) => "upload-requested",
            Self::UploadQueued(_) => "upload-queued",
            Self::UploadStarted(_) => "upload-started",
            Self::UploadAborted(_) => "upload-aborted",
            Self::UploadBroken { .. } => "upload-broken",
            Self::UploadCompleted(_) => "upload-completed",
            Self::CompletedUploadRemoved(_) => "completed-upload-removed",
            Self::DownloadRequested(_) => "download-requested",
            Self::DownloadQueued(_) => "download-queued",
            Self::DownloadStarted(_) => "download-started",
            Self::DownloadAborted(_) => "download-aborted",
            Self::DownloadBroken { .. } => "download-broken",
            Self::DownloadCompleted(_) => "download-completed",
            Self::PendingDownloadEnqueued(_) => "pending-download-enqueued",
            Self::CompletedDownloadRemoved(_) => "completed-download-removed",
        }
    }
}

/// Receiver of transfer events
pub trait TransferListener: Send + Sync {
    /// Called for every published event
    fn on_event(&self, event: &TransferEvent);
}

impl<F> TransferListener for F
where
    F: Fn(&TransferEvent) + Send + Sync,
{
    fn on_event(&self, event: &TransferEvent) {
        self(event)
    }
}

/// Handle to remove a listener again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Typed publish/subscribe hub
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn TransferListener>)>>,
    next_id: AtomicU64,
    suppressed: AtomicBool,
}

impl EventBus {
    /// Create a bus without listeners
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn subscribe(&self, listener: Arc<dyn TransferListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Remove a listener, returns whether it was registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Drop every event while set
    pub fn set_suppressed(&self, suppressed: bool) {
        self.suppressed.store(suppressed, Ordering::Relaxed);
    }

    /// Deliver an event to every listener
    pub fn publish(&self, event: TransferEvent) {
        if self.suppressed.load(Ordering::Relaxed) {
            return;
        }
        trace!("Event {}", event.name());

        // Listeners may subscribe from inside a callback
        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener.on_event(&event);
        }
    }

    /// Number of registered listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("suppressed", &self.suppressed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FolderId;
    use parking_lot::Mutex;

    fn pending_event() -> TransferEvent {
        TransferEvent::PendingDownloadEnqueued(FileInfo::new(FolderId::new("f"), "a.txt", 1, 0, 1))
    }

    #[test]
    fn test_publish_subscribe() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = bus.subscribe(Arc::new(move |event: &TransferEvent| {
            sink.lock().push(event.name());
        }));

        bus.publish(pending_event());
        assert_eq!(*seen.lock(), vec!["pending-download-enqueued"]);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(pending_event());
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_suppressed() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&count);
        bus.subscribe(Arc::new(move |_: &TransferEvent| {
            sink.fetch_add(1, Ordering::Relaxed);
        }));

        bus.set_suppressed(true);
        bus.publish(pending_event());
        assert_eq!(count.load(Ordering::Relaxed), 0);

        bus.set_suppressed(false);
        bus.publish(pending_event());
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
