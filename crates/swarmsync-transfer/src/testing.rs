//! In-memory collaborators for tests.
//!
//! [`FakeFolder`] keeps its database in memory and its files in a real
//! directory. [`LoopbackPeer`] either records what is sent to it or forwards
//! every message, in order, to another [`TransferManager`]. [`TestNode`] and
//! [`connect`] wire several managers into a small network.

use crate::config::TransferConfig;
use crate::error::Result;
use crate::manager::TransferManager;
use crate::message::TransferMessage;
use crate::model::{DATABASE_DIR, FileInfo, FolderId, PeerId, modified_ms};
use crate::provider::{ConnectionError, Folder, FolderRepository, Peer, PeerDirectory};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::trace;

/// Config with short timeouts and small parts
#[must_use]
pub fn fast_config() -> TransferConfig {
    TransferConfig {
        part_size: 4096,
        max_requests_queued: 4,
        request_timeout_ms: 2_000,
        first_request_timeout_ms: 2_000,
        wait_time_ms: 50,
        queued_ack_delay_ms: 5,
        partial_stats_interval_ms: 50,
        parts_record_min_size: 1,
        upload_workers: 8,
        ..TransferConfig::default()
    }
}

/// Folder with an in-memory database over a real directory
pub struct FakeFolder {
    id: FolderId,
    root: PathBuf,
    local: Mutex<HashMap<String, FileInfo>>,
    remote: Mutex<HashMap<(PeerId, String), FileInfo>>,
    members: Mutex<Vec<PeerId>>,
    excluded: Mutex<HashSet<String>>,
    denied: Mutex<HashSet<PeerId>>,
    partial: Mutex<HashMap<String, u64>>,
    device_disconnected: AtomicBool,
    accept_downloads: AtomicBool,
    rescans: AtomicUsize,
    ignore_reloads: AtomicUsize,
}

impl FakeFolder {
    /// Folder rooted at `root`
    pub fn new(id: FolderId, root: &Path) -> Arc<Self> {
        Arc::new(Self {
            id,
            root: root.to_path_buf(),
            local: Mutex::new(HashMap::new()),
            remote: Mutex::new(HashMap::new()),
            members: Mutex::new(Vec::new()),
            excluded: Mutex::new(HashSet::new()),
            denied: Mutex::new(HashSet::new()),
            partial: Mutex::new(HashMap::new()),
            device_disconnected: AtomicBool::new(false),
            accept_downloads: AtomicBool::new(true),
            rescans: AtomicUsize::new(0),
            ignore_reloads: AtomicUsize::new(0),
        })
    }

    /// Root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `data` to disk and record it as local version `version`
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written.
    pub fn write_file(&self, path: &str, data: &[u8], version: u32) -> FileInfo {
        let disk = self.root.join(path);
        if let Some(parent) = disk.parent() {
            std::fs::create_dir_all(parent).expect("create parent directory");
        }
        std::fs::write(&disk, data).expect("write file");
        let metadata = std::fs::metadata(&disk).expect("stat file");
        let modified = modified_ms(&metadata).expect("modification time");

        let file = FileInfo::new(self.id.clone(), path, data.len() as u64, modified, version);
        self.set_local(file.clone());
        file
    }

    /// Record a local database entry without touching the disk
    pub fn set_local(&self, file: FileInfo) {
        self.local.lock().insert(file.path.clone(), file);
    }

    /// Local database entry by path
    #[must_use]
    pub fn local(&self, path: &str) -> Option<FileInfo> {
        self.local.lock().get(path).cloned()
    }

    /// Record the version `peer` announced for a file
    pub fn set_remote(&self, peer: &PeerId, file: FileInfo) {
        self.remote
            .lock()
            .insert((peer.clone(), file.path.clone()), file);
    }

    /// Forget what `peer` announced for `path`
    pub fn clear_remote(&self, peer: &PeerId, path: &str) {
        self.remote.lock().remove(&(peer.clone(), path.to_string()));
    }

    /// Add a folder member
    pub fn add_member(&self, peer: &PeerId) {
        let mut members = self.members.lock();
        if !members.contains(peer) {
            members.push(peer.clone());
        }
    }

    /// Exclude a path from syncing
    pub fn exclude(&self, path: &str) {
        self.excluded.lock().insert(path.to_string());
    }

    /// Revoke read permission of a peer
    pub fn deny_read(&self, peer: &PeerId) {
        self.denied.lock().insert(peer.clone());
    }

    /// Simulate the storage device going away
    pub fn set_device_disconnected(&self, disconnected: bool) {
        self.device_disconnected.store(disconnected, Ordering::SeqCst);
    }

    /// Make downloaded files fail verification
    pub fn set_accept_downloads(&self, accept: bool) {
        self.accept_downloads.store(accept, Ordering::SeqCst);
    }

    /// Number of rescans requested
    #[must_use]
    pub fn rescan_count(&self) -> usize {
        self.rescans.load(Ordering::SeqCst)
    }

    /// Number of ignore pattern reloads
    #[must_use]
    pub fn ignore_reload_count(&self) -> usize {
        self.ignore_reloads.load(Ordering::SeqCst)
    }

    /// Last partial-sync byte count reported for `path`
    #[must_use]
    pub fn partial_bytes(&self, path: &str) -> Option<u64> {
        self.partial.lock().get(path).copied()
    }

    fn install(&self, file: &FileInfo, temp_file: &Path) -> std::io::Result<()> {
        let disk = self.disk_path(file);
        if let Some(parent) = disk.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(temp_file, &disk)?;
        let modified = if file.modified_ms >= 0 {
            SystemTime::UNIX_EPOCH + Duration::from_millis(file.modified_ms.unsigned_abs())
        } else {
            SystemTime::UNIX_EPOCH
        };
        std::fs::File::options()
            .write(true)
            .open(&disk)?
            .set_modified(modified)
    }
}

impl Folder for FakeFolder {
    fn id(&self) -> &FolderId {
        &self.id
    }

    fn has_read_permission(&self, peer: &PeerId) -> bool {
        !self.denied.lock().contains(peer)
    }

    fn is_excluded(&self, file: &FileInfo) -> bool {
        self.excluded.lock().contains(&file.path)
    }

    fn is_device_disconnected(&self) -> bool {
        self.device_disconnected.load(Ordering::SeqCst)
    }

    fn local_file(&self, file: &FileInfo) -> Option<FileInfo> {
        self.local(&file.path)
    }

    fn remote_file(&self, peer: &PeerId, file: &FileInfo) -> Option<FileInfo> {
        self.remote
            .lock()
            .get(&(peer.clone(), file.path.clone()))
            .cloned()
    }

    fn newest_version(&self, file: &FileInfo) -> Option<FileInfo> {
        let local = self.local(&file.path);
        let remote = self.remote.lock();
        remote
            .iter()
            .filter(|((_, path), _)| path == &file.path)
            .map(|(_, info)| info)
            .chain(local.iter())
            .fold(None::<&FileInfo>, |newest, candidate| match newest {
                Some(n) if !candidate.is_newer_than(n) => Some(n),
                _ => Some(candidate),
            })
            .cloned()
    }

    fn members(&self) -> Vec<PeerId> {
        self.members.lock().clone()
    }

    fn disk_path(&self, file: &FileInfo) -> PathBuf {
        self.root.join(&file.path)
    }

    fn temp_download_path(&self, file: &FileInfo) -> PathBuf {
        self.root
            .join(DATABASE_DIR)
            .join("temp")
            .join(format!("{}.download", file.path.replace('/', "_")))
    }

    fn scan_download_file(&self, file: &FileInfo, temp_file: &Path) -> bool {
        if !self.accept_downloads.load(Ordering::SeqCst) {
            return false;
        }
        match self.install(file, temp_file) {
            Ok(()) => {
                self.set_local(file.clone());
                true
            }
            Err(e) => {
                trace!("Install of {} failed: {}", file, e);
                false
            }
        }
    }

    fn request_rescan(&self) {
        self.rescans.fetch_add(1, Ordering::SeqCst);
    }

    fn reload_ignore_patterns(&self) {
        self.ignore_reloads.fetch_add(1, Ordering::SeqCst);
    }

    fn record_partial_transfer(&self, file: &FileInfo, bytes: u64) {
        self.partial.lock().insert(file.path.clone(), bytes);
    }
}

/// Folder lookup over [`FakeFolder`]s
#[derive(Default)]
pub struct FakeRepository {
    folders: Mutex<HashMap<FolderId, Arc<FakeFolder>>>,
}

impl FakeRepository {
    /// Join a folder
    pub fn add(&self, folder: Arc<FakeFolder>) {
        self.folders.lock().insert(folder.id().clone(), folder);
    }

    /// Leave a folder
    pub fn remove(&self, id: &FolderId) -> Option<Arc<FakeFolder>> {
        self.folders.lock().remove(id)
    }

    /// Concrete folder
    #[must_use]
    pub fn get(&self, id: &FolderId) -> Option<Arc<FakeFolder>> {
        self.folders.lock().get(id).cloned()
    }
}

impl FolderRepository for FakeRepository {
    fn folder(&self, id: &FolderId) -> Option<Arc<dyn Folder>> {
        let folder = self.get(id)?;
        Some(folder)
    }
}

/// Peer lookup over [`LoopbackPeer`]s
#[derive(Default)]
pub struct FakePeerDirectory {
    peers: Mutex<HashMap<PeerId, Arc<LoopbackPeer>>>,
}

impl FakePeerDirectory {
    /// Register a peer
    pub fn add(&self, peer: Arc<LoopbackPeer>) {
        self.peers.lock().insert(peer.id().clone(), peer);
    }

    /// Concrete peer
    #[must_use]
    pub fn get(&self, id: &PeerId) -> Option<Arc<LoopbackPeer>> {
        self.peers.lock().get(id).cloned()
    }
}

impl PeerDirectory for FakePeerDirectory {
    fn peer(&self, id: &PeerId) -> Option<Arc<dyn Peer>> {
        let peer = self.get(id)?;
        Some(peer)
    }
}

/// Remote peer backed by a channel to another manager, or by nothing
pub struct LoopbackPeer {
    id: PeerId,
    lan: AtomicBool,
    connected: AtomicBool,
    protocol_version: AtomicU32,
    record: AtomicBool,
    sent: Mutex<Vec<TransferMessage>>,
    link: Mutex<Option<mpsc::UnboundedSender<TransferMessage>>>,
}

impl LoopbackPeer {
    fn with_link(id: PeerId, link: Option<mpsc::UnboundedSender<TransferMessage>>) -> Arc<Self> {
        let record = link.is_none();
        Arc::new(Self {
            id,
            lan: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            protocol_version: AtomicU32::new(2),
            record: AtomicBool::new(record),
            sent: Mutex::new(Vec::new()),
            link: Mutex::new(link),
        })
    }

    /// Connected peer that only records what is sent to it
    pub fn detached(id: PeerId) -> Arc<Self> {
        Self::with_link(id, None)
    }

    /// Peer `id` whose messages are handled by `target` as coming from `local`
    ///
    /// Must be called inside a Tokio runtime.
    pub fn linked(id: PeerId, local: PeerId, target: TransferManager) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                target.handle_message(&local, message).await;
            }
        });
        Self::with_link(id, Some(tx))
    }

    /// Messages sent so far (recorded for detached peers, or once enabled)
    #[must_use]
    pub fn sent_messages(&self) -> Vec<TransferMessage> {
        self.sent.lock().clone()
    }

    /// Record sent messages of a linked peer too
    pub fn set_recording(&self, record: bool) {
        self.record.store(record, Ordering::SeqCst);
    }

    /// Mark the peer as reached over the LAN
    pub fn set_lan(&self, lan: bool) {
        self.lan.store(lan, Ordering::SeqCst);
    }

    /// Announce a protocol version
    pub fn set_protocol_version(&self, version: u32) {
        self.protocol_version.store(version, Ordering::SeqCst);
    }

    /// Drop the connection; sends fail from now on
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.link.lock().take();
    }
}

#[async_trait]
impl Peer for LoopbackPeer {
    fn id(&self) -> &PeerId {
        &self.id
    }

    fn is_on_lan(&self) -> bool {
        self.lan.load(Ordering::SeqCst)
    }

    fn is_completely_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn protocol_version(&self) -> u32 {
        self.protocol_version.load(Ordering::SeqCst)
    }

    async fn send_message(&self, message: TransferMessage) -> std::result::Result<(), ConnectionError> {
        if !self.is_completely_connected() {
            return Err(ConnectionError::NotConnected(self.id.clone()));
        }
        if self.record.load(Ordering::SeqCst) {
            self.sent.lock().push(message.clone());
        }
        let link = self.link.lock().clone();
        match link {
            Some(tx) => tx
                .send(message)
                .map_err(|_| ConnectionError::Send(format!("link to {} closed", self.id))),
            None => Ok(()),
        }
    }
}

/// A manager with its own folders and peers
pub struct TestNode {
    /// Node identity, as seen by other nodes
    pub id: PeerId,
    /// Transfer engine of the node
    pub manager: TransferManager,
    /// Joined folders
    pub folders: Arc<FakeRepository>,
    /// Known peers
    pub peers: Arc<FakePeerDirectory>,
}

impl TestNode {
    /// Create a node on the current runtime
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(id: &str, config: TransferConfig) -> Result<Self> {
        let folders = Arc::new(FakeRepository::default());
        let peers = Arc::new(FakePeerDirectory::default());
        let manager = TransferManager::new(config, folders.clone(), peers.clone())?;
        Ok(Self {
            id: PeerId::new(id),
            manager,
            folders,
            peers,
        })
    }

    /// Join a folder rooted at `root`
    pub fn join(&self, id: &FolderId, root: &Path) -> Arc<FakeFolder> {
        let folder = FakeFolder::new(id.clone(), root);
        self.folders.add(Arc::clone(&folder));
        folder
    }

    /// Joined folder
    #[must_use]
    pub fn folder(&self, id: &FolderId) -> Option<Arc<FakeFolder>> {
        self.folders.get(id)
    }

    /// How this node reaches `peer`
    #[must_use]
    pub fn peer(&self, peer: &PeerId) -> Option<Arc<LoopbackPeer>> {
        self.peers.get(peer)
    }
}

/// Connect two nodes both ways
///
/// Returns `(b as seen by a, a as seen by b)`.
pub fn connect(a: &TestNode, b: &TestNode) -> (Arc<LoopbackPeer>, Arc<LoopbackPeer>) {
    let b_at_a = LoopbackPeer::linked(b.id.clone(), a.id.clone(), b.manager.clone());
    let a_at_b = LoopbackPeer::linked(a.id.clone(), b.id.clone(), a.manager.clone());
    a.peers.add(Arc::clone(&b_at_a));
    b.peers.add(Arc::clone(&a_at_b));
    (b_at_a, a_at_b)
}

/// Make `file` of `owner` known to `node` as announced by `owner`
pub fn announce(node: &TestNode, owner: &TestNode, file: &FileInfo) {
    if let Some(folder) = node.folder(&file.folder) {
        folder.add_member(&owner.id);
        folder.set_remote(&owner.id, file.clone());
    }
}
