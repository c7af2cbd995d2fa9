//! Engine scenarios driven through the public transfer manager API
//!
//! Tests for:
//! - Upload requests: queueing, slot admission and the queued acknowledgement
//! - Request queue overflow
//! - Files touched on disk while being served
//! - Source selection for the newest version
//! - Source loss and running out of sources
//! - One download manager per file under concurrent requests
//! - Repeated requests for files already in sync
//! - Replaced uploads, outdated downloads and folder removal
//! - Unavailable folders and automatic requests without sources
//! - Retention of completed transfers
//! - Sources appearing while a download runs
//! - Malformed parts records

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use swarmsync_files::{FilePartsRecord, PartInfo};
use swarmsync_integration_tests::{EventLog, init_tracing, pattern, wait_until};
use swarmsync_transfer::testing::{LoopbackPeer, TestNode, fast_config};
use swarmsync_transfer::{
    BreakScope, FileInfo, FolderId, PeerId, Transfer, TransferMessage, TransferProblem,
};
use tempfile::TempDir;

fn sent(peer: &LoopbackPeer, name: &str) -> usize {
    peer.sent_messages()
        .iter()
        .filter(|message| message.name() == name)
        .count()
}

fn detached(node: &TestNode, id: &str) -> (PeerId, Arc<LoopbackPeer>) {
    let id = PeerId::new(id);
    let peer = LoopbackPeer::detached(id.clone());
    node.peers.add(Arc::clone(&peer));
    (id, peer)
}

#[tokio::test]
async fn test_upload_request_started_without_queued_ack() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let node = TestNode::new("uploader", fast_config()).unwrap();
    let folder = node.join(&FolderId::new("docs"), dir.path());
    let file = folder.write_file("report.pdf", &pattern(1024 * 1024, 1), 3);
    let (downloader, peer) = detached(&node, "downloader");
    let log = EventLog::attach(&node.manager);
    node.manager.start().await;

    let upload = node
        .manager
        .queue_upload(&downloader, file.clone(), 0)
        .await
        .expect("upload accepted");
    assert_eq!(upload.file(), &file);
    assert!(upload.core().is_started());

    assert!(wait_until(Duration::from_secs(2), || sent(&peer, "StartUpload") == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sent(&peer, "DownloadQueued"), 0);
    assert!(log.contains("upload-requested"));
    assert!(log.contains("upload-started"));
    assert!(!log.contains("upload-queued"));

    node.manager.shutdown().await;
}

#[tokio::test]
async fn test_upload_waits_for_slot_and_acknowledges() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = fast_config();
    config.max_concurrent_uploads = 1;
    let node = TestNode::new("uploader", config).unwrap();
    let folder = node.join(&FolderId::new("docs"), dir.path());
    let file = folder.write_file("report.pdf", &pattern(64 * 1024, 2), 3);
    let (first, _) = detached(&node, "first");
    let (second, second_peer) = detached(&node, "second");
    let (neighbour, neighbour_peer) = detached(&node, "neighbour");
    neighbour_peer.set_lan(true);
    node.manager.start().await;

    let running = node.manager.queue_upload(&first, file.clone(), 0).await.unwrap();
    let waiting = node.manager.queue_upload(&second, file.clone(), 0).await.unwrap();
    assert!(running.core().is_started());
    assert!(!waiting.core().is_started());
    assert_eq!(node.manager.queued_uploads().len(), 1);

    // Not started within the ack delay: the peer learns it is queued
    assert!(wait_until(Duration::from_secs(1), || sent(&second_peer, "DownloadQueued") == 1).await);

    // LAN peers do not count against the WAN slots
    let lan = node.manager.queue_upload(&neighbour, file.clone(), 0).await.unwrap();
    assert!(lan.core().is_started());

    // The first upload idles out, freeing the slot
    assert!(wait_until(Duration::from_secs(5), || waiting.core().is_started()).await);
    assert!(running.core().is_completed());

    node.manager.shutdown().await;
}

#[tokio::test]
async fn test_request_refused_for_unknown_version() {
    let dir = TempDir::new().unwrap();
    let node = TestNode::new("uploader", fast_config()).unwrap();
    let folder = node.join(&FolderId::new("docs"), dir.path());
    let mut file = folder.write_file("report.pdf", &pattern(1000, 3), 3);
    let (downloader, _) = detached(&node, "downloader");
    node.manager.start().await;

    file.version = 4;
    assert!(node.manager.queue_upload(&downloader, file.clone(), 0).await.is_none());
    assert_eq!(folder.rescan_count(), 1);

    folder.deny_read(&downloader);
    file.version = 3;
    assert!(node.manager.queue_upload(&downloader, file, 0).await.is_none());
    assert!(node.manager.active_uploads().is_empty());

    node.manager.shutdown().await;
}

#[tokio::test]
async fn test_request_queue_overflow_breaks_upload() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = fast_config();
    config.max_concurrent_uploads = 1;
    let limit = config.upload_queue_limit();
    let node = TestNode::new("uploader", config).unwrap();
    let folder = node.join(&FolderId::new("docs"), dir.path());
    let file = folder.write_file("big.bin", &pattern(100_000, 4), 1);
    let (busy, _) = detached(&node, "busy");
    let (target, target_peer) = detached(&node, "target");
    let log = EventLog::attach(&node.manager);
    node.manager.start().await;

    node.manager.queue_upload(&busy, file.clone(), 0).await.unwrap();
    let upload = node.manager.queue_upload(&target, file.clone(), 0).await.unwrap();
    assert!(!upload.core().is_started());

    let request = || TransferMessage::RequestPart {
        file: file.clone(),
        range: 0..1000,
    };
    for _ in 0..limit {
        node.manager.handle_message(&target, request()).await;
    }
    assert_eq!(upload.pending_requests(), limit);
    assert!(!upload.core().is_done());

    node.manager.handle_message(&target, request()).await;
    let (problem, _) = upload.core().problem().expect("upload broken");
    assert_eq!(problem, TransferProblem::TransferException);
    assert!(node.manager.queued_uploads().is_empty());
    assert!(
        node.manager
            .active_uploads()
            .iter()
            .all(|u| u.partner() != &target)
    );
    assert_eq!(sent(&target_peer, "AbortUpload"), 1);
    assert!(log.contains("upload-broken"));

    node.manager.shutdown().await;
}

#[tokio::test]
async fn test_file_touched_while_serving_breaks_upload() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let node = TestNode::new("uploader", fast_config()).unwrap();
    let folder = node.join(&FolderId::new("docs"), dir.path());
    let file = folder.write_file("a.bin", &pattern(50_000, 5), 1);
    let (downloader, peer) = detached(&node, "downloader");
    node.manager.start().await;

    let upload = node.manager.queue_upload(&downloader, file.clone(), 0).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || sent(&peer, "StartUpload") == 1).await);

    let shifted = SystemTime::UNIX_EPOCH + Duration::from_millis((file.modified_ms + 2500) as u64);
    std::fs::File::options()
        .write(true)
        .open(dir.path().join("a.bin"))
        .unwrap()
        .set_modified(shifted)
        .unwrap();

    node.manager
        .handle_message(
            &downloader,
            TransferMessage::RequestPart {
                file: file.clone(),
                range: 0..4096,
            },
        )
        .await;

    assert!(wait_until(Duration::from_secs(2), || upload.core().is_broken()).await);
    let (problem, detail) = upload.core().problem().unwrap();
    assert_eq!(problem, TransferProblem::FileChanged);
    assert!(detail.contains("last modification date mismatch"), "{}", detail);
    assert!(folder.rescan_count() >= 1);
    assert!(wait_until(Duration::from_secs(1), || sent(&peer, "AbortUpload") == 1).await);
    assert!(node.manager.active_uploads().is_empty());
    assert_eq!(sent(&peer, "FileChunk"), 0);

    node.manager.shutdown().await;
}

#[tokio::test]
async fn test_newest_version_selected_from_announcing_peer() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let node = TestNode::new("local", fast_config()).unwrap();
    let folder_id = FolderId::new("shared");
    let folder = node.join(&folder_id, dir.path());
    let local = folder.write_file("x.txt", &pattern(3000, 6), 2);
    let (b, b_peer) = detached(&node, "b");
    let (c, _) = detached(&node, "c");
    node.manager.start().await;

    let mut newest = local.clone();
    newest.version = 3;
    newest.size = 4000;
    folder.add_member(&b);
    folder.add_member(&c);
    folder.set_remote(&b, newest.clone());
    // c still announces the version we already have
    folder.set_remote(&c, local.clone());

    let manager = node
        .manager
        .download_newest_version(&local, false)
        .await
        .expect("download started");
    assert_eq!(manager.file(), &newest);
    let sources = manager.sources();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].partner(), &b);
    assert_eq!(sent(&b_peer, "RequestDownload"), 1);

    node.manager.shutdown().await;
}

#[tokio::test]
async fn test_source_loss_and_out_of_sources() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let node = TestNode::new("local", fast_config()).unwrap();
    let folder = node.join(&FolderId::new("shared"), dir.path());
    let (a, a_peer) = detached(&node, "member-a");
    let (b, b_peer) = detached(&node, "member-b");
    let log = EventLog::attach(&node.manager);
    node.manager.start().await;

    let file = swarmsync_transfer::FileInfo::new(
        FolderId::new("shared"),
        "movie.mkv",
        500_000,
        1_700_000_000_000,
        7,
    );
    for peer in [&a, &b] {
        folder.add_member(peer);
        folder.set_remote(peer, file.clone());
    }

    let manager = node.manager.download_newest_version(&file, false).await.unwrap();
    assert_eq!(manager.source_count(), 2);

    a_peer.disconnect();
    node.manager
        .break_transfers(BreakScope::Peer(a.clone()), TransferProblem::NodeDisconnected)
        .await;
    assert!(manager.is_active());
    assert_eq!(manager.source_count(), 1);
    assert!(manager.has_source(&b));
    assert_eq!(node.manager.active_downloads().len(), 1);

    b_peer.disconnect();
    node.manager.peer_disconnected(&b).await;
    assert!(manager.is_broken());
    assert_eq!(manager.problem().unwrap().0, TransferProblem::OutOfSources);
    assert!(node.manager.active_downloads().is_empty());
    // A user request is kept until a source comes back
    assert_eq!(node.manager.pending_downloads(), vec![file]);
    assert!(log.contains("pending-download-enqueued"));

    node.manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_requests_share_one_manager() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let node = TestNode::new("local", fast_config()).unwrap();
    let folder = node.join(&FolderId::new("shared"), dir.path());
    let (a, _) = detached(&node, "a");
    let (b, _) = detached(&node, "b");
    node.manager.start().await;

    let file = swarmsync_transfer::FileInfo::new(
        FolderId::new("shared"),
        "data.bin",
        200_000,
        1_700_000_000_000,
        1,
    );
    for peer in [&a, &b] {
        folder.add_member(peer);
        folder.set_remote(peer, file.clone());
    }

    let (first, second) = tokio::join!(
        node.manager.download_newest_version(&file, true),
        node.manager.download_newest_version(&file, false),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(node.manager.active_downloads().len(), 1);
    assert_eq!(first.source_count(), 2);

    node.manager.shutdown().await;
}

#[tokio::test]
async fn test_file_in_sync_is_not_downloaded() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let node = TestNode::new("local", fast_config())?;
    let folder = node.join(&FolderId::new("shared"), dir.path());
    let file = folder.write_file("notes.txt", &pattern(2048, 7), 5);
    let (peer, _) = detached(&node, "peer");
    folder.add_member(&peer);
    folder.set_remote(&peer, file.clone());
    node.manager.start().await;

    for _ in 0..3 {
        assert!(node.manager.download_newest_version(&file, false).await.is_none());
    }
    assert!(node.manager.active_downloads().is_empty());
    assert!(node.manager.pending_downloads().is_empty());

    node.manager.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_excluded_and_internal_files() {
    let dir = TempDir::new().unwrap();
    let node = TestNode::new("local", fast_config()).unwrap();
    let folder = node.join(&FolderId::new("shared"), dir.path());
    let (peer, _) = detached(&node, "peer");
    folder.add_member(&peer);
    node.manager.start().await;

    let file = swarmsync_transfer::FileInfo::new(FolderId::new("shared"), "tmp.log", 10, 0, 1);
    folder.set_remote(&peer, file.clone());
    folder.exclude("tmp.log");
    assert!(node.manager.download_newest_version(&file, false).await.is_none());
    assert!(node.manager.pending_downloads().is_empty());

    let internal = swarmsync_transfer::FileInfo::new(
        FolderId::new("shared"),
        ".swarmsync/db",
        10,
        0,
        1,
    );
    assert!(node.manager.queue_upload(&peer, internal, 0).await.is_none());

    node.manager.shutdown().await;
}

fn remote_file(folder: &str, path: &str, size: u64, version: u32) -> FileInfo {
    FileInfo::new(FolderId::new(folder), path, size, 1_700_000_000_000, version)
}

#[tokio::test]
async fn test_repeated_request_replaces_old_upload() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let node = TestNode::new("uploader", fast_config()).unwrap();
    let folder = node.join(&FolderId::new("docs"), dir.path());
    let file = folder.write_file("report.pdf", &pattern(200_000, 8), 3);
    let (downloader, _) = detached(&node, "downloader");
    let log = EventLog::attach(&node.manager);
    node.manager.start().await;

    let first = node.manager.queue_upload(&downloader, file.clone(), 0).await.unwrap();
    let second = node.manager.queue_upload(&downloader, file.clone(), 0).await.unwrap();

    let (problem, _) = first.core().problem().expect("first upload replaced");
    assert_eq!(problem, TransferProblem::OldUpload);
    assert!(!second.core().is_done());
    let uploads: Vec<_> = node
        .manager
        .active_uploads()
        .into_iter()
        .chain(node.manager.queued_uploads())
        .collect();
    assert_eq!(uploads.len(), 1);
    assert!(Arc::ptr_eq(&uploads[0], &second));
    assert!(log.contains("upload-broken"));

    node.manager.shutdown().await;
}

#[tokio::test]
async fn test_newer_version_breaks_running_download() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let node = TestNode::new("local", fast_config()).unwrap();
    let folder = node.join(&FolderId::new("shared"), dir.path());
    let (a, _) = detached(&node, "a");
    let (b, b_peer) = detached(&node, "b");
    node.manager.start().await;

    let old = remote_file("shared", "plan.odt", 100_000, 7);
    folder.add_member(&a);
    folder.set_remote(&a, old.clone());
    let running = node.manager.download_newest_version(&old, false).await.unwrap();
    assert_eq!(running.file().version, 7);

    let mut newer = old.clone();
    newer.version = 8;
    newer.size = 120_000;
    folder.add_member(&b);
    folder.set_remote(&b, newer.clone());

    let replacement = node.manager.download_newest_version(&old, false).await.unwrap();
    assert!(running.is_broken());
    assert_eq!(running.problem().unwrap().0, TransferProblem::VersionMismatch);
    assert_eq!(replacement.file(), &newer);
    assert!(replacement.has_source(&b));
    assert!(!replacement.has_source(&a));
    assert_eq!(sent(&b_peer, "RequestDownload"), 1);

    let active = node.manager.active_downloads();
    assert_eq!(active.len(), 1);
    assert!(Arc::ptr_eq(&active[0], &replacement));
    assert!(node.manager.pending_downloads().is_empty());

    node.manager.shutdown().await;
}

#[tokio::test]
async fn test_folder_removal_breaks_transfers_and_drops_pending() {
    init_tracing();
    let shared_dir = TempDir::new().unwrap();
    let other_dir = TempDir::new().unwrap();
    let node = TestNode::new("local", fast_config()).unwrap();
    let shared_id = FolderId::new("shared");
    let shared = node.join(&shared_id, shared_dir.path());
    node.join(&FolderId::new("other"), other_dir.path());
    let (a, a_peer) = detached(&node, "a");
    let log = EventLog::attach(&node.manager);
    node.manager.start().await;

    let wanted = remote_file("shared", "wanted.bin", 50_000, 2);
    shared.add_member(&a);
    shared.set_remote(&a, wanted.clone());
    let download = node.manager.download_newest_version(&wanted, false).await.unwrap();

    let served = shared.write_file("served.txt", &pattern(30_000, 9), 1);
    let upload = node.manager.queue_upload(&a, served, 0).await.unwrap();

    // Nobody serves these, so both are parked
    let later = remote_file("shared", "later.bin", 10, 1);
    let elsewhere = remote_file("other", "elsewhere.bin", 10, 1);
    assert!(node.manager.download_newest_version(&later, false).await.is_none());
    assert!(node.manager.download_newest_version(&elsewhere, false).await.is_none());
    assert_eq!(node.manager.pending_downloads().len(), 2);

    node.manager
        .break_transfers(BreakScope::Folder(shared_id), TransferProblem::FolderRemoved)
        .await;

    assert!(download.is_broken());
    assert_eq!(download.problem().unwrap().0, TransferProblem::FolderRemoved);
    assert_eq!(upload.core().problem().unwrap().0, TransferProblem::FolderRemoved);
    assert!(node.manager.active_downloads().is_empty());
    assert!(node.manager.uploads_of_folder(&FolderId::new("shared")).is_empty());
    assert_eq!(node.manager.pending_downloads(), vec![elsewhere]);
    assert!(wait_until(Duration::from_secs(1), || sent(&a_peer, "AbortUpload") == 1).await);
    assert!(log.contains("download-broken"));

    node.manager.shutdown().await;
}

#[tokio::test]
async fn test_disconnected_device_refuses_download() {
    let dir = TempDir::new().unwrap();
    let node = TestNode::new("local", fast_config()).unwrap();
    let folder = node.join(&FolderId::new("shared"), dir.path());
    let (a, a_peer) = detached(&node, "a");
    node.manager.start().await;

    let file = remote_file("shared", "photo.jpg", 40_000, 1);
    folder.add_member(&a);
    folder.set_remote(&a, file.clone());
    folder.set_device_disconnected(true);

    assert!(node.manager.download_newest_version(&file, false).await.is_none());
    assert!(node.manager.active_downloads().is_empty());
    assert!(node.manager.pending_downloads().is_empty());
    assert_eq!(sent(&a_peer, "RequestDownload"), 0);

    folder.set_device_disconnected(false);
    assert!(node.manager.download_newest_version(&file, false).await.is_some());

    node.manager.shutdown().await;
}

#[tokio::test]
async fn test_automatic_request_without_source_is_not_parked() {
    let dir = TempDir::new().unwrap();
    let node = TestNode::new("local", fast_config()).unwrap();
    node.join(&FolderId::new("shared"), dir.path());
    let log = EventLog::attach(&node.manager);
    node.manager.start().await;

    let file = remote_file("shared", "orphan.bin", 1000, 4);
    assert!(node.manager.download_newest_version(&file, true).await.is_none());
    assert!(node.manager.pending_downloads().is_empty());
    assert!(node.manager.active_downloads().is_empty());
    assert!(!log.contains("pending-download-enqueued"));

    node.manager.shutdown().await;
}

#[tokio::test]
async fn test_cleanup_removes_completed_by_age() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let node = TestNode::new("uploader", fast_config()).unwrap();
    let folder = node.join(&FolderId::new("docs"), dir.path());
    let file = folder.write_file("report.pdf", &pattern(4096, 10), 1);
    let (downloader, _) = detached(&node, "downloader");
    let log = EventLog::attach(&node.manager);
    node.manager.start().await;

    node.manager.queue_upload(&downloader, file.clone(), 0).await.unwrap();
    node.manager
        .handle_message(&downloader, TransferMessage::StopUpload { file })
        .await;
    assert!(
        wait_until(Duration::from_secs(2), || node.manager.completed_uploads().len() == 1).await
    );

    assert_eq!(node.manager.cleanup_completed(chrono::Duration::hours(1)), 0);
    assert_eq!(node.manager.completed_uploads().len(), 1);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(node.manager.cleanup_completed(chrono::Duration::milliseconds(10)), 1);
    assert!(node.manager.completed_uploads().is_empty());
    assert!(log.contains("completed-upload-removed"));

    node.manager.shutdown().await;
}

#[tokio::test]
async fn test_maintenance_attaches_new_source() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let node = TestNode::new("local", fast_config()).unwrap();
    let folder = node.join(&FolderId::new("shared"), dir.path());
    let (a, _) = detached(&node, "a");
    let (b, b_peer) = detached(&node, "b");
    node.manager.start().await;

    let file = remote_file("shared", "archive.zip", 300_000, 2);
    folder.add_member(&a);
    folder.set_remote(&a, file.clone());
    let manager = node.manager.download_newest_version(&file, false).await.unwrap();
    assert_eq!(manager.source_count(), 1);

    folder.add_member(&b);
    folder.set_remote(&b, file.clone());

    assert!(wait_until(Duration::from_secs(2), || manager.has_source(&b)).await);
    assert_eq!(manager.source_count(), 2);
    assert!(wait_until(Duration::from_secs(1), || sent(&b_peer, "RequestDownload") == 1).await);

    node.manager.shutdown().await;
}

#[tokio::test]
async fn test_malformed_parts_record_is_ignored() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let node = TestNode::new("local", fast_config()).unwrap();
    let folder = node.join(&FolderId::new("shared"), dir.path());
    // A previous local version makes the download ask for the parts record
    let local = folder.write_file("disk.img", &pattern(20_000, 11), 1);
    let (a, a_peer) = detached(&node, "a");
    node.manager.start().await;

    let mut file = local.clone();
    file.version = 2;
    file.size = 30_000;
    folder.add_member(&a);
    folder.set_remote(&a, file.clone());
    let manager = node.manager.download_newest_version(&file, false).await.unwrap();

    node.manager
        .handle_message(&a, TransferMessage::StartUpload { file: file.clone() })
        .await;
    assert_eq!(sent(&a_peer, "RequestPartsRecord"), 1);
    assert_eq!(sent(&a_peer, "RequestPart"), 0);

    let record = FilePartsRecord {
        block_size: 1 << 44,
        file_size: file.size,
        file_hash: [0u8; 32],
        parts: vec![PartInfo {
            index: 0,
            weak: 1,
            strong: [0u8; 32],
        }],
    };
    node.manager
        .handle_message(
            &a,
            TransferMessage::ReplyPartsRecord {
                file: file.clone(),
                record,
            },
        )
        .await;

    assert!(manager.is_active());
    assert!(sent(&a_peer, "RequestPart") > 0);
    assert_eq!(manager.counter().bytes_transferred(), 0);

    node.manager.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_download_breaks_upload() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let node = TestNode::new("uploader", fast_config()).unwrap();
    let folder = node.join(&FolderId::new("docs"), dir.path());
    let file = folder.write_file("slides.pdf", &pattern(80_000, 12), 2);
    let (downloader, peer) = detached(&node, "downloader");
    let log = EventLog::attach(&node.manager);
    node.manager.start().await;

    let upload = node.manager.queue_upload(&downloader, file.clone(), 0).await.unwrap();
    node.manager
        .handle_message(&downloader, TransferMessage::AbortDownload { file })
        .await;

    let (problem, _) = upload.core().problem().expect("upload ended");
    assert_eq!(problem, TransferProblem::BrokenDownload);
    assert!(node.manager.active_uploads().is_empty());
    assert_eq!(sent(&peer, "AbortUpload"), 0);
    assert!(log.contains("upload-broken"));

    node.manager.shutdown().await;
}

#[tokio::test]
async fn test_oversized_part_request_breaks_upload() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let node = TestNode::new("uploader", fast_config()).unwrap();
    let folder = node.join(&FolderId::new("docs"), dir.path());
    let (downloader, peer) = detached(&node, "downloader");
    node.manager.start().await;

    // Sparse file larger than a single part may be
    let size = 17 * 1024 * 1024;
    let path = dir.path().join("disk.img");
    let handle = std::fs::File::create(&path).unwrap();
    handle.set_len(size).unwrap();
    drop(handle);
    let modified = std::fs::metadata(&path)
        .unwrap()
        .modified()
        .unwrap()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    let file = FileInfo::new(FolderId::new("docs"), "disk.img", size, modified, 1);
    folder.set_local(file.clone());

    let upload = node.manager.queue_upload(&downloader, file.clone(), 0).await.unwrap();
    node.manager
        .handle_message(
            &downloader,
            TransferMessage::RequestPart {
                file,
                range: 0..size,
            },
        )
        .await;

    let (problem, _) = upload.core().problem().expect("upload broken");
    assert_eq!(problem, TransferProblem::InvalidPart);
    assert!(wait_until(Duration::from_secs(1), || sent(&peer, "AbortUpload") == 1).await);
    assert_eq!(sent(&peer, "FileChunk"), 0);

    node.manager.shutdown().await;
}
