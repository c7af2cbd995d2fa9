//! Download state kept across restarts.
//!
//! One JSON file per configuration profile lists pending, in-progress and
//! completed downloads as plain records, independent of the runtime objects.
//! The file is written to a temp path and renamed into place. A file that
//! cannot be read or parsed is deleted and treated as empty.

use crate::error::Result;
use crate::model::{FileInfo, PeerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Format version of the state file
pub const STATE_FILE_VERSION: u32 = 1;

/// Stage of a persisted download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedStatus {
    /// Waiting for a source
    Pending,
    /// Was running at shutdown
    InProgress,
    /// Installed
    Completed,
}

/// One download as stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTransfer {
    /// File version
    pub file: FileInfo,
    /// Requested by background sync logic
    pub automatic: bool,
    /// Stage at shutdown
    pub status: PersistedStatus,
    /// Peers that contributed chunks
    #[serde(default)]
    pub peers: Vec<PeerId>,
    /// Completion time of a completed download
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    saved_at: DateTime<Utc>,
    transfers: Vec<PersistedTransfer>,
}

/// Reads and writes the state file of one profile
#[derive(Debug, Clone)]
pub struct TransferStore {
    path: PathBuf,
}

impl TransferStore {
    /// Store for `profile` inside `dir`
    #[must_use]
    pub fn new(dir: impl AsRef<Path>, profile: &str) -> Self {
        Self {
            path: dir.as_ref().join(format!("{}.transfers.json", profile)),
        }
    }

    /// Location of the state file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted downloads
    ///
    /// A missing file yields an empty list. An unreadable or corrupt file is
    /// deleted and also yields an empty list.
    pub async fn load(&self) -> Vec<PersistedTransfer> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                error!(path = %self.path.display(), "Unable to read transfer state: {}", e);
                self.discard().await;
                return Vec::new();
            }
        };

        match serde_json::from_slice::<StateFile>(&bytes) {
            Ok(state) if state.version == STATE_FILE_VERSION => {
                info!(
                    path = %self.path.display(),
                    transfers = state.transfers.len(),
                    "Transfer state loaded"
                );
                state.transfers
            }
            Ok(state) => {
                error!(
                    path = %self.path.display(),
                    "Unsupported transfer state version {}",
                    state.version
                );
                self.discard().await;
                Vec::new()
            }
            Err(e) => {
                error!(path = %self.path.display(), "Corrupt transfer state: {}", e);
                self.discard().await;
                Vec::new()
            }
        }
    }

    /// Replace the state file with `transfers`
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub async fn store(&self, transfers: &[PersistedTransfer]) -> Result<()> {
        let state = StateFile {
            version: STATE_FILE_VERSION,
            saved_at: Utc::now(),
            transfers: transfers.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&state)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(
            path = %self.path.display(),
            transfers = transfers.len(),
            "Transfer state stored"
        );
        Ok(())
    }

    async fn discard(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            debug!(path = %self.path.display(), "State file not removed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FolderId;

    fn record(path: &str, status: PersistedStatus) -> PersistedTransfer {
        PersistedTransfer {
            file: FileInfo::new(FolderId::new("docs"), path, 42, 1_700_000_000_000, 2),
            automatic: false,
            status,
            peers: vec![PeerId::new("b")],
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = TransferStore::new(dir.path(), "default");
        assert!(store.load().await.is_empty());

        let transfers = vec![
            record("a.txt", PersistedStatus::Pending),
            record("b.txt", PersistedStatus::Completed),
        ];
        store.store(&transfers).await.unwrap();
        assert!(store.path().ends_with("default.transfers.json"));
        assert_eq!(store.load().await, transfers);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = TransferStore::new(dir.path(), "default");
        std::fs::write(store.path(), b"{ not json").unwrap();

        assert!(store.load().await.is_empty());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_profiles_are_separate() {
        let dir = tempfile::tempdir().unwrap();
        let work = TransferStore::new(dir.path(), "work");
        let home = TransferStore::new(dir.path(), "home");
        work.store(&[record("a.txt", PersistedStatus::InProgress)])
            .await
            .unwrap();

        assert_eq!(work.load().await.len(), 1);
        assert!(home.load().await.is_empty());
    }
}
