//! Parts records of local files, computed on demand and cached per version.

use crate::error::{Result, TransferError};
use crate::model::{FileInfo, FileKey};
use crate::provider::Folder;
use dashmap::DashMap;
use std::sync::Arc;
use swarmsync_files::{FilePartsRecord, record_block_size};
use tracing::debug;

struct CachedRecord {
    file: FileInfo,
    record: Arc<FilePartsRecord>,
}

/// Computes and caches [`FilePartsRecord`]s
#[derive(Default)]
pub struct FileRecordProvider {
    cache: DashMap<FileKey, CachedRecord>,
}

impl FileRecordProvider {
    /// Create an empty provider
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parts record of `file` as stored in `folder`
    ///
    /// Served from the cache when the same version was computed before;
    /// otherwise hashed on a blocking thread, reporting progress between 0.0
    /// and 1.0.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or changed size.
    pub async fn retrieve_record<F>(
        &self,
        folder: &Arc<dyn Folder>,
        file: &FileInfo,
        progress: F,
    ) -> Result<Arc<FilePartsRecord>>
    where
        F: FnMut(f64) + Send + 'static,
    {
        let key = file.key();
        let cached = self
            .cache
            .get(&key)
            .filter(|entry| entry.file.is_version_date_and_size_identical(file))
            .map(|entry| Arc::clone(&entry.record));
        if let Some(record) = cached {
            debug!(file = %key, "Parts record served from cache");
            return Ok(record);
        }

        let path = folder.disk_path(file);
        let block_size = record_block_size(file.size);
        let record = tokio::task::spawn_blocking(move || {
            FilePartsRecord::compute(&path, block_size, progress)
        })
        .await
        .map_err(|e| TransferError::TaskJoin(e.to_string()))??;

        if record.file_size != file.size {
            return Err(TransferError::FileChanged(format!(
                "{}: expected {} bytes, hashed {}",
                key, file.size, record.file_size
            )));
        }

        debug!(
            file = %key,
            blocks = record.parts.len(),
            hash = %hex::encode(&record.file_hash[..8]),
            "Parts record computed"
        );

        let record = Arc::new(record);
        self.cache.insert(
            key,
            CachedRecord {
                file: file.clone(),
                record: Arc::clone(&record),
            },
        );
        Ok(record)
    }

    /// Drop the cached record of a file
    pub fn invalidate(&self, key: &FileKey) {
        self.cache.remove(key);
    }

    /// Number of cached records
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}
