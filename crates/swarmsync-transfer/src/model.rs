//! Identities and file versions shared by every part of the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::Component;
use std::path::Path;

/// Modification times closer than this are treated as equal (ms).
///
/// Absorbs timestamp rounding of filesystems like FAT or SMB shares.
pub const MODIFICATION_TOLERANCE_MS: i64 = 2000;

/// Directory of the folder database inside a synchronized folder
pub const DATABASE_DIR: &str = ".swarmsync";

/// File of a metadata folder that carries the parent's ignore patterns
pub const SYNC_PATTERNS_FILE: &str = "ignore.patterns";

const META_FOLDER_PREFIX: &str = "meta|";

/// Identity of a remote peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id as string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a synchronized folder
///
/// Metadata folders carry a `meta|` prefix in front of the id of the folder
/// they belong to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderId(String);

impl FolderId {
    /// Create a folder id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id of the metadata folder belonging to `parent`
    #[must_use]
    pub fn meta_of(parent: &FolderId) -> Self {
        Self(format!("{}{}", META_FOLDER_PREFIX, parent.0))
    }

    /// Id as string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is a metadata folder
    #[must_use]
    pub fn is_meta(&self) -> bool {
        self.0.starts_with(META_FOLDER_PREFIX)
    }

    /// Parent folder of a metadata folder
    #[must_use]
    pub fn parent(&self) -> Option<FolderId> {
        self.0
            .strip_prefix(META_FOLDER_PREFIX)
            .map(|parent| FolderId(parent.to_string()))
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Version-independent identity of a file: folder plus relative path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileKey {
    /// Folder holding the file
    pub folder: FolderId,
    /// Path relative to the folder root, `/` separated
    pub path: String,
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.folder, self.path)
    }
}

/// One version of a file, as known by the folder database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Folder holding the file
    pub folder: FolderId,
    /// Path relative to the folder root, `/` separated
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification, milliseconds since the Unix epoch
    pub modified_ms: i64,
    /// Version number, incremented on every change
    pub version: u32,
    /// Whether this version is a deletion
    #[serde(default)]
    pub deleted: bool,
}

impl FileInfo {
    /// Create a (non-deleted) file version
    pub fn new(
        folder: FolderId,
        path: impl Into<String>,
        size: u64,
        modified_ms: i64,
        version: u32,
    ) -> Self {
        Self {
            folder,
            path: path.into(),
            size,
            modified_ms,
            version,
            deleted: false,
        }
    }

    /// Version-independent key
    #[must_use]
    pub fn key(&self) -> FileKey {
        FileKey {
            folder: self.folder.clone(),
            path: self.path.clone(),
        }
    }

    /// Whether `other` is the same file
    #[must_use]
    pub fn same_key(&self, other: &FileInfo) -> bool {
        self.folder == other.folder && self.path == other.path
    }

    /// Same file with identical modification date, size and version number
    #[must_use]
    pub fn is_version_date_and_size_identical(&self, other: &FileInfo) -> bool {
        self.same_key(other)
            && self.version == other.version
            && self.size == other.size
            && self.modified_ms == other.modified_ms
            && self.deleted == other.deleted
    }

    /// Whether this version supersedes `other`
    ///
    /// Higher version numbers win; equal numbers fall back to the later
    /// modification date.
    #[must_use]
    pub fn is_newer_than(&self, other: &FileInfo) -> bool {
        self.version > other.version
            || (self.version == other.version && self.modified_ms > other.modified_ms)
    }

    /// Basic sanity of the metadata: a relative path without `..` components
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.path.is_empty() || self.path.starts_with('/') || self.modified_ms < 0 {
            return false;
        }
        Path::new(&self.path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
    }

    /// Whether the file lives in the folder database directory
    #[must_use]
    pub fn is_internal_database_file(&self) -> bool {
        self.path == DATABASE_DIR
            || self
                .path
                .strip_prefix(DATABASE_DIR)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Whether the file is the ignore pattern file of a metadata folder
    #[must_use]
    pub fn is_sync_pattern_file(&self) -> bool {
        self.folder.is_meta() && self.path == SYNC_PATTERNS_FILE
    }

    /// File name without directories
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

impl fmt::Display for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} (v{}, {} bytes)", self.folder, self.path, self.version, self.size)
    }
}

/// Whether two modification times are equal within [`MODIFICATION_TOLERANCE_MS`]
#[must_use]
pub fn same_modification(a_ms: i64, b_ms: i64) -> bool {
    a_ms.abs_diff(b_ms) <= MODIFICATION_TOLERANCE_MS.unsigned_abs()
}

/// Last modification of a file on disk, in milliseconds since the Unix epoch
///
/// # Errors
///
/// Returns an error if the platform does not report modification times.
pub fn modified_ms(metadata: &std::fs::Metadata) -> io::Result<i64> {
    let modified: DateTime<Utc> = metadata.modified()?.into();
    Ok(modified.timestamp_millis())
}
