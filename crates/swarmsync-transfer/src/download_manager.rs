//! Multi-source download of one file.
//!
//! A [`DownloadManager`] represents "download of file F" independently of how
//! many peers serve it. Each source is a [`Download`]. Missing bytes are
//! handed out as part-sized ranges, at most `max_requests_queued` in flight per
//! source and never to two sources at once. Chunks are written into a temp
//! file by a [`RangeReassembler`]; once every byte is present the manager asks
//! the folder to verify and install the file.
//!
//! Bookkeeping and temp-file I/O sit behind separate locks. The temp-file lock
//! may be held while taking the state lock, never the other way round.
//!
//! When a usable local base exists (an earlier partial download, or the
//! previous local version) and the first started source speaks parts records,
//! blocks already present locally are found through the record and copied
//! instead of being transferred.

use crate::counter::TransferCounter;
use crate::download::Download;
use crate::error::{Result, TransferError, TransferProblem};
use crate::model::{FileInfo, PeerId, modified_ms, same_modification};
use crate::provider::Folder;
use crate::transfer::Transfer;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use swarmsync_files::{BlockMatch, FilePartsRecord, RangeReassembler, RangeSet};
use tracing::{debug, info, warn};

/// Lifecycle of a download manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerPhase {
    /// Receiving chunks
    Active,
    /// Every byte received, commit to the folder in progress
    Completing,
    /// Installed into the folder
    Completed,
    /// Failed
    Broken,
    /// Cancelled
    Aborted,
}

impl ManagerPhase {
    /// Whether no further transition is possible
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Broken | Self::Aborted)
    }
}

/// Limits taken from the transfer configuration
#[derive(Debug, Clone, Copy)]
pub struct ManagerLimits {
    /// Bytes per part request
    pub part_size: u64,
    /// Requests in flight per source
    pub max_requests_queued: usize,
    /// Maximum number of sources
    pub max_sources: usize,
    /// Smallest local base worth a parts-record negotiation
    pub parts_record_min_size: u64,
}

/// What to do after a source announced its start
#[derive(Debug)]
pub(crate) enum StartPlan {
    /// Nothing (unknown source, duplicate start, manager not active)
    Ignore,
    /// Ask this source for the parts record first
    RequestRecord(Arc<Download>),
    /// Request these ranges from the source
    Request(Arc<Download>, Vec<Range<u64>>),
    /// Nothing left to fetch
    Complete,
}

/// What to do after a chunk was stored
#[derive(Debug)]
pub(crate) enum ChunkOutcome {
    /// Manager no longer receiving, or chunk from a removed source
    Ignored,
    /// Request these ranges from the source that sent the chunk
    Continue(Arc<Download>, Vec<Range<u64>>),
    /// Every byte received
    Complete,
}

/// Requests to send after ranges were freed up or the record was applied
#[derive(Debug, Default)]
pub(crate) struct RefillPlan {
    pub requests: Vec<(Arc<Download>, Vec<Range<u64>>)>,
    pub complete: bool,
}

/// Result of detaching a source
#[derive(Debug)]
pub struct SourceRemoval {
    /// The detached source
    pub download: Arc<Download>,
    /// The last source left and the manager broke
    pub out_of_sources: bool,
}

struct Source {
    download: Arc<Download>,
    in_flight: Vec<Range<u64>>,
    started: bool,
}

struct ManagerState {
    phase: ManagerPhase,
    automatic: bool,
    sources: Vec<Source>,
    assigned: RangeSet,
    filled: RangeSet,
    temp_path: Option<PathBuf>,
    resume_base: Option<PathBuf>,
    resume_file: Option<PathBuf>,
    record_source: Option<PeerId>,
    record_done: bool,
    contributors: BTreeSet<PeerId>,
    problem: Option<(TransferProblem, String)>,
    completed_at: Option<DateTime<Utc>>,
}

/// Download of one file version from one or more peers
pub struct DownloadManager {
    file: FileInfo,
    folder: Arc<dyn Folder>,
    limits: ManagerLimits,
    counter: TransferCounter,
    created_at: DateTime<Utc>,
    state: Mutex<ManagerState>,
    temp: Mutex<TempFile>,
}

#[derive(Default)]
struct TempFile {
    reassembler: Option<RangeReassembler>,
    opened: bool,
}

impl DownloadManager {
    /// Create a manager without sources
    #[must_use]
    pub fn new(
        file: FileInfo,
        folder: Arc<dyn Folder>,
        automatic: bool,
        limits: ManagerLimits,
    ) -> Arc<Self> {
        Arc::new(Self::with_state(
            file,
            folder,
            limits,
            ManagerState {
                phase: ManagerPhase::Active,
                automatic,
                sources: Vec::new(),
                assigned: RangeSet::new(),
                filled: RangeSet::new(),
                temp_path: None,
                resume_base: None,
                resume_file: None,
                record_source: None,
                record_done: false,
                contributors: BTreeSet::new(),
                problem: None,
                completed_at: None,
            },
        ))
    }

    /// Recreate a completed download from persisted state
    pub(crate) fn restored(
        file: FileInfo,
        folder: Arc<dyn Folder>,
        limits: ManagerLimits,
        automatic: bool,
        contributors: impl IntoIterator<Item = PeerId>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Arc<Self> {
        let manager = Self::new(file, folder, automatic, limits);
        {
            let mut state = manager.state.lock();
            state.phase = ManagerPhase::Completed;
            state.contributors.extend(contributors);
            state.completed_at = completed_at;
        }
        manager
    }

    fn with_state(
        file: FileInfo,
        folder: Arc<dyn Folder>,
        limits: ManagerLimits,
        state: ManagerState,
    ) -> Self {
        Self {
            file,
            folder,
            limits,
            counter: TransferCounter::new(),
            created_at: Utc::now(),
            state: Mutex::new(state),
            temp: Mutex::new(TempFile::default()),
        }
    }

    /// File version downloaded
    #[must_use]
    pub fn file(&self) -> &FileInfo {
        &self.file
    }

    /// Folder the file is installed into
    #[must_use]
    pub fn folder(&self) -> &Arc<dyn Folder> {
        &self.folder
    }

    /// Aggregate bytes received from all sources
    #[must_use]
    pub fn counter(&self) -> &TransferCounter {
        &self.counter
    }

    /// Creation time
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> ManagerPhase {
        self.state.lock().phase
    }

    /// Whether the file was installed
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.phase() == ManagerPhase::Completed
    }

    /// Whether the download failed
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.phase() == ManagerPhase::Broken
    }

    /// Whether the download was cancelled
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.phase() == ManagerPhase::Aborted
    }

    /// Whether the download still runs
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.phase().is_terminal()
    }

    /// True only while every source was requested automatically
    #[must_use]
    pub fn is_automatic(&self) -> bool {
        self.state.lock().automatic
    }

    /// Reason of the break or abort
    #[must_use]
    pub fn problem(&self) -> Option<(TransferProblem, String)> {
        self.state.lock().problem.clone()
    }

    /// When the file was installed
    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().completed_at
    }

    /// Attached sources
    #[must_use]
    pub fn sources(&self) -> Vec<Arc<Download>> {
        self.state
            .lock()
            .sources
            .iter()
            .map(|s| Arc::clone(&s.download))
            .collect()
    }

    /// Number of attached sources
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.state.lock().sources.len()
    }

    /// Source served by `peer`
    #[must_use]
    pub fn source(&self, peer: &PeerId) -> Option<Arc<Download>> {
        self.state
            .lock()
            .sources
            .iter()
            .find(|s| s.download.partner() == peer)
            .map(|s| Arc::clone(&s.download))
    }

    /// Whether `peer` serves a source
    #[must_use]
    pub fn has_source(&self, peer: &PeerId) -> bool {
        self.source(peer).is_some()
    }

    /// Peers that delivered at least one chunk
    #[must_use]
    pub fn contributors(&self) -> Vec<PeerId> {
        self.state.lock().contributors.iter().cloned().collect()
    }

    /// Share of the file present (0.0 to 1.0)
    #[must_use]
    pub fn progress(&self) -> f64 {
        let state = self.state.lock();
        if state.phase == ManagerPhase::Completed {
            1.0
        } else if state.temp_path.is_none() {
            0.0
        } else if self.file.size == 0 {
            1.0
        } else {
            state.filled.covered_len() as f64 / self.file.size as f64
        }
    }

    /// Location of the temp file, once created
    #[must_use]
    pub fn temp_path(&self) -> Option<PathBuf> {
        self.state.lock().temp_path.clone()
    }

    /// Whether `download` would be accepted as a new source
    #[must_use]
    pub fn can_add_source(&self, download: &Download) -> bool {
        let state = self.state.lock();
        Self::check_capacity(&state, &self.limits, download)
    }

    fn check_capacity(state: &ManagerState, limits: &ManagerLimits, download: &Download) -> bool {
        state.phase == ManagerPhase::Active
            && state.sources.len() < limits.max_sources
            && !state
                .sources
                .iter()
                .any(|s| s.download.partner() == download.partner())
    }

    /// Attach a source
    ///
    /// Returns `Ok(false)` if the manager is no longer active, the peer already
    /// serves a source or the source limit is reached.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::VersionMismatch`] if the source is for another
    /// version of the file.
    pub fn add_source(&self, download: Arc<Download>) -> Result<bool> {
        if !download.file().is_version_date_and_size_identical(&self.file) {
            return Err(TransferError::VersionMismatch(format!(
                "source {} offers {}, download is {}",
                download.partner(),
                download.file(),
                self.file
            )));
        }

        let mut state = self.state.lock();
        if !Self::check_capacity(&state, &self.limits, &download) {
            return Ok(false);
        }
        if !download.is_automatic() {
            state.automatic = false;
        }
        debug!(
            file = %self.file.key(),
            peer = %download.partner(),
            sources = state.sources.len() + 1,
            "Source added"
        );
        state.sources.push(Source {
            download,
            in_flight: Vec::new(),
            started: false,
        });
        Ok(true)
    }

    /// Detach the source served by `peer`
    ///
    /// Its in-flight ranges return to the missing set. Removing the last source
    /// of a running download breaks it with [`TransferProblem::OutOfSources`].
    pub fn remove_source(&self, peer: &PeerId) -> Option<SourceRemoval> {
        let removal = self.detach(peer)?;
        if removal.out_of_sources {
            self.close_temp();
        }
        Some(removal)
    }

    fn detach(&self, peer: &PeerId) -> Option<SourceRemoval> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let index = state
            .sources
            .iter()
            .position(|s| s.download.partner() == peer)?;
        let source = state.sources.remove(index);
        for range in &source.in_flight {
            state.assigned.remove(range.clone());
        }
        if state.record_source.as_ref() == Some(peer) {
            state.record_source = None;
            state.record_done = true;
        }

        let out_of_sources = state.sources.is_empty() && state.phase == ManagerPhase::Active;
        if out_of_sources {
            state.phase = ManagerPhase::Broken;
            state.problem = Some((
                TransferProblem::OutOfSources,
                format!("last source {} left", peer),
            ));
            state.filled.clear();
            state.assigned.clear();
            info!(file = %self.file.key(), "Download out of sources");
        } else {
            debug!(
                file = %self.file.key(),
                peer = %peer,
                returned = source.in_flight.len(),
                "Source removed"
            );
        }

        Some(SourceRemoval {
            download: source.download,
            out_of_sources,
        })
    }

    /// Terminal failure
    ///
    /// Returns the detached sources, or `None` if the manager had already
    /// ended. The temp file stays on disk.
    pub fn set_broken(
        &self,
        problem: TransferProblem,
        detail: impl Into<String>,
    ) -> Option<Vec<Arc<Download>>> {
        self.end(ManagerPhase::Broken, problem, detail.into())
    }

    /// Cancel the download and delete its temp file
    ///
    /// Returns the detached sources, or `None` if the manager had already ended.
    pub fn abort(&self) -> Option<Vec<Arc<Download>>> {
        let sources = self.end(ManagerPhase::Aborted, TransferProblem::Aborted, "aborted".into())?;
        let leftovers = {
            let mut state = self.state.lock();
            [state.temp_path.clone(), state.resume_file.take()]
        };
        for path in leftovers.into_iter().flatten() {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!("{} not removed: {}", path.display(), e);
            }
        }
        Some(sources)
    }

    fn end(
        &self,
        phase: ManagerPhase,
        problem: TransferProblem,
        detail: String,
    ) -> Option<Vec<Arc<Download>>> {
        let sources = {
            let mut state = self.state.lock();
            if state.phase.is_terminal() {
                return None;
            }
            state.phase = phase;
            state.problem = Some((problem, detail));
            state.filled.clear();
            state.assigned.clear();
            state.record_source = None;
            state.sources.drain(..).map(|s| s.download).collect()
        };
        self.close_temp();
        Some(sources)
    }

    fn close_temp(&self) {
        let reassembler = self.temp.lock().reassembler.take();
        drop(reassembler);
    }

    /// A source announced it is ready to serve
    ///
    /// The first start creates the temp file, after checking that the local
    /// copy about to be replaced still matches the database.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::ModificationMismatch`] if the local file
    /// changed, or the I/O error of the temp file.
    pub(crate) fn source_started(&self, peer: &PeerId) -> Result<StartPlan> {
        {
            let mut state = self.state.lock();
            if state.phase != ManagerPhase::Active {
                return Ok(StartPlan::Ignore);
            }
            let Some(source) = state
                .sources
                .iter_mut()
                .find(|s| s.download.partner() == peer)
            else {
                return Ok(StartPlan::Ignore);
            };
            if source.started {
                return Ok(StartPlan::Ignore);
            }
            source.started = true;
            source.download.core().mark_started();
        }

        self.open_temp()?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.phase != ManagerPhase::Active {
            return Ok(StartPlan::Ignore);
        }
        let Some(index) = state
            .sources
            .iter()
            .position(|s| s.download.partner() == peer)
        else {
            return Ok(StartPlan::Ignore);
        };
        let download = Arc::clone(&state.sources[index].download);

        if Self::is_filled(state, self.file.size) {
            state.phase = ManagerPhase::Completing;
            return Ok(StartPlan::Complete);
        }

        if !state.record_done
            && state.record_source.is_none()
            && state.resume_base.is_some()
            && download.peer().supports_parts_record()
        {
            state.record_source = Some(peer.clone());
            return Ok(StartPlan::RequestRecord(download));
        }

        let ranges = Self::assign(state, index, self.file.size, &self.limits);
        Ok(StartPlan::Request(download, ranges))
    }

    fn is_filled(state: &ManagerState, size: u64) -> bool {
        state.temp_path.is_some() && state.filled.contains_range(&(0..size))
    }

    /// Create the temp file once, before the first range is handed out
    fn open_temp(&self) -> Result<()> {
        let mut temp = self.temp.lock();
        if temp.opened || self.phase() != ManagerPhase::Active {
            return Ok(());
        }
        self.verify_local_unchanged()?;

        let path = self.folder.temp_download_path(&self.file);
        let min_size = self.limits.parts_record_min_size.max(1);

        // An earlier partial download becomes the resume base
        let mut resume_file = None;
        if std::fs::metadata(&path).is_ok_and(|m| m.len() >= min_size) {
            let aside = path.with_extension("resume");
            match std::fs::rename(&path, &aside) {
                Ok(()) => resume_file = Some(aside),
                Err(e) => debug!("Earlier temp file {} not reusable: {}", path.display(), e),
            }
        }
        let resume_base = resume_file.clone().or_else(|| {
            let disk = self.folder.disk_path(&self.file);
            std::fs::metadata(&disk)
                .is_ok_and(|m| m.is_file() && m.len() >= min_size)
                .then_some(disk)
        });

        temp.reassembler = Some(RangeReassembler::create(&path, self.file.size)?);
        temp.opened = true;

        let mut state = self.state.lock();
        state.temp_path = Some(path);
        state.resume_file = resume_file;
        state.resume_base = resume_base;
        Ok(())
    }

    /// Hand out missing ranges to source `index`
    fn assign(
        state: &mut ManagerState,
        index: usize,
        size: u64,
        limits: &ManagerLimits,
    ) -> Vec<Range<u64>> {
        if state.phase != ManagerPhase::Active || state.record_source.is_some() {
            return Vec::new();
        }
        let free = limits
            .max_requests_queued
            .saturating_sub(state.sources[index].in_flight.len());
        if free == 0 {
            return Vec::new();
        }
        if state.temp_path.is_none() {
            return Vec::new();
        }
        let busy = state.filled.union(&state.assigned);

        let part = limits.part_size.max(1);
        let mut ranges = Vec::with_capacity(free);
        'gaps: for gap in busy.gaps(0..size) {
            let mut start = gap.start;
            while start < gap.end {
                if ranges.len() == free {
                    break 'gaps;
                }
                let end = start.saturating_add(part).min(gap.end);
                ranges.push(start..end);
                start = end;
            }
        }

        for range in &ranges {
            state.assigned.insert(range.clone());
            state.sources[index].in_flight.push(range.clone());
        }
        ranges
    }

    /// Store a chunk received from `peer`
    ///
    /// The range stays assigned while it is written, so no other source is
    /// handed the same bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidPart`] if the chunk does not match a
    /// request in flight at that source, or the I/O error of the temp file.
    pub(crate) fn receive_chunk(
        &self,
        peer: &PeerId,
        offset: u64,
        data: &[u8],
    ) -> Result<ChunkOutcome> {
        let end = offset.saturating_add(data.len() as u64);
        let download = {
            let mut state = self.state.lock();
            if state.phase != ManagerPhase::Active {
                return Ok(ChunkOutcome::Ignored);
            }
            let Some(source) = state
                .sources
                .iter_mut()
                .find(|s| s.download.partner() == peer)
            else {
                return Ok(ChunkOutcome::Ignored);
            };
            let Some(position) = source
                .in_flight
                .iter()
                .position(|r| r.start == offset && r.end == end)
            else {
                return Err(TransferError::InvalidPart(format!(
                    "unrequested chunk {}..{} of {} from {}",
                    offset, end, self.file.path, peer
                )));
            };
            source.in_flight.remove(position);
            Arc::clone(&source.download)
        };

        let written = match self.temp.lock().reassembler.as_mut() {
            Some(reassembler) => reassembler.write_at(offset, data),
            None => {
                self.state.lock().assigned.remove(offset..end);
                return Ok(ChunkOutcome::Ignored);
            }
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.assigned.remove(offset..end);
        written?;
        if state.phase != ManagerPhase::Active {
            return Ok(ChunkOutcome::Ignored);
        }
        state.filled.insert(offset..end);
        state.contributors.insert(peer.clone());
        download.core().counter().add(data.len() as u64);
        self.counter.add(data.len() as u64);

        if Self::is_filled(state, self.file.size) {
            state.phase = ManagerPhase::Completing;
            return Ok(ChunkOutcome::Complete);
        }
        let Some(index) = state
            .sources
            .iter()
            .position(|s| s.download.partner() == peer)
        else {
            return Ok(ChunkOutcome::Ignored);
        };
        let ranges = Self::assign(state, index, self.file.size, &self.limits);
        Ok(ChunkOutcome::Continue(download, ranges))
    }

    /// Resume base, if `peer` is the source the record was requested from
    pub(crate) fn pending_record_base(&self, peer: &PeerId) -> Option<PathBuf> {
        let state = self.state.lock();
        if state.phase != ManagerPhase::Active || state.record_source.as_ref() != Some(peer) {
            return None;
        }
        state.resume_base.clone()
    }

    /// Copy blocks found in the resume base into the temp file
    ///
    /// Returns the number of bytes reused.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the base cannot be read or the temp file written.
    pub(crate) fn apply_record_matches(
        &self,
        peer: &PeerId,
        base: &Path,
        record: &FilePartsRecord,
        matches: &[BlockMatch],
    ) -> Result<u64> {
        let busy = {
            let state = self.state.lock();
            if state.phase != ManagerPhase::Active || state.record_source.as_ref() != Some(peer) {
                return Ok(0);
            }
            state.filled.union(&state.assigned)
        };

        let mut base_file = std::fs::File::open(base)?;
        let mut copied = Vec::new();
        {
            let mut temp = self.temp.lock();
            let Some(reassembler) = temp.reassembler.as_mut() else {
                return Ok(0);
            };
            for block in matches {
                let range = record.block_range(block.index);
                if range.is_empty() || busy.intersects(&range) {
                    continue;
                }
                let len = range.end - range.start;
                reassembler.copy_from(&mut base_file, block.local_offset, range.start, len as usize)?;
                copied.push(range);
            }
        }

        let mut state = self.state.lock();
        if state.phase != ManagerPhase::Active {
            return Ok(0);
        }
        let mut reused = 0u64;
        for range in copied {
            reused += range.end - range.start;
            state.filled.insert(range);
        }
        Ok(reused)
    }

    /// The parts record from `peer` was handled (or cannot be used)
    pub(crate) fn finish_record(&self, peer: &PeerId) -> RefillPlan {
        let resume_file = {
            let mut state = self.state.lock();
            if state.record_source.as_ref() == Some(peer) {
                state.record_source = None;
                state.record_done = true;
            }
            state.resume_file.take()
        };
        if let Some(path) = resume_file {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!("Resume file {} not removed: {}", path.display(), e);
            }
        }
        self.refill()
    }

    /// Hand out missing ranges to every started source
    pub(crate) fn refill(&self) -> RefillPlan {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut plan = RefillPlan::default();
        if state.phase != ManagerPhase::Active {
            return plan;
        }
        if Self::is_filled(state, self.file.size) {
            state.phase = ManagerPhase::Completing;
            plan.complete = true;
            return plan;
        }

        for index in 0..state.sources.len() {
            if !state.sources[index].started {
                continue;
            }
            let ranges = Self::assign(state, index, self.file.size, &self.limits);
            if !ranges.is_empty() {
                plan.requests
                    .push((Arc::clone(&state.sources[index].download), ranges));
            }
        }
        plan
    }

    /// Fail if the local copy changed behind the database's back
    ///
    /// Compares the on-disk modification time of the file being replaced with
    /// the local database entry. A mismatch requests a rescan.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::ModificationMismatch`] on a mismatch.
    pub fn verify_local_unchanged(&self) -> Result<()> {
        let Some(local) = self.folder.local_file(&self.file) else {
            return Ok(());
        };
        if local.deleted {
            return Ok(());
        }
        let path = self.folder.disk_path(&self.file);
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let actual_ms = modified_ms(&metadata)?;
        if !same_modification(actual_ms, local.modified_ms) {
            warn!(file = %self.file.key(), "Local file changed during download");
            self.folder.request_rescan();
            return Err(TransferError::ModificationMismatch {
                path: self.file.path.clone(),
                expected_ms: local.modified_ms,
                actual_ms,
            });
        }
        Ok(())
    }

    /// Close the fully written temp file and return its path
    ///
    /// # Errors
    ///
    /// Returns an error unless the manager is completing and the file is whole.
    pub(crate) fn finalize_temp(&self) -> Result<PathBuf> {
        let phase = self.phase();
        if phase != ManagerPhase::Completing {
            return Err(TransferError::InvalidState(format!(
                "finalize in phase {:?}",
                phase
            )));
        }
        let reassembler = self
            .temp
            .lock()
            .reassembler
            .take()
            .ok_or_else(|| TransferError::InvalidState("no temp file".into()))?;
        Ok(reassembler.finalize()?)
    }

    /// The folder installed the file
    ///
    /// Returns the sources so they can be completed and told to stop, or
    /// `None` if the manager was not completing.
    pub(crate) fn mark_completed(&self) -> Option<Vec<Arc<Download>>> {
        let (sources, resume_file) = {
            let mut state = self.state.lock();
            if state.phase != ManagerPhase::Completing {
                return None;
            }
            state.phase = ManagerPhase::Completed;
            state.completed_at = Some(Utc::now());
            state.assigned.clear();
            let sources: Vec<_> = state.sources.drain(..).map(|s| s.download).collect();
            (sources, state.resume_file.take())
        };
        if let Some(path) = resume_file
            && let Err(e) = std::fs::remove_file(&path)
        {
            debug!("Resume file {} not removed: {}", path.display(), e);
        }
        info!(
            file = %self.file.key(),
            bytes = self.counter.bytes_transferred(),
            "Download completed"
        );
        Some(sources)
    }
}

impl fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DownloadManager")
            .field("file", &self.file.key())
            .field("version", &self.file.version)
            .field("phase", &state.phase)
            .field("sources", &state.sources.len())
            .field("automatic", &state.automatic)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FolderId;
    use crate::testing::{FakeFolder, LoopbackPeer};
    use swarmsync_files::PartsMatcher;

    fn limits() -> ManagerLimits {
        ManagerLimits {
            part_size: 1000,
            max_requests_queued: 2,
            max_sources: 3,
            parts_record_min_size: 1,
        }
    }

    fn remote_file(folder: &FakeFolder, data_len: u64) -> FileInfo {
        FileInfo::new(folder.id().clone(), "x.bin", data_len, 1_700_000_000_000, 3)
    }

    fn source(
        manager: &Arc<DownloadManager>,
        name: &str,
        automatic: bool,
        version: u32,
    ) -> Arc<Download> {
        let mut file = manager.file().clone();
        file.version = version;
        Arc::new(Download::new(
            file,
            LoopbackPeer::detached(PeerId::new(name)),
            automatic,
            manager,
        ))
    }

    #[test]
    fn test_add_source_rules() {
        let dir = tempfile::tempdir().unwrap();
        let folder = FakeFolder::new(FolderId::new("f"), dir.path());
        let manager = DownloadManager::new(remote_file(&folder, 5000), folder, true, limits());

        assert!(manager.add_source(source(&manager, "a", true, 3)).unwrap());
        assert!(manager.is_automatic());
        assert!(!manager.add_source(source(&manager, "a", true, 3)).unwrap());
        assert!(matches!(
            manager.add_source(source(&manager, "b", true, 4)),
            Err(TransferError::VersionMismatch(_))
        ));
        assert!(manager.add_source(source(&manager, "b", false, 3)).unwrap());
        assert!(!manager.is_automatic());
        assert!(manager.add_source(source(&manager, "c", true, 3)).unwrap());
        // Source limit reached
        assert!(!manager.add_source(source(&manager, "d", true, 3)).unwrap());
        assert_eq!(manager.source_count(), 3);
    }

    #[test]
    fn test_two_sources_never_share_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let folder = FakeFolder::new(FolderId::new("f"), dir.path());
        let data: Vec<u8> = (0..5500u32).map(|i| (i * 13 % 256) as u8).collect();
        let manager =
            DownloadManager::new(remote_file(&folder, data.len() as u64), folder, false, limits());
        let a = PeerId::new("a");
        let b = PeerId::new("b");
        manager.add_source(source(&manager, "a", false, 3)).unwrap();
        manager.add_source(source(&manager, "b", false, 3)).unwrap();

        let StartPlan::Request(_, ranges_a) = manager.source_started(&a).unwrap() else {
            panic!("expected requests for a");
        };
        let StartPlan::Request(_, ranges_b) = manager.source_started(&b).unwrap() else {
            panic!("expected requests for b");
        };
        assert_eq!(ranges_a, vec![0..1000, 1000..2000]);
        assert_eq!(ranges_b, vec![2000..3000, 3000..4000]);

        // Feed every chunk back until the file is whole
        let mut queue: Vec<(PeerId, Range<u64>)> = ranges_a
            .into_iter()
            .map(|r| (a.clone(), r))
            .chain(ranges_b.into_iter().map(|r| (b.clone(), r)))
            .collect();
        let mut complete = false;
        while let Some((peer, range)) = queue.pop() {
            let chunk = &data[range.start as usize..range.end as usize];
            match manager.receive_chunk(&peer, range.start, chunk).unwrap() {
                ChunkOutcome::Continue(_, more) => {
                    queue.extend(more.into_iter().map(|r| (peer.clone(), r)));
                }
                ChunkOutcome::Complete => complete = true,
                ChunkOutcome::Ignored => panic!("chunk ignored"),
            }
        }
        assert!(complete);
        assert_eq!(manager.phase(), ManagerPhase::Completing);
        assert_eq!(manager.counter().bytes_transferred(), 5500);
        assert_eq!(manager.contributors(), vec![a, b]);

        let temp = manager.finalize_temp().unwrap();
        assert_eq!(std::fs::read(temp).unwrap(), data);
    }

    #[test]
    fn test_unrequested_chunk_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let folder = FakeFolder::new(FolderId::new("f"), dir.path());
        let manager = DownloadManager::new(remote_file(&folder, 5000), folder, false, limits());
        let a = PeerId::new("a");
        manager.add_source(source(&manager, "a", false, 3)).unwrap();
        manager.source_started(&a).unwrap();

        let err = manager.receive_chunk(&a, 500, &[0u8; 100]).unwrap_err();
        assert_eq!(err.problem(), TransferProblem::InvalidPart);
        // Right offset, wrong length
        assert!(manager.receive_chunk(&a, 0, &[0u8; 999]).is_err());
    }

    #[test]
    fn test_removed_source_returns_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let folder = FakeFolder::new(FolderId::new("f"), dir.path());
        let manager = DownloadManager::new(remote_file(&folder, 5000), folder, false, limits());
        let a = PeerId::new("a");
        let b = PeerId::new("b");
        manager.add_source(source(&manager, "a", false, 3)).unwrap();
        manager.add_source(source(&manager, "b", false, 3)).unwrap();
        manager.source_started(&a).unwrap();
        manager.source_started(&b).unwrap();

        let removal = manager.remove_source(&a).unwrap();
        assert!(!removal.out_of_sources);
        assert_eq!(manager.phase(), ManagerPhase::Active);

        // b already has two requests in flight; answering one hands out a's old range
        let data = vec![0u8; 1000];
        match manager.receive_chunk(&b, 2000, &data).unwrap() {
            ChunkOutcome::Continue(_, more) => assert_eq!(more, vec![0..1000]),
            other => panic!("unexpected {:?}", other),
        }
        // Chunks still arriving from the removed peer are dropped
        assert!(matches!(
            manager.receive_chunk(&a, 0, &data).unwrap(),
            ChunkOutcome::Ignored
        ));

        let last = manager.remove_source(&b).unwrap();
        assert!(last.out_of_sources);
        assert!(manager.is_broken());
        assert_eq!(manager.problem().unwrap().0, TransferProblem::OutOfSources);
    }

    #[test]
    fn test_sources_write_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let folder = FakeFolder::new(FolderId::new("f"), dir.path());
        let data: Vec<u8> = (0..40_000u32).map(|i| (i * 7 % 253) as u8).collect();
        let manager =
            DownloadManager::new(remote_file(&folder, data.len() as u64), folder, false, limits());
        let peers: Vec<PeerId> = ["a", "b", "c"].into_iter().map(PeerId::new).collect();
        let mut initial = Vec::new();
        for peer in &peers {
            manager.add_source(source(&manager, peer.as_str(), false, 3)).unwrap();
            let StartPlan::Request(_, ranges) = manager.source_started(peer).unwrap() else {
                panic!("expected requests for {}", peer);
            };
            initial.push(ranges);
        }

        let completions: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = peers
                .iter()
                .zip(initial)
                .map(|(peer, mut queue)| {
                    let manager = &manager;
                    let data = &data;
                    scope.spawn(move || {
                        let mut completions = 0;
                        while let Some(range) = queue.pop() {
                            let chunk = &data[range.start as usize..range.end as usize];
                            match manager.receive_chunk(peer, range.start, chunk).unwrap() {
                                ChunkOutcome::Continue(_, more) => queue.extend(more),
                                ChunkOutcome::Complete => completions += 1,
                                ChunkOutcome::Ignored => {}
                            }
                        }
                        completions
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });

        assert_eq!(completions, 1);
        assert_eq!(manager.phase(), ManagerPhase::Completing);
        assert_eq!(manager.counter().bytes_transferred(), data.len() as u64);
        let temp = manager.finalize_temp().unwrap();
        assert_eq!(std::fs::read(temp).unwrap(), data);
    }

    #[test]
    fn test_touched_local_file_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let folder = FakeFolder::new(FolderId::new("f"), dir.path());
        folder.write_file("x.bin", &[5u8; 3000], 2);
        std::fs::File::options()
            .write(true)
            .open(dir.path().join("x.bin"))
            .unwrap()
            .set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(3600))
            .unwrap();

        let manager = DownloadManager::new(remote_file(&folder, 5000), folder.clone(), false, limits());
        let a = PeerId::new("a");
        manager.add_source(source(&manager, "a", false, 3)).unwrap();

        let err = manager.source_started(&a).unwrap_err();
        assert_eq!(err.problem(), TransferProblem::FileChanged);
        assert!(err.to_string().contains("last modification date mismatch"));
        assert_eq!(folder.rescan_count(), 1);
        assert!(manager.temp_path().is_none());
    }

    #[test]
    fn test_zero_byte_file_completes_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let folder = FakeFolder::new(FolderId::new("f"), dir.path());
        let manager = DownloadManager::new(remote_file(&folder, 0), folder, false, limits());
        let a = PeerId::new("a");
        manager.add_source(source(&manager, "a", false, 3)).unwrap();

        assert!(matches!(manager.source_started(&a).unwrap(), StartPlan::Complete));
        let temp = manager.finalize_temp().unwrap();
        assert_eq!(std::fs::metadata(temp).unwrap().len(), 0);
        assert_eq!(manager.mark_completed().unwrap().len(), 1);
        assert!(manager.is_done());
    }

    #[test]
    fn test_vanished_resume_file_does_not_block_completion() {
        let dir = tempfile::tempdir().unwrap();
        let folder = FakeFolder::new(FolderId::new("f"), dir.path());
        let data = vec![7u8; 3000];
        let manager =
            DownloadManager::new(remote_file(&folder, data.len() as u64), folder.clone(), false, limits());

        // Leftover of an earlier attempt is set aside as resume file
        let stale = folder.temp_download_path(manager.file());
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, [1u8; 2000]).unwrap();

        // Old protocol: no parts record, ranges are handed out right away
        let a = PeerId::new("a");
        let peer = LoopbackPeer::detached(a.clone());
        peer.set_protocol_version(1);
        let download = Arc::new(Download::new(manager.file().clone(), peer, false, &manager));
        manager.add_source(download).unwrap();
        let StartPlan::Request(_, mut queue) = manager.source_started(&a).unwrap() else {
            panic!("expected requests");
        };
        let aside = stale.with_extension("resume");
        assert!(aside.exists());
        std::fs::remove_file(&aside).unwrap();

        let mut completed = false;
        while let Some(range) = queue.pop() {
            let chunk = &data[range.start as usize..range.end as usize];
            match manager.receive_chunk(&a, range.start, chunk).unwrap() {
                ChunkOutcome::Continue(_, more) => queue.extend(more),
                ChunkOutcome::Complete => completed = true,
                ChunkOutcome::Ignored => {}
            }
        }
        assert!(completed);
        let temp = manager.finalize_temp().unwrap();
        assert_eq!(std::fs::read(temp).unwrap(), data);
        assert_eq!(manager.mark_completed().unwrap().len(), 1);
        assert!(manager.is_done());
    }

    #[test]
    fn test_set_broken_keeps_temp_and_abort_deletes_it() {
        let dir = tempfile::tempdir().unwrap();
        let folder = FakeFolder::new(FolderId::new("f"), dir.path());
        let broken = DownloadManager::new(remote_file(&folder, 5000), folder.clone(), false, limits());
        let a = PeerId::new("a");
        broken.add_source(source(&broken, "a", false, 3)).unwrap();
        broken.source_started(&a).unwrap();
        let temp = broken.temp_path().unwrap();

        let sources = broken.set_broken(TransferProblem::IoException, "disk full").unwrap();
        assert_eq!(sources.len(), 1);
        assert!(broken.set_broken(TransferProblem::IoException, "again").is_none());
        assert!(temp.exists());

        let aborted = DownloadManager::new(remote_file(&folder, 5000), folder, false, limits());
        aborted.add_source(source(&aborted, "a", false, 3)).unwrap();
        aborted.source_started(&a).unwrap();
        assert!(aborted.abort().is_some());
        assert!(!temp.exists());
    }

    #[test]
    fn test_resume_from_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let folder = FakeFolder::new(FolderId::new("f"), dir.path());

        // Old local version shares its first 12 KiB with the new one
        let mut new_data: Vec<u8> = (0..20_000u32).map(|i| (i * 31 % 251) as u8).collect();
        folder.write_file("x.bin", &new_data[..12_288], 2);
        new_data[15_000] ^= 0xff;

        let remote_dir = tempfile::tempdir().unwrap();
        let remote_path = remote_dir.path().join("x.bin");
        std::fs::write(&remote_path, &new_data).unwrap();
        let record = FilePartsRecord::compute(&remote_path, 4096, |_| {}).unwrap();

        let manager = DownloadManager::new(
            remote_file(&folder, new_data.len() as u64),
            folder.clone(),
            false,
            limits(),
        );
        let a = PeerId::new("a");
        manager.add_source(source(&manager, "a", false, 3)).unwrap();
        let StartPlan::RequestRecord(_) = manager.source_started(&a).unwrap() else {
            panic!("expected a parts record request");
        };

        let base = manager.pending_record_base(&a).unwrap();
        let matches = PartsMatcher::new(&record).unwrap().find_matches(&base).unwrap();
        let reused = manager
            .apply_record_matches(&a, &base, &record, &matches)
            .unwrap();
        assert_eq!(reused, 12_288);

        let plan = manager.finish_record(&a);
        assert!(!plan.complete);
        let (_, ranges) = &plan.requests[0];
        assert_eq!(ranges[0], 12_288..13_288);
    }
}
