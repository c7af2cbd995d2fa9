//! State shared by uploads and downloads.

use crate::counter::TransferCounter;
use crate::error::TransferProblem;
use crate::model::{FileInfo, PeerId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Lifecycle of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    /// Created, not started yet
    NotStarted,
    /// Running
    Started,
    /// Finished successfully
    Completed,
    /// Failed
    Broken,
    /// Cancelled
    Aborted,
}

impl TransferState {
    /// Whether no further transition is possible
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Broken | Self::Aborted)
    }
}

#[derive(Debug)]
struct CoreState {
    state: TransferState,
    problem: Option<(TransferProblem, String)>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

/// Identity, lifecycle and byte counter of one transfer
///
/// File and partner never change after creation. State transitions are
/// one-way: once terminal, every further transition is refused.
#[derive(Debug)]
pub struct TransferCore {
    file: FileInfo,
    partner: PeerId,
    created_at: DateTime<Utc>,
    counter: TransferCounter,
    state: Mutex<CoreState>,
}

impl TransferCore {
    /// Create a not-yet-started transfer
    #[must_use]
    pub fn new(file: FileInfo, partner: PeerId) -> Self {
        Self {
            file,
            partner,
            created_at: Utc::now(),
            counter: TransferCounter::new(),
            state: Mutex::new(CoreState {
                state: TransferState::NotStarted,
                problem: None,
                started_at: None,
                completed_at: None,
            }),
        }
    }

    /// File transferred
    #[must_use]
    pub fn file(&self) -> &FileInfo {
        &self.file
    }

    /// Remote peer
    #[must_use]
    pub fn partner(&self) -> &PeerId {
        &self.partner
    }

    /// Creation time
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Bytes of this transfer
    #[must_use]
    pub fn counter(&self) -> &TransferCounter {
        &self.counter
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TransferState {
        self.state.lock().state
    }

    /// Whether the transfer was started (it may have ended since)
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state.lock().started_at.is_some()
    }

    /// Whether the transfer completed
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state() == TransferState::Completed
    }

    /// Whether the transfer broke
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.state() == TransferState::Broken
    }

    /// Whether the transfer was aborted
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state() == TransferState::Aborted
    }

    /// Whether the transfer is in a terminal state
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Reason of the last break or abort
    #[must_use]
    pub fn problem(&self) -> Option<(TransferProblem, String)> {
        self.state.lock().problem.clone()
    }

    /// When the transfer started
    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().started_at
    }

    /// When the transfer completed
    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().completed_at
    }

    /// NOT_STARTED -> STARTED
    pub fn mark_started(&self) -> bool {
        let mut state = self.state.lock();
        if state.state != TransferState::NotStarted {
            return false;
        }
        state.state = TransferState::Started;
        state.started_at = Some(Utc::now());
        true
    }

    /// Any non-terminal state -> COMPLETED
    pub fn mark_completed(&self) -> bool {
        self.finish(TransferState::Completed, None)
    }

    /// Any non-terminal state -> BROKEN
    pub fn mark_broken(&self, problem: TransferProblem, detail: impl Into<String>) -> bool {
        self.finish(TransferState::Broken, Some((problem, detail.into())))
    }

    /// Any non-terminal state -> ABORTED
    pub fn mark_aborted(&self) -> bool {
        self.finish(
            TransferState::Aborted,
            Some((TransferProblem::Aborted, "aborted".to_string())),
        )
    }

    fn finish(&self, target: TransferState, problem: Option<(TransferProblem, String)>) -> bool {
        let mut state = self.state.lock();
        if state.state.is_terminal() {
            return false;
        }
        state.state = target;
        state.problem = problem;
        state.completed_at = Some(Utc::now());
        true
    }
}

/// Behaviour common to uploads and downloads
pub trait Transfer: Send + Sync {
    /// Shared state
    fn core(&self) -> &TransferCore;

    /// Whether the transfer should be considered broken
    ///
    /// Implementations add their own conditions to the core's flag.
    fn is_broken(&self) -> bool {
        self.core().is_broken()
    }

    /// File transferred
    fn file(&self) -> &FileInfo {
        self.core().file()
    }

    /// Remote peer
    fn partner(&self) -> &PeerId {
        self.core().partner()
    }
}
