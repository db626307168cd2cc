//! Per-account synchronization.
//!
//! A [`Synchronizer`] owns one account's backend and runs pull cycles and
//! request execution. [`actor`] wraps it in a task so every cycle for the same
//! account is serialized.

pub mod actor;
mod delta;
mod history;
mod protocol;
mod synchronizer;

pub use actor::{SynchronizerHandle, spawn_synchronizer};
pub use synchronizer::{Backend, Synchronizer};

use crate::error::SyncError;
use crate::model::{AccountId, FolderId, MailItem};
use crate::requests::RequestExecutionResult;
use crate::threading::ThreadedItem;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncType {
    /// Every sync-enabled folder, plus calendars on delta providers
    Full,
    /// Only the listed folders
    Custom(Vec<FolderId>),
    ExecuteRequestsOnly,
    ProfileOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynchronizationOptions {
    pub account_id: AccountId,
    pub sync_type: SyncType,
    /// Correlates syncs started together, e.g. one per account on startup
    pub grouped_tracking_id: Option<String>,
}

impl SynchronizationOptions {
    pub fn new(account_id: impl Into<AccountId>, sync_type: SyncType) -> Self {
        Self {
            account_id: account_id.into(),
            sync_type,
            grouped_tracking_id: None,
        }
    }

    pub fn tracked(mut self, id: impl Into<String>) -> Self {
        self.grouped_tracking_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletedState {
    Success,
    Canceled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynchronizerState {
    Idle,
    Authenticating,
    DiffingFolders,
    PullingChanges,
    ExecutingRequests,
    Failed,
}

impl SynchronizerState {
    pub fn as_str(self) -> &'static str {
        match self {
            SynchronizerState::Idle => "idle",
            SynchronizerState::Authenticating => "authenticating",
            SynchronizerState::DiffingFolders => "diffing folders",
            SynchronizerState::PullingChanges => "pulling changes",
            SynchronizerState::ExecutingRequests => "executing requests",
            SynchronizerState::Failed => "failed",
        }
    }
}

#[derive(Debug)]
pub struct SynchronizationResult {
    pub downloaded_items: Vec<MailItem>,
    pub threads: Vec<ThreadedItem>,
    pub completed_state: CompletedState,
    pub error: Option<SyncError>,
    /// Requests executed during the cycle
    pub requests: RequestExecutionResult,
    pub grouped_tracking_id: Option<String>,
}

impl SynchronizationResult {
    fn new(completed_state: CompletedState, error: Option<SyncError>) -> Self {
        Self {
            downloaded_items: Vec::new(),
            threads: Vec::new(),
            completed_state,
            error,
            requests: RequestExecutionResult::default(),
            grouped_tracking_id: None,
        }
    }

    pub fn success() -> Self {
        Self::new(CompletedState::Success, None)
    }

    pub fn canceled() -> Self {
        Self::new(CompletedState::Canceled, None)
    }

    pub fn failed(error: SyncError) -> Self {
        Self::new(CompletedState::Failed, Some(error))
    }

    pub fn is_success(&self) -> bool {
        self.completed_state == CompletedState::Success
    }
}

/// Mail persisted during a pull, with the folder it was pulled for.
#[derive(Debug, Clone)]
pub(crate) struct Downloaded {
    pub folder_id: FolderId,
    pub item: MailItem,
}
