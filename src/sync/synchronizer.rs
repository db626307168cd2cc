use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    Downloaded, SyncType, SynchronizationOptions, SynchronizationResult, SynchronizerState, delta,
    history, protocol,
};
use crate::cache::ChangeProcessor;
use crate::error::{SyncError, SyncResult};
use crate::model::{Account, Folder, FolderId};
use crate::provider::{DeltaClient, HistoryClient, ProtocolClient, RemoteClient};
use crate::recovery::ErrorRecoveryChain;
use crate::requests::engine::ExecutionEngine;
use crate::requests::processor::RequestProcessor;
use crate::requests::queue::RequestQueue;
use crate::requests::{RequestExecutionResult, UserIntent};
use crate::threading::{ThreadedItem, ThreadingStrategy};

/// The provider family an account talks to.
pub enum Backend {
    Delta(Arc<dyn DeltaClient>),
    History(Arc<dyn HistoryClient>),
    Protocol(Arc<dyn ProtocolClient>),
}

impl Backend {
    pub fn remote(&self) -> &dyn RemoteClient {
        match self {
            Backend::Delta(client) => client.as_ref(),
            Backend::History(client) => client.as_ref(),
            Backend::Protocol(client) => client.as_ref(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Backend::Delta(_) => "delta",
            Backend::History(_) => "history",
            Backend::Protocol(_) => "protocol",
        }
    }
}

/// Synchronization engine for one account.
///
/// Callers run one operation at a time; [`super::actor`] enforces that when
/// the synchronizer is shared.
pub struct Synchronizer {
    account: Account,
    backend: Backend,
    cache: Arc<dyn ChangeProcessor>,
    recovery: ErrorRecoveryChain,
    queue: Arc<Mutex<RequestQueue>>,
    state: watch::Sender<SynchronizerState>,
    authenticated: bool,
    /// Earliest start of the next full pull after requests were executed
    resync_not_before: Option<Instant>,
}

impl Synchronizer {
    pub fn new(account: Account, backend: Backend, cache: Arc<dyn ChangeProcessor>) -> Self {
        let recovery = ErrorRecoveryChain::standard(cache.clone());
        let (state, _) = watch::channel(SynchronizerState::Idle);
        Self {
            account,
            backend,
            cache,
            recovery,
            queue: Arc::new(Mutex::new(RequestQueue::new())),
            state,
            authenticated: false,
            resync_not_before: None,
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn cache(&self) -> Arc<dyn ChangeProcessor> {
        self.cache.clone()
    }

    pub fn queue(&self) -> Arc<Mutex<RequestQueue>> {
        self.queue.clone()
    }

    pub fn state(&self) -> SynchronizerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SynchronizerState> {
        self.state.subscribe()
    }

    /// Turn `intent` into requests and queue them for the next execution.
    pub async fn submit(&self, intent: UserIntent) -> SyncResult<usize> {
        RequestProcessor::new(self.cache.as_ref(), &self.account)
            .enqueue(intent, &self.queue)
            .await
    }

    pub async fn synchronize(&mut self, options: SynchronizationOptions, cancel: &CancellationToken) -> SynchronizationResult {
        if options.account_id != self.account.id {
            return SynchronizationResult::failed(SyncError::rejected(
                400,
                format!("options for {} sent to {}", options.account_id, self.account.id),
            ));
        }

        let mut result = match options.sync_type {
            SyncType::ExecuteRequestsOnly => {
                let requests = self.execute_requests(cancel).await;
                let mut result = if requests.auth_required {
                    SynchronizationResult::failed(self.auth_error())
                } else if cancel.is_cancelled() {
                    SynchronizationResult::canceled()
                } else {
                    SynchronizationResult::success()
                };
                result.requests = requests;
                result
            }
            SyncType::ProfileOnly => self.sync_profile().await,
            SyncType::Full => self.pull_cycle(None, cancel).await,
            SyncType::Custom(folder_ids) => self.pull_cycle(Some(folder_ids), cancel).await,
        };
        result.grouped_tracking_id = options.grouped_tracking_id;
        result
    }

    /// Execute the request queue and remember the batch's resynchronization delay.
    pub async fn execute_requests(&mut self, cancel: &CancellationToken) -> RequestExecutionResult {
        self.set_state(SynchronizerState::ExecutingRequests);
        let result = self.drain_queue(cancel).await;
        self.note_requests(&result);
        if result.auth_required {
            let _ = self.fail(self.auth_error());
        } else {
            self.set_state(SynchronizerState::Idle);
        }
        result
    }

    async fn sync_profile(&mut self) -> SynchronizationResult {
        let remote = self.backend.remote();
        let profile = match self.recovery.run(&self.account, move || remote.fetch_profile()).await {
            Ok(profile) => profile,
            Err(e) => return self.fail(e),
        };
        if let Err(e) = self.cache.update_account_profile(&self.account.id, &profile).await {
            return self.fail(e.into());
        }
        tracing::info!("Updated profile for {} ({})", self.account.id, profile.address);
        self.account.display_name = profile.display_name;
        SynchronizationResult::success()
    }

    async fn pull_cycle(&mut self, scope: Option<Vec<FolderId>>, cancel: &CancellationToken) -> SynchronizationResult {
        if scope.is_none() && !self.wait_for_resync_delay(cancel).await {
            return SynchronizationResult::canceled();
        }
        tracing::info!(
            "Starting {} sync for {} ({})",
            if scope.is_some() { "custom" } else { "full" },
            self.account.id,
            self.backend.kind()
        );

        let executed = Mutex::new(RequestExecutionResult::default());
        let outcome = self.pull_and_thread(scope.as_deref(), cancel, &executed).await;
        let requests = executed.into_inner();
        self.note_requests(&requests);

        let mut result = match outcome {
            Ok((downloaded, threads)) => {
                tracing::info!(
                    "Sync for {} finished: {} new messages",
                    self.account.id,
                    downloaded.len()
                );
                self.set_state(SynchronizerState::Idle);
                let mut result = SynchronizationResult::success();
                result.downloaded_items = downloaded.into_iter().map(|d| d.item).collect();
                result.threads = threads;
                result
            }
            Err(SyncError::Canceled) => {
                tracing::info!("Sync for {} canceled", self.account.id);
                self.set_state(SynchronizerState::Idle);
                SynchronizationResult::canceled()
            }
            Err(e) => self.fail(e),
        };
        result.requests = requests;
        result
    }

    async fn pull_and_thread(
        &mut self,
        scope: Option<&[FolderId]>,
        cancel: &CancellationToken,
        executed: &Mutex<RequestExecutionResult>,
    ) -> SyncResult<(Vec<Downloaded>, Vec<ThreadedItem>)> {
        if cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        if !self.authenticated {
            self.set_state(SynchronizerState::Authenticating);
            self.backend.remote().refresh_token().await?;
            self.authenticated = true;
        }

        self.set_state(SynchronizerState::DiffingFolders);
        self.diff_folders().await?;

        self.set_state(SynchronizerState::PullingChanges);
        let this: &Self = self;
        let downloaded = this
            .recovery
            .run(&this.account, move || this.pull(scope, cancel, executed))
            .await?;

        self.set_state(SynchronizerState::ExecutingRequests);
        let leftover = self.drain_queue(cancel).await;
        let auth_lost = leftover.auth_required;
        executed.lock().await.merge(leftover);
        if auth_lost {
            return Err(self.auth_error());
        }

        let threads = self.thread(&downloaded).await?;
        Ok((downloaded, threads))
    }

    async fn diff_folders(&self) -> SyncResult<()> {
        let remote = self.backend.remote();
        let folders = self.recovery.run(&self.account, move || remote.list_folders()).await?;
        let diff = self.cache.upsert_folders(&self.account.id, &folders).await?;
        if !diff.is_empty() {
            tracing::info!(
                "{}: {} folders added, {} updated, {} removed",
                self.account.id,
                diff.inserted.len(),
                diff.updated.len(),
                diff.deleted.len()
            );
        }

        if let Backend::Delta(client) = &self.backend {
            let client = client.as_ref();
            let calendars = self.recovery.run(&self.account, move || client.list_calendars()).await?;
            self.cache.upsert_calendars(&self.account.id, &calendars).await?;
        }
        Ok(())
    }

    /// One attempt at pulling every folder in scope. Folders are reloaded on
    /// each attempt so a cursor reset by recovery is picked up.
    async fn pull(
        &self,
        scope: Option<&[FolderId]>,
        cancel: &CancellationToken,
        executed: &Mutex<RequestExecutionResult>,
    ) -> SyncResult<Vec<Downloaded>> {
        let cache = self.cache.as_ref();
        let account_id = self.account.id.as_str();
        let mut downloaded = Vec::new();

        match &self.backend {
            Backend::Delta(client) => {
                for folder in self.scope_folders(scope).await? {
                    self.between_batches(cancel, executed).await?;
                    downloaded.extend(delta::pull_folder(client.as_ref(), cache, account_id, &folder, cancel).await?);
                }
                if scope.is_none() {
                    for calendar in cache.get_calendars(account_id).await? {
                        self.between_batches(cancel, executed).await?;
                        let created =
                            delta::pull_calendar(client.as_ref(), cache, account_id, &calendar, cancel).await?;
                        tracing::debug!("{}: {} new calendar items", calendar.name, created);
                    }
                }
            }
            Backend::History(client) => {
                // One account-wide cursor: a custom scope still replays all history
                let folders = self.scope_folders(None).await?;
                self.between_batches(cancel, executed).await?;
                downloaded = history::pull(client.as_ref(), cache, account_id, &folders, cancel).await?;
            }
            Backend::Protocol(client) => {
                for folder in self.scope_folders(scope).await? {
                    self.between_batches(cancel, executed).await?;
                    downloaded.extend(protocol::pull_folder(client.as_ref(), cache, account_id, &folder, cancel).await?);
                }
            }
        }
        Ok(downloaded)
    }

    /// Sync-enabled folders, or exactly the listed ones for a custom scope.
    async fn scope_folders(&self, scope: Option<&[FolderId]>) -> SyncResult<Vec<Folder>> {
        let folders = self.cache.get_folders(&self.account.id).await?;
        Ok(match scope {
            Some(ids) => folders.into_iter().filter(|f| ids.contains(&f.id)).collect(),
            None => folders.into_iter().filter(|f| f.sync_enabled).collect(),
        })
    }

    /// Run requests that were queued while the pull was in progress.
    /// Losing authentication here ends the pull.
    async fn between_batches(&self, cancel: &CancellationToken, executed: &Mutex<RequestExecutionResult>) -> SyncResult<()> {
        if cancel.is_cancelled() || self.queue.lock().await.is_empty() {
            return Ok(());
        }
        self.set_state(SynchronizerState::ExecutingRequests);
        let result = self.drain_queue(cancel).await;
        let auth_lost = result.auth_required;
        executed.lock().await.merge(result);
        if auth_lost {
            return Err(self.auth_error());
        }
        self.set_state(SynchronizerState::PullingChanges);
        Ok(())
    }

    async fn drain_queue(&self, cancel: &CancellationToken) -> RequestExecutionResult {
        if self.queue.lock().await.is_empty() {
            return RequestExecutionResult::default();
        }
        ExecutionEngine::new(&self.account, self.cache.as_ref(), &self.recovery)
            .execute(self.backend.remote(), &self.queue, cancel)
            .await
    }

    async fn thread(&self, downloaded: &[Downloaded]) -> SyncResult<Vec<ThreadedItem>> {
        let mut by_folder: Vec<(FolderId, Vec<_>)> = Vec::new();
        for d in downloaded {
            match by_folder.iter_mut().find(|(id, _)| *id == d.folder_id) {
                Some((_, items)) => items.push(d.item.clone()),
                None => by_folder.push((d.folder_id, vec![d.item.clone()])),
            }
        }

        let strategy = ThreadingStrategy::new(self.cache.as_ref());
        let mut threads = Vec::new();
        for (folder_id, items) in by_folder {
            threads.extend(strategy.thread_items(&self.account.id, folder_id, items).await?);
        }
        Ok(threads)
    }

    fn note_requests(&mut self, result: &RequestExecutionResult) {
        if !result.is_empty() {
            self.resync_not_before = Some(Instant::now() + result.resync_delay);
        }
    }

    /// Returns `false` if canceled while waiting.
    async fn wait_for_resync_delay(&mut self, cancel: &CancellationToken) -> bool {
        let Some(at) = self.resync_not_before.take() else {
            return true;
        };
        if at <= Instant::now() {
            return true;
        }
        tracing::debug!("Waiting {:?} for the server to settle", at - Instant::now());
        tokio::select! {
            _ = tokio::time::sleep_until(at) => true,
            _ = cancel.cancelled() => false,
        }
    }

    fn auth_error(&self) -> SyncError {
        SyncError::AuthenticationRequired {
            account: self.account.id.clone(),
        }
    }

    fn fail(&mut self, error: SyncError) -> SynchronizationResult {
        if let SyncError::AuthenticationRequired { .. } = error {
            self.authenticated = false;
        }
        tracing::error!("Sync for {} failed: {}", self.account.id, error);
        self.set_state(SynchronizerState::Failed);
        SynchronizationResult::failed(error)
    }

    fn set_state(&self, state: SynchronizerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("{}: {} -> {}", self.account.id, previous.as_str(), state.as_str());
        }
    }
}
