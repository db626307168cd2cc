//! Synchronizer actor: one task per account, commands over a channel.
//!
//! Intents are processed and queued directly by the handle, so a user action
//! taken during a long pull is picked up between pull batches instead of
//! waiting for the whole cycle.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::{SyncType, SynchronizationOptions, SynchronizationResult, Synchronizer, SynchronizerState};
use crate::cache::ChangeProcessor;
use crate::constants::COMMAND_CHANNEL_CAPACITY;
use crate::error::SyncResult;
use crate::model::{Account, AccountId};
use crate::requests::processor::RequestProcessor;
use crate::requests::queue::RequestQueue;
use crate::requests::{RequestExecutionResult, UserIntent};

pub enum SyncCommand {
    Synchronize {
        options: SynchronizationOptions,
        reply: Option<oneshot::Sender<SynchronizationResult>>,
    },
    ExecuteRequests {
        reply: Option<oneshot::Sender<RequestExecutionResult>>,
    },
    Shutdown,
}

/// Cloneable handle to a running synchronizer.
#[derive(Clone)]
pub struct SynchronizerHandle {
    account: Account,
    cache: Arc<dyn ChangeProcessor>,
    queue: Arc<Mutex<RequestQueue>>,
    cmd_tx: mpsc::Sender<SyncCommand>,
    state_rx: watch::Receiver<SynchronizerState>,
    /// Token of the operation currently running (or last run)
    current: Arc<Mutex<CancellationToken>>,
    shutdown: CancellationToken,
}

/// Spawn the actor task for `sync` and return a handle to it.
pub fn spawn_synchronizer(sync: Synchronizer) -> SynchronizerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let shutdown = CancellationToken::new();
    let current = Arc::new(Mutex::new(shutdown.child_token()));

    let handle = SynchronizerHandle {
        account: sync.account().clone(),
        cache: sync.cache(),
        queue: sync.queue(),
        cmd_tx: cmd_tx.clone(),
        state_rx: sync.subscribe(),
        current: current.clone(),
        shutdown: shutdown.clone(),
    };

    tokio::spawn(synchronizer_actor(sync, cmd_rx, cmd_tx.downgrade(), current, shutdown));
    handle
}

async fn synchronizer_actor(
    mut sync: Synchronizer,
    mut cmd_rx: mpsc::Receiver<SyncCommand>,
    self_tx: mpsc::WeakSender<SyncCommand>,
    current: Arc<Mutex<CancellationToken>>,
    shutdown: CancellationToken,
) {
    let account_id = sync.account().id.clone();
    tracing::info!("Synchronizer for {} started", account_id);

    loop {
        let command = tokio::select! {
            command = cmd_rx.recv() => command,
            _ = shutdown.cancelled() => None,
        };
        let Some(command) = command else {
            break;
        };

        match command {
            SyncCommand::Synchronize { options, reply } => {
                let token = begin_operation(&current, &shutdown).await;
                let result = sync.synchronize(options, &token).await;
                schedule_resync(&self_tx, &account_id, &result.requests);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            SyncCommand::ExecuteRequests { reply } => {
                let token = begin_operation(&current, &shutdown).await;
                let result = sync.execute_requests(&token).await;
                schedule_resync(&self_tx, &account_id, &result);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            SyncCommand::Shutdown => break,
        }
    }

    tracing::info!("Synchronizer for {} stopped", account_id);
}

async fn begin_operation(current: &Mutex<CancellationToken>, shutdown: &CancellationToken) -> CancellationToken {
    let token = shutdown.child_token();
    *current.lock().await = token.clone();
    token
}

/// Pull the folders touched by executed requests once the server has settled.
fn schedule_resync(self_tx: &mpsc::WeakSender<SyncCommand>, account_id: &str, result: &RequestExecutionResult) {
    if result.affected_folders.is_empty() {
        return;
    }
    let options = SynchronizationOptions::new(account_id, SyncType::Custom(result.affected_folders.clone()));
    let delay = result.resync_delay;
    let self_tx = self_tx.clone();

    tracing::debug!(
        "Resyncing {} folders of {} in {:?}",
        result.affected_folders.len(),
        account_id,
        delay
    );
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(tx) = self_tx.upgrade() {
            let _ = tx.send(SyncCommand::Synchronize { options, reply: None }).await;
        }
    });
}

impl SynchronizerHandle {
    pub fn account_id(&self) -> &AccountId {
        &self.account.id
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn state(&self) -> SynchronizerState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SynchronizerState> {
        self.state_rx.clone()
    }

    /// Whether both handles drive the same actor.
    pub fn same_instance(&self, other: &SynchronizerHandle) -> bool {
        self.cmd_tx.same_channel(&other.cmd_tx)
    }

    pub async fn synchronize(&self, options: SynchronizationOptions) -> SynchronizationResult {
        let (reply, rx) = oneshot::channel();
        let command = SyncCommand::Synchronize {
            options,
            reply: Some(reply),
        };
        if self.cmd_tx.send(command).await.is_err() {
            tracing::warn!("Synchronizer for {} is not running", self.account.id);
            return SynchronizationResult::canceled();
        }
        rx.await.unwrap_or_else(|_| SynchronizationResult::canceled())
    }

    /// Queue the requests for `intent` and ask the actor to execute them.
    /// Returns how many requests were queued.
    pub async fn submit(&self, intent: UserIntent) -> SyncResult<usize> {
        let queued = RequestProcessor::new(self.cache.as_ref(), &self.account)
            .enqueue(intent, &self.queue)
            .await?;
        if queued > 0 && self.cmd_tx.send(SyncCommand::ExecuteRequests { reply: None }).await.is_err() {
            tracing::warn!("Synchronizer for {} is not running, requests stay queued", self.account.id);
        }
        Ok(queued)
    }

    /// Execute whatever is queued and wait for the outcome.
    pub async fn execute_requests(&self) -> RequestExecutionResult {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SyncCommand::ExecuteRequests { reply: Some(reply) })
            .await
            .is_err()
        {
            return RequestExecutionResult::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Cancel the operation in progress, if any.
    pub async fn cancel_current(&self) {
        self.current.lock().await.cancel();
    }

    /// Cancel any running operation and wait for the actor to stop.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let _ = self.cmd_tx.send(SyncCommand::Shutdown).await;
        self.cmd_tx.closed().await;
    }

    pub fn is_running(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::Cache;
    use crate::model::{MailItem, NewMailPackage, ProviderKind, RemoteFolder, SpecialFolder};
    use crate::provider::ChangePage;
    use crate::provider::fake::FakeProvider;
    use crate::requests::MailAction;
    use crate::sync::{Backend, CompletedState};

    async fn spawn() -> (SynchronizerHandle, Arc<FakeProvider>, Arc<Cache>) {
        let cache = Arc::new(Cache::open_in_memory().await.unwrap());
        let account = Account::new("acc", "me@contoso.com", ProviderKind::Outlook);
        cache.ensure_account(&account).await.unwrap();
        let provider = Arc::new(
            FakeProvider::new().with_folders(vec![RemoteFolder::new("inbox", "Inbox", SpecialFolder::Inbox)]),
        );
        let item = MailItem {
            id: "m1".to_string(),
            remote_id: "m1".to_string(),
            ..Default::default()
        };
        provider.push_folder_page(
            "inbox",
            Ok(ChangePage {
                items: vec![NewMailPackage::new(item, "inbox")],
                deletions: Vec::new(),
                next_cursor: Some("delta-1".to_string()),
                has_more: false,
            }),
        );
        let sync = Synchronizer::new(account, Backend::Delta(provider.clone()), cache.clone());
        (spawn_synchronizer(sync), provider, cache)
    }

    fn full() -> SynchronizationOptions {
        SynchronizationOptions::new("acc", SyncType::Full)
    }

    #[tokio::test]
    async fn test_synchronize_through_handle() {
        let (handle, _provider, cache) = spawn().await;

        let result = handle.synchronize(full()).await;

        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.downloaded_items.len(), 1);
        assert!(cache.get_mail("acc", "m1").await.unwrap().is_some());
        assert_eq!(handle.state(), SynchronizerState::Idle);
    }

    #[tokio::test]
    async fn test_submitted_intent_is_executed() {
        let (handle, provider, cache) = spawn().await;
        handle.synchronize(full()).await;

        let queued = handle
            .submit(UserIntent::Mail {
                action: MailAction::MarkRead,
                mail_ids: vec!["m1".to_string()],
            })
            .await
            .unwrap();
        assert_eq!(queued, 1);
        // Serialized behind the execution triggered by submit
        handle.execute_requests().await;

        assert_eq!(provider.executed().len(), 1);
        assert!(cache.get_mail("acc", "m1").await.unwrap().unwrap().is_read);
    }

    #[tokio::test]
    async fn test_affected_folders_are_resynced_after_delay() {
        let (handle, provider, _cache) = spawn().await;
        tokio::time::pause();
        handle.synchronize(full()).await;
        let pulls_before = provider.cursors_seen().len();

        handle
            .submit(UserIntent::Mail {
                action: MailAction::Flag,
                mail_ids: vec!["m1".to_string()],
            })
            .await
            .unwrap();
        handle.execute_requests().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        // Queued behind the scheduled custom sync
        handle.execute_requests().await;

        let seen = provider.cursors_seen();
        assert_eq!(seen.len(), pulls_before + 1);
        assert_eq!(seen.last().unwrap(), &("inbox".to_string(), Some("delta-1".to_string())));
    }

    #[tokio::test]
    async fn test_cancel_current_stops_waiting_sync() {
        let (handle, _provider, _cache) = spawn().await;
        tokio::time::pause();
        handle.synchronize(full()).await;
        handle
            .submit(UserIntent::Mail {
                action: MailAction::MarkRead,
                mail_ids: vec!["m1".to_string()],
            })
            .await
            .unwrap();
        handle.execute_requests().await;

        // The full sync now waits out the resync delay
        let running = tokio::spawn({
            let handle = handle.clone();
            async move { handle.synchronize(full()).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel_current().await;

        let result = running.await.unwrap();
        assert_eq!(result.completed_state, CompletedState::Canceled);
        assert_eq!(handle.state(), SynchronizerState::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_actor() {
        let (handle, _provider, _cache) = spawn().await;
        handle.shutdown().await;
        assert!(!handle.is_running());

        let result = handle.synchronize(full()).await;
        assert_eq!(result.completed_state, CompletedState::Canceled);
    }

    #[tokio::test]
    async fn test_clones_share_one_actor() {
        let (handle, _provider, _cache) = spawn().await;
        let clone = handle.clone();
        assert!(handle.same_instance(&clone));
        assert_eq!(clone.account_id(), "acc");
    }
}
