//! Drains the request queue against a remote client.
//!
//! Each request is applied locally first, then prepared and executed in
//! batches sized by the client's capabilities. A failed request has its local
//! mutation reverted; the rest of its batch keeps its result.

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::local::{self, LocalMutation, UndoToken};
use super::queue::RequestQueue;
use super::{PendingRequest, RequestExecutionResult, RequestFailure, RequestOperation};
use crate::cache::ChangeProcessor;
use crate::error::SyncError;
use crate::model::{Account, FolderId, SpecialFolder};
use crate::provider::{NativeRequest, NativeResponse, RemoteClient};
use crate::recovery::{ErrorContext, ErrorRecoveryChain};

/// A request that was applied locally and translated for the provider.
struct Staged {
    request: PendingRequest,
    undo: UndoToken,
    native: NativeRequest,
}

pub struct ExecutionEngine<'a> {
    account: &'a Account,
    cache: &'a dyn ChangeProcessor,
    recovery: &'a ErrorRecoveryChain,
}

impl<'a> ExecutionEngine<'a> {
    pub fn new(account: &'a Account, cache: &'a dyn ChangeProcessor, recovery: &'a ErrorRecoveryChain) -> Self {
        Self {
            account,
            cache,
            recovery,
        }
    }

    /// Execute everything queued, batch by batch, until the queue is empty or
    /// `cancel` fires. Requests not yet taken stay queued.
    pub async fn execute(
        &self,
        client: &dyn RemoteClient,
        queue: &Mutex<RequestQueue>,
        cancel: &CancellationToken,
    ) -> RequestExecutionResult {
        let batch_size = client.capabilities().batch_size.unwrap_or(1).max(1);
        let mut result = RequestExecutionResult::default();

        loop {
            if cancel.is_cancelled() {
                tracing::debug!("Request execution for {} canceled", self.account.id);
                break;
            }
            let batch = queue.lock().await.take(batch_size);
            if batch.is_empty() {
                break;
            }
            tracing::debug!("Executing {} requests for {}", batch.len(), self.account.id);
            if !self.execute_batch(client, batch, &mut result).await {
                break;
            }
        }

        if !result.is_empty() {
            tracing::info!(
                "{}: {} requests succeeded, {} failed",
                self.account.id,
                result.succeeded,
                result.failed.len()
            );
        }
        result
    }

    /// Returns `false` when draining should stop (authentication lost).
    async fn execute_batch(
        &self,
        client: &dyn RemoteClient,
        batch: Vec<PendingRequest>,
        result: &mut RequestExecutionResult,
    ) -> bool {
        let mut staged = Vec::with_capacity(batch.len());
        for request in batch {
            let mutation = LocalMutation::for_request(&request);
            let undo = match local::apply(self.cache, &self.account.id, &mutation).await {
                Ok(undo) => undo,
                Err(e) => {
                    self.fail(request, UndoToken::Nothing, SyncError::from(e), result).await;
                    continue;
                }
            };
            match client.prepare(&request, self.cache).await {
                Ok(native) => staged.push(Staged { request, undo, native }),
                Err(e) => self.fail(request, undo, e, result).await,
            }
        }

        let mut attempt = 0;
        let mut pending = staged;
        while !pending.is_empty() {
            let total = pending.len();
            let natives: Vec<NativeRequest> = pending.iter().map(|s| s.native.clone()).collect();
            let mut outcomes = client.execute_batch(natives).await.into_iter();

            let mut rate_limited: Vec<Staged> = Vec::new();
            let mut rate_error = None;
            let mut failed = 0;
            let mut auth_lost = false;

            for item in pending {
                match outcomes.next() {
                    Some(Ok(response)) => self.complete(item, response, result).await,
                    Some(Err(e @ SyncError::RateLimited { .. })) => {
                        rate_error.get_or_insert(e);
                        rate_limited.push(item);
                    }
                    Some(Err(e)) => {
                        failed += 1;
                        auth_lost |= matches!(e, SyncError::AuthenticationRequired { .. });
                        self.fail(item.request, item.undo, e, result).await;
                    }
                    None => {
                        failed += 1;
                        let e = SyncError::Protocol("batch response is missing a result".to_string());
                        self.fail(item.request, item.undo, e, result).await;
                    }
                }
            }

            if failed > 0 && total > 1 {
                tracing::warn!("{}", SyncError::PartialBatchFailure { failed, total });
            }
            if auth_lost {
                for item in rate_limited {
                    let e = SyncError::AuthenticationRequired {
                        account: self.account.id.clone(),
                    };
                    self.fail(item.request, item.undo, e, result).await;
                }
                tracing::error!("{} needs re-authentication, stopping request execution", self.account.id);
                return false;
            }

            let Some(error) = rate_error else {
                break;
            };
            attempt += 1;
            let ctx = ErrorContext {
                account: self.account,
                error: &error,
                attempt,
            };
            match self.recovery.recover(&ctx).await {
                Ok(true) => pending = rate_limited,
                Ok(false) | Err(_) => {
                    for item in rate_limited {
                        self.fail(item.request, item.undo, error.duplicate(), result).await;
                    }
                    break;
                }
            }
        }
        true
    }

    async fn complete(&self, staged: Staged, response: NativeResponse, result: &mut RequestExecutionResult) {
        let request = staged.request;
        let account_id = &self.account.id;

        if let Some(created) = &response.created {
            // Compose requests create a local row under the draft's local id
            let superseded = response.replaces.clone().or_else(|| match &request.operation {
                RequestOperation::CreateDraft(draft) | RequestOperation::Send(draft)
                    if draft.local_id != created.item.id =>
                {
                    Some(draft.local_id.clone())
                }
                _ => None,
            });
            if let Some(old) = superseded
                && let Err(e) = self.cache.delete_mail(account_id, &old).await
            {
                tracing::warn!("Failed to drop superseded mail {}: {:#}", old, e);
            }
            if let Err(e) = self.cache.upsert_mail(account_id, created).await {
                tracing::warn!("Failed to store {} returned for {}: {:#}", created.item.id, request.name(), e);
            }
        }

        result.succeeded += 1;
        result.resync_delay = result.resync_delay.max(request.resynchronization_delay());
        for folder in self.affected_folders(&request).await {
            if !result.affected_folders.contains(&folder) {
                result.affected_folders.push(folder);
            }
        }
        tracing::debug!("{} {} succeeded", request.name(), request.grouping_key());
    }

    /// Request folders plus Sent/Draft for compose operations.
    async fn affected_folders(&self, request: &PendingRequest) -> Vec<FolderId> {
        let mut folders = request.affected_folders();
        let special = match &request.operation {
            RequestOperation::Send(_) => Some(SpecialFolder::Sent),
            RequestOperation::CreateDraft(_) => Some(SpecialFolder::Draft),
            _ => None,
        };
        if let Some(special) = special
            && let Ok(Some(folder)) = self.cache.get_special_folder(&self.account.id, special).await
        {
            folders.push(folder.id);
        }
        folders
    }

    async fn fail(&self, request: PendingRequest, undo: UndoToken, error: SyncError, result: &mut RequestExecutionResult) {
        tracing::warn!("{} {} failed: {}", request.name(), request.grouping_key(), error);
        if let Err(e) = local::revert(self.cache, &self.account.id, undo).await {
            tracing::error!("Failed to revert {} {}: {:#}", request.name(), request.grouping_key(), e);
        }
        result.auth_required |= matches!(error, SyncError::AuthenticationRequired { .. });
        result.failed.push(RequestFailure {
            request,
            error: error.to_string(),
        });
    }
}
