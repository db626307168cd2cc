//! Error recovery chain.
//!
//! Handlers are consulted in registration order and the first one whose
//! [`RecoveryHandler::can_handle`] matches decides. `Ok(true)` tells the caller
//! to retry the failed operation; `Ok(false)` means the error is final.

mod cursor_expired;
mod rate_limit;

pub use cursor_expired::CursorExpiredHandler;
pub use rate_limit::{RateLimitHandler, parse_retry_after};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::ChangeProcessor;
use crate::error::{SyncError, SyncResult};
use crate::model::Account;

/// The failure being recovered from.
#[derive(Debug)]
pub struct ErrorContext<'a> {
    pub account: &'a Account,
    pub error: &'a SyncError,
    /// How many times the handling handler has seen this operation fail, starting at 1
    pub attempt: u32,
}

#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, ctx: &ErrorContext<'_>) -> bool;

    /// Returns whether the operation should be retried.
    async fn handle(&self, ctx: &ErrorContext<'_>) -> SyncResult<bool>;
}

pub struct ErrorRecoveryChain {
    handlers: Vec<Box<dyn RecoveryHandler>>,
}

impl ErrorRecoveryChain {
    pub fn new(handlers: Vec<Box<dyn RecoveryHandler>>) -> Self {
        Self { handlers }
    }

    /// Cursor-expired reset followed by rate-limit backoff.
    pub fn standard(cache: Arc<dyn ChangeProcessor>) -> Self {
        Self::new(vec![
            Box::new(CursorExpiredHandler::new(cache)),
            Box::new(RateLimitHandler::default()),
        ])
    }

    pub async fn recover(&self, ctx: &ErrorContext<'_>) -> SyncResult<bool> {
        match self.handlers.iter().find(|h| h.can_handle(ctx)) {
            Some(handler) => Self::dispatch(handler.as_ref(), ctx).await,
            None => Ok(false),
        }
    }

    async fn dispatch(handler: &dyn RecoveryHandler, ctx: &ErrorContext<'_>) -> SyncResult<bool> {
        tracing::debug!(
            "{} handling '{}' for {} (attempt {})",
            handler.name(),
            ctx.error,
            ctx.account.id,
            ctx.attempt
        );
        handler.handle(ctx).await
    }

    /// Run `operation` until it succeeds or the chain gives up.
    ///
    /// Attempts are counted per handler, so a rate limit does not use up the
    /// single cursor reset and vice versa.
    pub async fn run<F, Fut, T>(&self, account: &Account, mut operation: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut attempts: HashMap<&'static str, u32> = HashMap::new();
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(SyncError::Canceled) => return Err(SyncError::Canceled),
                Err(e) => e,
            };

            let mut retry = false;
            for handler in &self.handlers {
                let attempt = attempts.get(handler.name()).copied().unwrap_or(0) + 1;
                let ctx = ErrorContext {
                    account,
                    error: &error,
                    attempt,
                };
                if handler.can_handle(&ctx) {
                    attempts.insert(handler.name(), attempt);
                    retry = Self::dispatch(handler.as_ref(), &ctx).await?;
                    break;
                }
            }
            if !retry {
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::model::ProviderKind;

    struct Always(bool);

    #[async_trait]
    impl RecoveryHandler for Always {
        fn name(&self) -> &'static str {
            "always"
        }

        fn can_handle(&self, _ctx: &ErrorContext<'_>) -> bool {
            true
        }

        async fn handle(&self, _ctx: &ErrorContext<'_>) -> SyncResult<bool> {
            Ok(self.0)
        }
    }

    /// Retries its error kind, recording the attempt number it was given.
    struct Recording {
        name: &'static str,
        matches: fn(&SyncError) -> bool,
        seen: Arc<std::sync::Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl RecoveryHandler for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn can_handle(&self, ctx: &ErrorContext<'_>) -> bool {
            (self.matches)(ctx.error)
        }

        async fn handle(&self, ctx: &ErrorContext<'_>) -> SyncResult<bool> {
            self.seen.lock().unwrap().push(ctx.attempt);
            Ok(true)
        }
    }

    fn account() -> Account {
        Account::new("acc", "me@example.com", ProviderKind::Outlook)
    }

    #[tokio::test]
    async fn test_first_matching_handler_decides() {
        let chain = ErrorRecoveryChain::new(vec![Box::new(Always(false)), Box::new(Always(true))]);
        let account = account();
        let ctx = ErrorContext {
            account: &account,
            error: &SyncError::CursorExpired,
            attempt: 1,
        };
        assert!(!chain.recover(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_unhandled_error_is_final() {
        let chain = ErrorRecoveryChain::new(Vec::new());
        let calls = AtomicU32::new(0);
        let result: SyncResult<()> = chain
            .run(&account(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::rejected(400, "bad")) }
            })
            .await;
        assert!(matches!(result, Err(SyncError::Rejected { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_skips_recovery() {
        let chain = ErrorRecoveryChain::new(vec![Box::new(Always(true))]);
        let result: SyncResult<()> = chain.run(&account(), || async { Err(SyncError::Canceled) }).await;
        assert!(matches!(result, Err(SyncError::Canceled)));
    }

    #[tokio::test]
    async fn test_attempts_are_counted_per_handler() {
        let cursor_seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let rate_seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain = ErrorRecoveryChain::new(vec![
            Box::new(Recording {
                name: "cursor",
                matches: |e| matches!(e, SyncError::CursorExpired),
                seen: cursor_seen.clone(),
            }),
            Box::new(Recording {
                name: "rate",
                matches: |e| matches!(e, SyncError::RateLimited { .. }),
                seen: rate_seen.clone(),
            }),
        ]);
        let script = std::sync::Mutex::new(vec![
            Err(SyncError::RateLimited { retry_after: None }),
            Err(SyncError::CursorExpired),
            Err(SyncError::RateLimited { retry_after: None }),
            Ok(7),
        ]);

        let result = chain
            .run(&account(), || {
                let next = script.lock().unwrap().remove(0);
                async move { next }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(*cursor_seen.lock().unwrap(), vec![1]);
        assert_eq!(*rate_seen.lock().unwrap(), vec![1, 2]);
    }
}
