use std::sync::Arc;

use async_trait::async_trait;

use super::{ErrorContext, RecoveryHandler};
use crate::cache::ChangeProcessor;
use crate::error::{SyncError, SyncResult};

/// Turns an expired cursor into a clean full resync.
///
/// Wipes the account's cached mail and calendar items and resets every cursor,
/// which also clears the initial-sync flags. One reset per operation: a second
/// expiry right after a reset is reported instead of looping.
pub struct CursorExpiredHandler {
    cache: Arc<dyn ChangeProcessor>,
}

impl CursorExpiredHandler {
    pub fn new(cache: Arc<dyn ChangeProcessor>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl RecoveryHandler for CursorExpiredHandler {
    fn name(&self) -> &'static str {
        "cursor-expired"
    }

    fn can_handle(&self, ctx: &ErrorContext<'_>) -> bool {
        matches!(ctx.error, SyncError::CursorExpired)
    }

    async fn handle(&self, ctx: &ErrorContext<'_>) -> SyncResult<bool> {
        if ctx.attempt > 1 {
            tracing::error!("Cursor for {} expired again after a reset", ctx.account.id);
            return Ok(false);
        }
        tracing::warn!("Cursor for {} expired, resetting for a full resync", ctx.account.id);
        self.cache.wipe_account_cache(&ctx.account.id).await?;
        self.cache.reset_cursors(&ctx.account.id).await?;
        Ok(true)
    }
}
