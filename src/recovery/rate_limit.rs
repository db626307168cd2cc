use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ErrorContext, RecoveryHandler};
use crate::constants::{RATE_LIMIT_DEFAULT_WAIT_SECS, RATE_LIMIT_MAX_RETRIES, RATE_LIMIT_MAX_WAIT_SECS};
use crate::error::{SyncError, SyncResult};

/// Waits out a 429 and asks for a retry, a bounded number of times.
#[derive(Debug, Clone)]
pub struct RateLimitHandler {
    max_retries: u32,
    max_wait: Duration,
    default_wait: Duration,
}

impl Default for RateLimitHandler {
    fn default() -> Self {
        Self {
            max_retries: RATE_LIMIT_MAX_RETRIES,
            max_wait: Duration::from_secs(RATE_LIMIT_MAX_WAIT_SECS),
            default_wait: Duration::from_secs(RATE_LIMIT_DEFAULT_WAIT_SECS),
        }
    }
}

impl RateLimitHandler {
    fn wait_for(&self, retry_after: Option<&str>) -> Duration {
        parse_retry_after(retry_after, Utc::now())
            .unwrap_or(self.default_wait)
            .min(self.max_wait)
    }
}

#[async_trait]
impl RecoveryHandler for RateLimitHandler {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn can_handle(&self, ctx: &ErrorContext<'_>) -> bool {
        matches!(ctx.error, SyncError::RateLimited { .. })
    }

    async fn handle(&self, ctx: &ErrorContext<'_>) -> SyncResult<bool> {
        let SyncError::RateLimited { retry_after } = ctx.error else {
            return Ok(false);
        };
        if ctx.attempt > self.max_retries {
            tracing::error!(
                "{} still rate limited after {} retries, giving up",
                ctx.account.id,
                self.max_retries
            );
            return Ok(false);
        }

        let wait = self.wait_for(retry_after.as_deref());
        tracing::warn!(
            "{} rate limited, retry {}/{} in {:?}",
            ctx.account.id,
            ctx.attempt,
            self.max_retries,
            wait
        );
        tokio::time::sleep(wait).await;
        Ok(true)
    }
}

/// Parse a `Retry-After` value: delta seconds or an HTTP-date.
///
/// Dates in the past yield zero. Returns `None` for absent or garbage values.
pub fn parse_retry_after(value: Option<&str>, now: DateTime<Utc>) -> Option<Duration> {
    let value = value?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let secs = (at.with_timezone(&Utc) - now).num_seconds().max(0);
    Some(Duration::from_secs(secs as u64))
}
