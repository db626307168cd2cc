//! Transport retries with exponential backoff.

use std::future::Future;
use std::time::Duration;

use crate::constants::{INITIAL_RETRY_DELAY_MS, MAX_RETRIES, MAX_RETRY_DELAY_SECS};
use crate::error::SyncError;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            initial_delay: Duration::from_millis(INITIAL_RETRY_DELAY_MS),
            max_delay: Duration::from_secs(MAX_RETRY_DELAY_SECS),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
        }
    }
}

/// Execute an async operation, retrying transient transport failures.
///
/// Only [`SyncError::Transport`] is retried; every other error is returned
/// immediately so the recovery chain or the caller can act on it.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, mut operation: F) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut attempts = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempts < config.max_retries => {
                attempts += 1;
                tracing::warn!(
                    "Transport failure (attempt {}/{}): {}. Retrying in {:?}...",
                    attempts,
                    config.max_retries + 1,
                    e,
                    delay
                );

                tokio::time::sleep(delay).await;

                // Exponential backoff with cap
                delay = (delay * 2).min(config.max_delay);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries, Duration::from_millis(10), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let attempts = AtomicU32::new(0);

        let result = with_retry(&config(3), || {
            let count = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if count < 3 {
                    Err(SyncError::Transport("reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(&config(2), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::Transport("down".into())) }
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(attempts.load(Ordering::SeqCst), 3); // 1 initial + 2 retries
    }

    #[tokio::test]
    async fn test_non_transient_not_retried() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(&config(3), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::CursorExpired) }
        })
        .await;

        assert!(matches!(result, Err(SyncError::CursorExpired)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_capped() {
        let config = RetryConfig::new(3, Duration::from_secs(20), Duration::from_secs(30));
        let start = tokio::time::Instant::now();

        let _: Result<(), _> = with_retry(&config, || async { Err(SyncError::Transport("x".into())) }).await;

        // 20 + 30 + 30
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(80) && elapsed < Duration::from_secs(81));
    }
}
