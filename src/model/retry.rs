use crate::constants::{RETRY_QUEUE_MAX_AGE_SECS, RETRY_QUEUE_MAX_FAILURES};

use super::account::AccountId;

/// A remote id discovered asynchronously that still has to be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryQueueEntry {
    pub id: i64,
    pub account_id: AccountId,
    pub remote_id: String,
    pub failed_count: u32,
    /// Unix timestamp of the first enqueue
    pub created_at: i64,
}

impl RetryQueueEntry {
    /// Whether the periodic sweep should drop this entry.
    pub fn is_expired(&self, now: i64) -> bool {
        self.failed_count >= RETRY_QUEUE_MAX_FAILURES || now - self.created_at > RETRY_QUEUE_MAX_AGE_SECS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(failed_count: u32, created_at: i64) -> RetryQueueEntry {
        RetryQueueEntry {
            id: 1,
            account_id: "acc".to_string(),
            remote_id: "m1".to_string(),
            failed_count,
            created_at,
        }
    }

    #[test]
    fn test_expiry_by_failures() {
        assert!(!entry(29, 1000).is_expired(1000));
        assert!(entry(30, 1000).is_expired(1000));
    }

    #[test]
    fn test_expiry_by_age() {
        let now = 10 * RETRY_QUEUE_MAX_AGE_SECS;
        assert!(!entry(0, now - RETRY_QUEUE_MAX_AGE_SECS).is_expired(now));
        assert!(entry(0, now - RETRY_QUEUE_MAX_AGE_SECS - 1).is_expired(now));
    }
}
