//! Engine-wide constants for tuning and recovery bounds
//!
//! Centralizes magic numbers to make them discoverable.

use std::time::Duration;

// === Transport retries (adapter layer) ===

/// Maximum number of retries for transient transport failures.
pub const MAX_RETRIES: u32 = 3;

/// Delay before the first transport retry in milliseconds.
pub const INITIAL_RETRY_DELAY_MS: u64 = 500;

/// Maximum retry delay in seconds for transport retries.
pub const MAX_RETRY_DELAY_SECS: u64 = 30;

// === Rate limiting ===

/// Retries granted to a rate-limited operation before the 429 is surfaced.
pub const RATE_LIMIT_MAX_RETRIES: u32 = 3;

/// Upper bound for a single Retry-After wait in seconds.
pub const RATE_LIMIT_MAX_WAIT_SECS: u64 = 300;

/// Wait used when Retry-After is absent or unparsable.
pub const RATE_LIMIT_DEFAULT_WAIT_SECS: u64 = 60;

// === Retry queue ===

/// Entries that failed this many times are dropped by the sweep.
pub const RETRY_QUEUE_MAX_FAILURES: u32 = 30;

/// Entries older than this (7 days) are dropped by the sweep.
pub const RETRY_QUEUE_MAX_AGE_SECS: i64 = 7 * 24 * 60 * 60;

// === Provider paging and batching ===

/// Microsoft Graph JSON batching allows at most 20 requests per call.
pub const GRAPH_BATCH_SIZE: usize = 20;

/// Page size hint sent to Graph delta queries.
pub const GRAPH_PAGE_SIZE: u32 = 100;

/// Gmail messages.batchModify accepts up to 1000 ids.
pub const GMAIL_BATCH_MODIFY_SIZE: usize = 1000;

/// Page size for Gmail message and history listings.
pub const GMAIL_PAGE_SIZE: u32 = 500;

/// Number of Gmail messages downloaded and persisted per pull batch.
pub const GMAIL_DOWNLOAD_CHUNK: usize = 50;

/// Batch size for IMAP UID FETCH commands.
/// Prevents IMAP command line length limits (~8KB).
pub const IMAP_FETCH_BATCH_SIZE: usize = 500;

/// Preview length in characters.
pub const PREVIEW_LENGTH: usize = 100;

// === Actors ===

/// Capacity of each synchronizer's command channel.
pub const COMMAND_CHANNEL_CAPACITY: usize = 128;

/// Access tokens are considered expired this many seconds early.
pub const TOKEN_EXPIRY_SKEW_SECS: i64 = 60;

// === Resynchronization delays after request execution ===

/// Read/flag changes settle almost immediately on every provider.
pub const RESYNC_DELAY_STATE: Duration = Duration::from_millis(500);

/// Moves, deletes and folder changes need the server to re-index.
pub const RESYNC_DELAY_MOVE: Duration = Duration::from_secs(2);

/// Sent messages take a while to show up in the Sent folder.
pub const RESYNC_DELAY_SEND: Duration = Duration::from_secs(5);
