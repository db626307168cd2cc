//! Local cache boundary.
//!
//! Every read and write of cached mail, folder, calendar and retry-queue state
//! goes through [`ChangeProcessor`]. The crate ships one implementation,
//! [`Cache`], backed by SQLite.

mod db;

pub use db::Cache;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{
    Account, AccountProfile, Calendar, CalendarId, CalendarItem, Folder, FolderDiff, FolderId,
    MailCopy, MailItem, MailSnapshot, MailState, NewMailPackage, RemoteCalendar, RemoteFolder,
    ResponseStatus, RetryQueueEntry, SpecialFolder,
};

/// Persistence contract used by synchronizers and the request pipeline.
///
/// Each method is atomic: it either fully applies or leaves the cache untouched.
#[async_trait]
pub trait ChangeProcessor: Send + Sync {
    //
    // Accounts
    //

    /// Insert the account row if missing. Existing rows keep their cursor.
    async fn ensure_account(&self, account: &Account) -> Result<()>;
    async fn get_account(&self, account_id: &str) -> Result<Option<Account>>;
    async fn update_account_profile(&self, account_id: &str, profile: &AccountProfile) -> Result<()>;
    async fn update_account_cursor(&self, account_id: &str, cursor: Option<&str>) -> Result<()>;
    /// Remove the account and everything it owns.
    async fn delete_account(&self, account_id: &str) -> Result<()>;
    /// Drop all cached mail, calendar items and retry entries. Folders survive.
    async fn wipe_account_cache(&self, account_id: &str) -> Result<()>;
    /// Forget every cursor and protocol state so the next pull is a full one.
    async fn reset_cursors(&self, account_id: &str) -> Result<()>;

    //
    // Folders
    //

    /// Reconcile local folders with a remote listing. Returns what changed.
    async fn upsert_folders(&self, account_id: &str, folders: &[RemoteFolder]) -> Result<FolderDiff>;
    async fn get_folders(&self, account_id: &str) -> Result<Vec<Folder>>;
    async fn get_folder(&self, folder_id: FolderId) -> Result<Option<Folder>>;
    async fn get_folder_by_remote_id(&self, account_id: &str, remote_id: &str) -> Result<Option<Folder>>;
    async fn get_special_folder(&self, account_id: &str, special: SpecialFolder) -> Result<Option<Folder>>;
    async fn rename_folder(&self, folder_id: FolderId, name: &str) -> Result<()>;
    async fn update_folder_cursor(&self, folder_id: FolderId, cursor: Option<&str>) -> Result<()>;
    async fn set_initial_sync_completed(&self, folder_id: FolderId, completed: bool) -> Result<()>;
    async fn update_folder_protocol_state(
        &self,
        folder_id: FolderId,
        uid_validity: u32,
        highest_mod_seq: Option<u64>,
    ) -> Result<()>;

    //
    // Mail
    //

    /// Insert-or-ignore by identity and create the listed assignments.
    /// Returns `true` when a new mail row was created.
    async fn upsert_mail(&self, account_id: &str, package: &NewMailPackage) -> Result<bool>;
    async fn delete_mail(&self, account_id: &str, mail_id: &str) -> Result<()>;
    async fn get_mail(&self, account_id: &str, mail_id: &str) -> Result<Option<MailItem>>;
    /// Folders the mail is currently assigned to.
    async fn get_assignments(&self, account_id: &str, mail_id: &str) -> Result<Vec<Folder>>;
    async fn create_assignment(&self, account_id: &str, mail_id: &str, folder_remote_id: &str) -> Result<()>;
    /// Removes one assignment; mail left without any assignment is deleted.
    async fn delete_assignment(&self, account_id: &str, mail_id: &str, folder_remote_id: &str) -> Result<()>;
    /// Replace all assignments of a mail with the given folders.
    async fn set_mail_folders(&self, account_id: &str, mail_id: &str, folder_ids: &[FolderId]) -> Result<()>;
    async fn set_read_status(&self, account_id: &str, mail_id: &str, is_read: bool) -> Result<()>;
    async fn set_flag_status(&self, account_id: &str, mail_id: &str, is_flagged: bool) -> Result<()>;
    /// Refresh read/flag state. Returns `true` when something changed.
    async fn update_mail_state(&self, account_id: &str, mail_id: &str, state: MailState) -> Result<bool>;
    async fn get_known_protocol_ids(&self, folder_id: FolderId) -> Result<HashSet<u32>>;
    async fn delete_protocol_uids(&self, account_id: &str, folder_id: FolderId, uids: &[u32]) -> Result<usize>;
    async fn clear_folder_mail(&self, account_id: &str, folder_id: FolderId) -> Result<usize>;
    /// Unread mail ids assigned to a folder.
    async fn get_unread_in_folder(&self, account_id: &str, folder_id: FolderId) -> Result<Vec<String>>;
    /// One entry per (mail, assignment) for the thread, limited to `folder_ids`.
    async fn get_thread_items(
        &self,
        account_id: &str,
        thread_id: &str,
        folder_ids: &[FolderId],
    ) -> Result<Vec<MailCopy>>;
    async fn find_thread_id_by_message_ids(&self, account_id: &str, message_ids: &[String]) -> Result<Option<String>>;
    async fn snapshot_mail(&self, account_id: &str, mail_id: &str) -> Result<Option<MailSnapshot>>;
    async fn restore_mail(&self, account_id: &str, snapshot: &MailSnapshot) -> Result<()>;
    async fn mail_count(&self, account_id: &str) -> Result<usize>;

    //
    // Calendars
    //

    async fn upsert_calendars(&self, account_id: &str, calendars: &[RemoteCalendar]) -> Result<()>;
    async fn get_calendars(&self, account_id: &str) -> Result<Vec<Calendar>>;
    async fn update_calendar_cursor(&self, calendar_id: CalendarId, cursor: Option<&str>) -> Result<()>;
    /// Returns `true` when the item was new.
    async fn upsert_calendar_item(&self, account_id: &str, item: &CalendarItem) -> Result<bool>;
    /// Deleting a series master also removes its occurrences and exceptions.
    async fn delete_calendar_item(&self, account_id: &str, item_id: &str) -> Result<()>;
    async fn get_calendar_item(&self, account_id: &str, item_id: &str) -> Result<Option<CalendarItem>>;
    async fn set_calendar_response(&self, account_id: &str, item_id: &str, response: ResponseStatus) -> Result<()>;

    //
    // Retry queue
    //

    async fn enqueue_retry(&self, account_id: &str, remote_id: &str, now: i64) -> Result<()>;
    async fn get_retry_queue(&self, account_id: &str) -> Result<Vec<RetryQueueEntry>>;
    async fn increment_retry_failure(&self, entry_id: i64) -> Result<()>;
    async fn remove_retry(&self, entry_id: i64) -> Result<()>;
    /// Drop expired entries across all accounts. Returns how many were removed.
    async fn sweep_retry_queue(&self, now: i64) -> Result<usize>;
}
