//! SQLite implementation of the change processor.
//!
//! This module is split into:
//! - `mod.rs` - Cache struct, connection pool, transaction boundaries
//! - `schema.rs` - Database schema initialization
//! - `account.rs` - Account rows and cursors
//! - `folder.rs` - Folder rows and tree reconciliation
//! - `mail.rs` - Mail rows and folder assignments
//! - `calendar.rs` - Calendars, events and attendees
//! - `retry_queue.rs` - Failed-download retry queue

mod account;
mod calendar;
mod folder;
mod mail;
mod retry_queue;
mod schema;

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};

use super::ChangeProcessor;
use crate::model::{
    Account, AccountProfile, Calendar, CalendarId, CalendarItem, Folder, FolderDiff, FolderId,
    MailCopy, MailItem, MailSnapshot, MailState, NewMailPackage, RemoteCalendar, RemoteFolder,
    ResponseStatus, RetryQueueEntry, SpecialFolder,
};

/// Connection pool size - allows concurrent reads and writes.
/// Each account actor holds at most one connection per operation.
const POOL_SIZE: u32 = 16;

/// Moka cache settings for remote id -> folder id lookups.
const FOLDER_ID_CACHE_MAX_CAPACITY: u64 = 4096;
const FOLDER_ID_CACHE_TTL_SECS: u64 = 3600;

/// Key: (account_id, folder remote id)
type FolderIdCache = moka::future::Cache<(String, String), FolderId>;

pub struct Cache {
    pool: SqlitePool,
    /// Hot lookup for folder remote ids, hit on every mail upsert.
    folder_ids: FolderIdCache,
}

impl Cache {
    fn create_folder_id_cache() -> FolderIdCache {
        moka::future::Cache::builder()
            .max_capacity(FOLDER_ID_CACHE_MAX_CAPACITY)
            .time_to_live(Duration::from_secs(FOLDER_ID_CACHE_TTL_SECS))
            .support_invalidation_closures()
            .build()
    }

    pub async fn open(path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await
            .context("Failed to create connection pool")?;

        schema::init_schema(&pool).await?;

        Ok(Self {
            pool,
            folder_ids: Self::create_folder_id_cache(),
        })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        // The database lives only as long as its single connection. Tests may
        // pause the clock, so nothing here may time out or be reaped.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .test_before_acquire(false)
            .acquire_timeout(Duration::from_secs(24 * 60 * 60))
            .connect_with(options)
            .await
            .context("Failed to create in-memory connection pool")?;

        schema::init_schema(&pool).await?;

        Ok(Self {
            pool,
            folder_ids: Self::create_folder_id_cache(),
        })
    }

    /// Resolve a folder remote id, checking the moka cache first.
    async fn resolve_folder_id(
        &self,
        conn: &mut SqliteConnection,
        account_id: &str,
        remote_id: &str,
    ) -> Result<Option<FolderId>> {
        let key = (account_id.to_string(), remote_id.to_string());
        if let Some(id) = self.folder_ids.get(&key).await {
            return Ok(Some(id));
        }
        let id = folder::folder_id_for_remote(conn, account_id, remote_id).await?;
        if let Some(id) = id {
            self.folder_ids.insert(key, id).await;
        }
        Ok(id)
    }

    fn invalidate_account_folders(&self, account_id: &str) {
        let account_id = account_id.to_string();
        if let Err(e) = self
            .folder_ids
            .invalidate_entries_if(move |key, _| key.0 == account_id)
        {
            tracing::warn!("Failed to invalidate folder id cache: {}", e);
        }
    }
}

#[async_trait]
impl ChangeProcessor for Cache {
    //
    // Account Operations
    //

    async fn ensure_account(&self, account: &Account) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        account::ensure_account(&mut conn, account).await
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        let mut conn = self.pool.acquire().await?;
        account::get_account(&mut conn, account_id).await
    }

    async fn update_account_profile(&self, account_id: &str, profile: &AccountProfile) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        account::update_profile(&mut conn, account_id, profile).await
    }

    async fn update_account_cursor(&self, account_id: &str, cursor: Option<&str>) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        account::update_cursor(&mut conn, account_id, cursor).await
    }

    async fn delete_account(&self, account_id: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        account::delete_account(&mut conn, account_id).await?;
        self.invalidate_account_folders(account_id);
        tracing::info!("Deleted account {} and all cached data", account_id);
        Ok(())
    }

    async fn wipe_account_cache(&self, account_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM mail WHERE account_id = ?")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        calendar::clear_items(&mut tx, account_id).await?;
        retry_queue::clear(&mut tx, account_id).await?;
        tx.commit().await?;
        tracing::info!("Wiped cached mail and calendar items for {}", account_id);
        Ok(())
    }

    async fn reset_cursors(&self, account_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        account::update_cursor(&mut tx, account_id, None).await?;
        folder::reset_cursors(&mut tx, account_id).await?;
        calendar::reset_cursors(&mut tx, account_id).await?;
        tx.commit().await?;
        Ok(())
    }

    //
    // Folder Operations (delegated to folder module)
    //

    async fn upsert_folders(&self, account_id: &str, folders: &[RemoteFolder]) -> Result<FolderDiff> {
        let mut tx = self.pool.begin().await?;
        let local = folder::get_folders(&mut tx, account_id).await?;
        let diff = FolderDiff::compute(&local, folders);
        if !diff.is_empty() {
            folder::apply_diff(&mut tx, account_id, &diff).await?;
        }
        tx.commit().await?;

        for deleted in &diff.deleted {
            self.folder_ids
                .invalidate(&(account_id.to_string(), deleted.remote_id.clone()))
                .await;
        }

        tracing::debug!(
            "Folder diff for {}: {} inserted, {} updated, {} deleted",
            account_id,
            diff.inserted.len(),
            diff.updated.len(),
            diff.deleted.len()
        );
        Ok(diff)
    }

    async fn get_folders(&self, account_id: &str) -> Result<Vec<Folder>> {
        let mut conn = self.pool.acquire().await?;
        folder::get_folders(&mut conn, account_id).await
    }

    async fn get_folder(&self, folder_id: FolderId) -> Result<Option<Folder>> {
        let mut conn = self.pool.acquire().await?;
        folder::get_folder(&mut conn, folder_id).await
    }

    async fn get_folder_by_remote_id(&self, account_id: &str, remote_id: &str) -> Result<Option<Folder>> {
        let mut conn = self.pool.acquire().await?;
        folder::get_folder_by_remote_id(&mut conn, account_id, remote_id).await
    }

    async fn get_special_folder(&self, account_id: &str, special: SpecialFolder) -> Result<Option<Folder>> {
        let mut conn = self.pool.acquire().await?;
        folder::get_special_folder(&mut conn, account_id, special).await
    }

    async fn rename_folder(&self, folder_id: FolderId, name: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        folder::rename_folder(&mut conn, folder_id, name).await
    }

    async fn update_folder_cursor(&self, folder_id: FolderId, cursor: Option<&str>) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        folder::update_cursor(&mut conn, folder_id, cursor).await
    }

    async fn set_initial_sync_completed(&self, folder_id: FolderId, completed: bool) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        folder::set_initial_sync_completed(&mut conn, folder_id, completed).await
    }

    async fn update_folder_protocol_state(
        &self,
        folder_id: FolderId,
        uid_validity: u32,
        highest_mod_seq: Option<u64>,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        folder::update_protocol_state(&mut conn, folder_id, uid_validity, highest_mod_seq).await
    }

    //
    // Mail Operations (delegated to mail module)
    //

    async fn upsert_mail(&self, account_id: &str, package: &NewMailPackage) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let mut folder_ids = Vec::with_capacity(package.folder_remote_ids.len());
        for remote_id in &package.folder_remote_ids {
            match self.resolve_folder_id(&mut tx, account_id, remote_id).await? {
                Some(id) => folder_ids.push(id),
                None => tracing::debug!("Skipping unknown folder {} for mail {}", remote_id, package.item.id),
            }
        }

        if folder_ids.is_empty() {
            tracing::warn!(
                "Mail {} has no known folder assignment, not storing it",
                package.item.id
            );
            return Ok(false);
        }

        let created = mail::upsert_mail(&mut tx, account_id, &package.item, &folder_ids).await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn delete_mail(&self, account_id: &str, mail_id: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        mail::delete_mail(&mut conn, account_id, mail_id).await
    }

    async fn get_mail(&self, account_id: &str, mail_id: &str) -> Result<Option<MailItem>> {
        let mut conn = self.pool.acquire().await?;
        mail::get_mail(&mut conn, account_id, mail_id).await
    }

    async fn get_assignments(&self, account_id: &str, mail_id: &str) -> Result<Vec<Folder>> {
        let mut conn = self.pool.acquire().await?;
        let ids = mail::assigned_folder_ids(&mut conn, account_id, mail_id).await?;
        let mut folders = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(f) = folder::get_folder(&mut conn, id).await? {
                folders.push(f);
            }
        }
        Ok(folders)
    }

    async fn create_assignment(&self, account_id: &str, mail_id: &str, folder_remote_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if let Some(folder_id) = self.resolve_folder_id(&mut tx, account_id, folder_remote_id).await? {
            mail::create_assignment(&mut tx, account_id, mail_id, folder_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_assignment(&self, account_id: &str, mail_id: &str, folder_remote_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if let Some(folder_id) = self.resolve_folder_id(&mut tx, account_id, folder_remote_id).await? {
            mail::delete_assignment(&mut tx, account_id, mail_id, folder_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_mail_folders(&self, account_id: &str, mail_id: &str, folder_ids: &[FolderId]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        mail::set_mail_folders(&mut tx, account_id, mail_id, folder_ids).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_read_status(&self, account_id: &str, mail_id: &str, is_read: bool) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        mail::set_read_status(&mut conn, account_id, mail_id, is_read).await
    }

    async fn set_flag_status(&self, account_id: &str, mail_id: &str, is_flagged: bool) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        mail::set_flag_status(&mut conn, account_id, mail_id, is_flagged).await
    }

    async fn update_mail_state(&self, account_id: &str, mail_id: &str, state: MailState) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        mail::update_mail_state(&mut conn, account_id, mail_id, state).await
    }

    async fn get_known_protocol_ids(&self, folder_id: FolderId) -> Result<HashSet<u32>> {
        let mut conn = self.pool.acquire().await?;
        mail::get_known_protocol_ids(&mut conn, folder_id).await
    }

    async fn delete_protocol_uids(&self, account_id: &str, folder_id: FolderId, uids: &[u32]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let deleted = mail::delete_protocol_uids(&mut tx, account_id, folder_id, uids).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn clear_folder_mail(&self, account_id: &str, folder_id: FolderId) -> Result<usize> {
        let mut conn = self.pool.acquire().await?;
        mail::clear_folder_mail(&mut conn, account_id, folder_id).await
    }

    async fn get_unread_in_folder(&self, account_id: &str, folder_id: FolderId) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        mail::get_unread_in_folder(&mut conn, account_id, folder_id).await
    }

    async fn get_thread_items(
        &self,
        account_id: &str,
        thread_id: &str,
        folder_ids: &[FolderId],
    ) -> Result<Vec<MailCopy>> {
        let mut conn = self.pool.acquire().await?;
        mail::get_thread_items(&mut conn, account_id, thread_id, folder_ids).await
    }

    async fn find_thread_id_by_message_ids(&self, account_id: &str, message_ids: &[String]) -> Result<Option<String>> {
        let mut conn = self.pool.acquire().await?;
        mail::find_thread_id_by_message_ids(&mut conn, account_id, message_ids).await
    }

    async fn snapshot_mail(&self, account_id: &str, mail_id: &str) -> Result<Option<MailSnapshot>> {
        let mut conn = self.pool.acquire().await?;
        let Some(item) = mail::get_mail(&mut conn, account_id, mail_id).await? else {
            return Ok(None);
        };
        let folder_ids = mail::assigned_folder_ids(&mut conn, account_id, mail_id).await?;
        Ok(Some(MailSnapshot { item, folder_ids }))
    }

    async fn restore_mail(&self, account_id: &str, snapshot: &MailSnapshot) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        mail::restore_mail(&mut tx, account_id, &snapshot.item, &snapshot.folder_ids).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mail_count(&self, account_id: &str) -> Result<usize> {
        let mut conn = self.pool.acquire().await?;
        mail::mail_count(&mut conn, account_id).await
    }

    //
    // Calendar Operations (delegated to calendar module)
    //

    async fn upsert_calendars(&self, account_id: &str, calendars: &[RemoteCalendar]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        calendar::upsert_calendars(&mut tx, account_id, calendars).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_calendars(&self, account_id: &str) -> Result<Vec<Calendar>> {
        let mut conn = self.pool.acquire().await?;
        calendar::get_calendars(&mut conn, account_id).await
    }

    async fn update_calendar_cursor(&self, calendar_id: CalendarId, cursor: Option<&str>) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        calendar::update_cursor(&mut conn, calendar_id, cursor).await
    }

    async fn upsert_calendar_item(&self, account_id: &str, item: &CalendarItem) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let created = calendar::upsert_item(&mut tx, account_id, item).await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn delete_calendar_item(&self, account_id: &str, item_id: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        calendar::delete_item(&mut conn, account_id, item_id).await
    }

    async fn get_calendar_item(&self, account_id: &str, item_id: &str) -> Result<Option<CalendarItem>> {
        let mut conn = self.pool.acquire().await?;
        calendar::get_item(&mut conn, account_id, item_id).await
    }

    async fn set_calendar_response(&self, account_id: &str, item_id: &str, response: ResponseStatus) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        calendar::set_response(&mut conn, account_id, item_id, response).await
    }

    //
    // Retry Queue Operations
    //

    async fn enqueue_retry(&self, account_id: &str, remote_id: &str, now: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        retry_queue::enqueue(&mut conn, account_id, remote_id, now).await
    }

    async fn get_retry_queue(&self, account_id: &str) -> Result<Vec<RetryQueueEntry>> {
        let mut conn = self.pool.acquire().await?;
        retry_queue::get_entries(&mut conn, account_id).await
    }

    async fn increment_retry_failure(&self, entry_id: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        retry_queue::increment_failure(&mut conn, entry_id).await
    }

    async fn remove_retry(&self, entry_id: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        retry_queue::remove(&mut conn, entry_id).await
    }

    async fn sweep_retry_queue(&self, now: i64) -> Result<usize> {
        let mut conn = self.pool.acquire().await?;
        let removed = retry_queue::sweep(&mut conn, now).await?;
        if removed > 0 {
            tracing::info!("Retry queue sweep dropped {} entries", removed);
        }
        Ok(removed)
    }
}
