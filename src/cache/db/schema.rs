//! Database schema initialization.

use anyhow::Result;
use sqlx::SqlitePool;

/// Initialize database schema with all tables and indexes.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            address TEXT NOT NULL,
            display_name TEXT,
            provider TEXT NOT NULL,
            history_cursor TEXT
        );

        CREATE TABLE IF NOT EXISTS folders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            remote_id TEXT NOT NULL,
            parent_remote_id TEXT,
            name TEXT NOT NULL,
            special TEXT NOT NULL DEFAULT 'other',
            cursor TEXT,
            uid_validity INTEGER,
            highest_mod_seq INTEGER,
            sync_enabled INTEGER NOT NULL DEFAULT 1,
            initial_sync_completed INTEGER NOT NULL DEFAULT 0,
            UNIQUE (account_id, remote_id)
        );

        CREATE INDEX IF NOT EXISTS idx_folders_account ON folders(account_id);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        -- Mail items (one row per local identity)
        CREATE TABLE IF NOT EXISTS mail (
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            id TEXT NOT NULL,
            remote_id TEXT NOT NULL,
            uid INTEGER,
            thread_id TEXT,
            message_id TEXT,
            in_reply_to TEXT,
            references_list TEXT,
            subject TEXT NOT NULL DEFAULT '',
            from_address TEXT NOT NULL DEFAULT '',
            from_name TEXT,
            date INTEGER NOT NULL DEFAULT 0,
            preview TEXT,
            is_read INTEGER NOT NULL DEFAULT 0,
            is_flagged INTEGER NOT NULL DEFAULT 0,
            is_draft INTEGER NOT NULL DEFAULT 0,
            mime_ref TEXT,
            PRIMARY KEY (account_id, id)
        );

        CREATE INDEX IF NOT EXISTS idx_mail_thread ON mail(account_id, thread_id);
        CREATE INDEX IF NOT EXISTS idx_mail_message_id ON mail(account_id, message_id);
        CREATE INDEX IF NOT EXISTS idx_mail_account_date ON mail(account_id, date DESC);

        -- Folder assignments (many-to-many for label providers, 1:1 otherwise)
        CREATE TABLE IF NOT EXISTS mail_assignments (
            account_id TEXT NOT NULL,
            mail_id TEXT NOT NULL,
            folder_id INTEGER NOT NULL REFERENCES folders(id) ON DELETE CASCADE,
            PRIMARY KEY (account_id, mail_id, folder_id),
            FOREIGN KEY (account_id, mail_id) REFERENCES mail(account_id, id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_assignments_folder ON mail_assignments(folder_id);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS calendars (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            remote_id TEXT NOT NULL,
            name TEXT NOT NULL,
            is_primary INTEGER NOT NULL DEFAULT 0,
            cursor TEXT,
            UNIQUE (account_id, remote_id)
        );

        CREATE TABLE IF NOT EXISTS calendar_items (
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            id TEXT NOT NULL,
            calendar_remote_id TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            start_ts INTEGER NOT NULL,
            end_ts INTEGER NOT NULL,
            all_day INTEGER NOT NULL DEFAULT 0,
            location TEXT,
            recurrence_rule TEXT,
            organizer TEXT,
            recurring_parent_id TEXT,
            kind TEXT NOT NULL DEFAULT 'single',
            response TEXT NOT NULL DEFAULT 'none',
            PRIMARY KEY (account_id, id)
        );

        CREATE INDEX IF NOT EXISTS idx_calendar_items_parent
            ON calendar_items(account_id, recurring_parent_id);

        CREATE TABLE IF NOT EXISTS calendar_attendees (
            account_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            address TEXT NOT NULL,
            name TEXT,
            response TEXT NOT NULL DEFAULT 'none',
            PRIMARY KEY (account_id, item_id, address),
            FOREIGN KEY (account_id, item_id) REFERENCES calendar_items(account_id, id) ON DELETE CASCADE
        );

        -- Remote ids awaiting download
        CREATE TABLE IF NOT EXISTS retry_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            remote_id TEXT NOT NULL,
            failed_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            UNIQUE (account_id, remote_id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
