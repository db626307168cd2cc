//! Durable queue of remote ids whose download failed.

use anyhow::Result;
use sqlx::{Row, SqliteConnection};

use crate::constants::{RETRY_QUEUE_MAX_AGE_SECS, RETRY_QUEUE_MAX_FAILURES};
use crate::model::RetryQueueEntry;

pub async fn enqueue(conn: &mut SqliteConnection, account_id: &str, remote_id: &str, now: i64) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO retry_queue (account_id, remote_id, failed_count, created_at) VALUES (?, ?, 0, ?)")
        .bind(account_id)
        .bind(remote_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn get_entries(conn: &mut SqliteConnection, account_id: &str) -> Result<Vec<RetryQueueEntry>> {
    let rows = sqlx::query(
        "SELECT id, account_id, remote_id, failed_count, created_at FROM retry_queue WHERE account_id = ? ORDER BY id",
    )
    .bind(account_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .iter()
        .map(|row| RetryQueueEntry {
            id: row.get("id"),
            account_id: row.get("account_id"),
            remote_id: row.get("remote_id"),
            failed_count: row.get::<i64, _>("failed_count") as u32,
            created_at: row.get("created_at"),
        })
        .collect())
}

pub async fn increment_failure(conn: &mut SqliteConnection, entry_id: i64) -> Result<()> {
    sqlx::query("UPDATE retry_queue SET failed_count = failed_count + 1 WHERE id = ?")
        .bind(entry_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn remove(conn: &mut SqliteConnection, entry_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM retry_queue WHERE id = ?")
        .bind(entry_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Same bounds as [`RetryQueueEntry::is_expired`].
pub async fn sweep(conn: &mut SqliteConnection, now: i64) -> Result<usize> {
    let result = sqlx::query("DELETE FROM retry_queue WHERE failed_count >= ? OR ? - created_at > ?")
        .bind(RETRY_QUEUE_MAX_FAILURES as i64)
        .bind(now)
        .bind(RETRY_QUEUE_MAX_AGE_SECS)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() as usize)
}

pub async fn clear(conn: &mut SqliteConnection, account_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM retry_queue WHERE account_id = ?")
        .bind(account_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
