//! Mail rows and folder assignments.

use std::collections::HashSet;

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::model::{FolderId, MailCopy, MailItem, MailState, SpecialFolder};

fn row_to_mail(row: &SqliteRow) -> MailItem {
    let references_str: Option<String> = row.get("references_list");
    let references = references_str
        .map(|s| s.split_whitespace().map(|s| s.to_string()).collect())
        .unwrap_or_default();
    MailItem {
        id: row.get("id"),
        remote_id: row.get("remote_id"),
        uid: row.get::<Option<i64>, _>("uid").map(|v| v as u32),
        thread_id: row.get("thread_id"),
        message_id: row.get("message_id"),
        in_reply_to: row.get("in_reply_to"),
        references,
        subject: row.get("subject"),
        from_address: row.get("from_address"),
        from_name: row.get("from_name"),
        date: row.get("date"),
        preview: row.get("preview"),
        is_read: row.get("is_read"),
        is_flagged: row.get("is_flagged"),
        is_draft: row.get("is_draft"),
        mime_ref: row.get("mime_ref"),
    }
}

/// Insert a mail row. With `replace` an existing row is overwritten,
/// otherwise the insert is ignored. Returns whether a row was written.
async fn write_mail_row(
    conn: &mut SqliteConnection,
    account_id: &str,
    item: &MailItem,
    replace: bool,
) -> Result<bool> {
    let references_str = if item.references.is_empty() {
        None
    } else {
        Some(item.references.join(" "))
    };
    let verb = if replace { "INSERT OR REPLACE" } else { "INSERT OR IGNORE" };
    let result = sqlx::query(&format!(
        r#"
        {} INTO mail
        (account_id, id, remote_id, uid, thread_id, message_id, in_reply_to, references_list,
         subject, from_address, from_name, date, preview, is_read, is_flagged, is_draft, mime_ref)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        verb
    ))
    .bind(account_id)
    .bind(&item.id)
    .bind(&item.remote_id)
    .bind(item.uid.map(|v| v as i64))
    .bind(&item.thread_id)
    .bind(&item.message_id)
    .bind(&item.in_reply_to)
    .bind(references_str)
    .bind(&item.subject)
    .bind(&item.from_address)
    .bind(&item.from_name)
    .bind(item.date)
    .bind(&item.preview)
    .bind(item.is_read)
    .bind(item.is_flagged)
    .bind(item.is_draft)
    .bind(&item.mime_ref)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Insert-or-ignore plus assignment creation. Existing rows get their mutable
/// state refreshed. Returns `true` when a new row was created.
pub async fn upsert_mail(
    conn: &mut SqliteConnection,
    account_id: &str,
    item: &MailItem,
    folder_ids: &[FolderId],
) -> Result<bool> {
    let created = write_mail_row(conn, account_id, item, false).await?;

    if !created {
        sqlx::query(
            r#"
            UPDATE mail
            SET is_read = ?, is_flagged = ?, is_draft = ?, thread_id = COALESCE(?, thread_id)
            WHERE account_id = ? AND id = ?
            "#,
        )
        .bind(item.is_read)
        .bind(item.is_flagged)
        .bind(item.is_draft)
        .bind(&item.thread_id)
        .bind(account_id)
        .bind(&item.id)
        .execute(&mut *conn)
        .await?;
    }

    for folder_id in folder_ids {
        create_assignment(conn, account_id, &item.id, *folder_id).await?;
    }

    Ok(created)
}

pub async fn get_mail(conn: &mut SqliteConnection, account_id: &str, mail_id: &str) -> Result<Option<MailItem>> {
    let row = sqlx::query("SELECT * FROM mail WHERE account_id = ? AND id = ?")
        .bind(account_id)
        .bind(mail_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.as_ref().map(row_to_mail))
}

pub async fn delete_mail(conn: &mut SqliteConnection, account_id: &str, mail_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM mail WHERE account_id = ? AND id = ?")
        .bind(account_id)
        .bind(mail_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn assigned_folder_ids(
    conn: &mut SqliteConnection,
    account_id: &str,
    mail_id: &str,
) -> Result<Vec<FolderId>> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT folder_id FROM mail_assignments WHERE account_id = ? AND mail_id = ? ORDER BY folder_id",
    )
    .bind(account_id)
    .bind(mail_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

pub async fn create_assignment(
    conn: &mut SqliteConnection,
    account_id: &str,
    mail_id: &str,
    folder_id: FolderId,
) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO mail_assignments (account_id, mail_id, folder_id) VALUES (?, ?, ?)")
        .bind(account_id)
        .bind(mail_id)
        .bind(folder_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Remove one assignment and the mail itself if that was its last folder.
pub async fn delete_assignment(
    conn: &mut SqliteConnection,
    account_id: &str,
    mail_id: &str,
    folder_id: FolderId,
) -> Result<()> {
    sqlx::query("DELETE FROM mail_assignments WHERE account_id = ? AND mail_id = ? AND folder_id = ?")
        .bind(account_id)
        .bind(mail_id)
        .bind(folder_id)
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        DELETE FROM mail WHERE account_id = ? AND id = ?
        AND NOT EXISTS (SELECT 1 FROM mail_assignments a WHERE a.account_id = mail.account_id AND a.mail_id = mail.id)
        "#,
    )
    .bind(account_id)
    .bind(mail_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn set_mail_folders(
    conn: &mut SqliteConnection,
    account_id: &str,
    mail_id: &str,
    folder_ids: &[FolderId],
) -> Result<()> {
    sqlx::query("DELETE FROM mail_assignments WHERE account_id = ? AND mail_id = ?")
        .bind(account_id)
        .bind(mail_id)
        .execute(&mut *conn)
        .await?;
    for folder_id in folder_ids {
        // Folders deleted in the meantime are skipped
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO mail_assignments (account_id, mail_id, folder_id)
            SELECT ?, ?, id FROM folders WHERE id = ?
            "#,
        )
        .bind(account_id)
        .bind(mail_id)
        .bind(folder_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn delete_orphaned_mail(conn: &mut SqliteConnection, account_id: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM mail WHERE account_id = ?
        AND NOT EXISTS (SELECT 1 FROM mail_assignments a WHERE a.account_id = mail.account_id AND a.mail_id = mail.id)
        "#,
    )
    .bind(account_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn set_read_status(conn: &mut SqliteConnection, account_id: &str, mail_id: &str, is_read: bool) -> Result<()> {
    sqlx::query("UPDATE mail SET is_read = ? WHERE account_id = ? AND id = ?")
        .bind(is_read)
        .bind(account_id)
        .bind(mail_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_flag_status(
    conn: &mut SqliteConnection,
    account_id: &str,
    mail_id: &str,
    is_flagged: bool,
) -> Result<()> {
    sqlx::query("UPDATE mail SET is_flagged = ? WHERE account_id = ? AND id = ?")
        .bind(is_flagged)
        .bind(account_id)
        .bind(mail_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn update_mail_state(
    conn: &mut SqliteConnection,
    account_id: &str,
    mail_id: &str,
    state: MailState,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE mail SET is_read = ?, is_flagged = ?
        WHERE account_id = ? AND id = ? AND (is_read != ? OR is_flagged != ?)
        "#,
    )
    .bind(state.is_read)
    .bind(state.is_flagged)
    .bind(account_id)
    .bind(mail_id)
    .bind(state.is_read)
    .bind(state.is_flagged)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_known_protocol_ids(conn: &mut SqliteConnection, folder_id: FolderId) -> Result<HashSet<u32>> {
    let uids = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT m.uid FROM mail m
        JOIN mail_assignments a ON a.account_id = m.account_id AND a.mail_id = m.id
        WHERE a.folder_id = ? AND m.uid IS NOT NULL
        "#,
    )
    .bind(folder_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(uids.into_iter().map(|uid| uid as u32).collect())
}

/// Delete mail in `folder_id` whose UID is listed.
pub async fn delete_protocol_uids(
    conn: &mut SqliteConnection,
    account_id: &str,
    folder_id: FolderId,
    uids: &[u32],
) -> Result<usize> {
    let mut deleted = 0;
    for uid in uids {
        let result = sqlx::query(
            r#"
            DELETE FROM mail WHERE account_id = ? AND uid = ?
            AND id IN (SELECT mail_id FROM mail_assignments WHERE account_id = ? AND folder_id = ?)
            "#,
        )
        .bind(account_id)
        .bind(*uid as i64)
        .bind(account_id)
        .bind(folder_id)
        .execute(&mut *conn)
        .await?;
        deleted += result.rows_affected() as usize;
    }
    Ok(deleted)
}

pub async fn clear_folder_mail(conn: &mut SqliteConnection, account_id: &str, folder_id: FolderId) -> Result<usize> {
    let result = sqlx::query(
        r#"
        DELETE FROM mail WHERE account_id = ?
        AND id IN (SELECT mail_id FROM mail_assignments WHERE account_id = ? AND folder_id = ?)
        "#,
    )
    .bind(account_id)
    .bind(account_id)
    .bind(folder_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() as usize)
}

pub async fn get_unread_in_folder(
    conn: &mut SqliteConnection,
    account_id: &str,
    folder_id: FolderId,
) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        r#"
        SELECT m.id FROM mail m
        JOIN mail_assignments a ON a.account_id = m.account_id AND a.mail_id = m.id
        WHERE m.account_id = ? AND a.folder_id = ? AND m.is_read = 0
        ORDER BY m.date DESC
        "#,
    )
    .bind(account_id)
    .bind(folder_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

pub async fn get_thread_items(
    conn: &mut SqliteConnection,
    account_id: &str,
    thread_id: &str,
    folder_ids: &[FolderId],
) -> Result<Vec<MailCopy>> {
    if folder_ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = folder_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let query = format!(
        r#"
        SELECT m.*, f.id AS folder_id, f.special AS folder_special FROM mail m
        JOIN mail_assignments a ON a.account_id = m.account_id AND a.mail_id = m.id
        JOIN folders f ON f.id = a.folder_id
        WHERE m.account_id = ? AND m.thread_id = ? AND a.folder_id IN ({})
        ORDER BY m.date ASC
        "#,
        placeholders
    );

    let mut q = sqlx::query(&query).bind(account_id).bind(thread_id);
    for folder_id in folder_ids {
        q = q.bind(folder_id);
    }

    let rows = q.fetch_all(&mut *conn).await?;
    Ok(rows
        .iter()
        .map(|row| MailCopy {
            item: row_to_mail(row),
            folder_id: row.get("folder_id"),
            folder_special: SpecialFolder::parse(&row.get::<String, _>("folder_special")),
        })
        .collect())
}

pub async fn find_thread_id_by_message_ids(
    conn: &mut SqliteConnection,
    account_id: &str,
    message_ids: &[String],
) -> Result<Option<String>> {
    if message_ids.is_empty() {
        return Ok(None);
    }

    let placeholders = message_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let query = format!(
        "SELECT thread_id FROM mail WHERE account_id = ? AND thread_id IS NOT NULL AND message_id IN ({}) LIMIT 1",
        placeholders
    );

    let mut q = sqlx::query_scalar::<_, String>(&query).bind(account_id);
    for id in message_ids {
        q = q.bind(id);
    }
    Ok(q.fetch_optional(&mut *conn).await?)
}

/// Overwrite the row with a previously captured copy and restore its assignments.
pub async fn restore_mail(
    conn: &mut SqliteConnection,
    account_id: &str,
    item: &MailItem,
    folder_ids: &[FolderId],
) -> Result<()> {
    write_mail_row(conn, account_id, item, true).await?;
    set_mail_folders(conn, account_id, &item.id, folder_ids).await
}

pub async fn mail_count(conn: &mut SqliteConnection, account_id: &str) -> Result<usize> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM mail WHERE account_id = ?")
        .bind(account_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count as usize)
}
