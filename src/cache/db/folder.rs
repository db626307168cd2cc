//! Folder rows and folder-tree reconciliation.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::model::{Folder, FolderDiff, FolderId, SpecialFolder};

const FOLDER_COLUMNS: &str = "id, account_id, remote_id, parent_remote_id, name, special, cursor, \
     uid_validity, highest_mod_seq, sync_enabled, initial_sync_completed";

fn row_to_folder(row: &SqliteRow) -> Folder {
    Folder {
        id: row.get("id"),
        account_id: row.get("account_id"),
        remote_id: row.get("remote_id"),
        parent_remote_id: row.get("parent_remote_id"),
        name: row.get("name"),
        special: SpecialFolder::parse(&row.get::<String, _>("special")),
        cursor: row.get("cursor"),
        uid_validity: row.get::<Option<i64>, _>("uid_validity").map(|v| v as u32),
        highest_mod_seq: row.get::<Option<i64>, _>("highest_mod_seq").map(|v| v as u64),
        sync_enabled: row.get("sync_enabled"),
        initial_sync_completed: row.get("initial_sync_completed"),
    }
}

pub async fn get_folders(conn: &mut SqliteConnection, account_id: &str) -> Result<Vec<Folder>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM folders WHERE account_id = ? ORDER BY id",
        FOLDER_COLUMNS
    ))
    .bind(account_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.iter().map(row_to_folder).collect())
}

pub async fn get_folder(conn: &mut SqliteConnection, folder_id: FolderId) -> Result<Option<Folder>> {
    let row = sqlx::query(&format!("SELECT {} FROM folders WHERE id = ?", FOLDER_COLUMNS))
        .bind(folder_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.as_ref().map(row_to_folder))
}

pub async fn get_folder_by_remote_id(
    conn: &mut SqliteConnection,
    account_id: &str,
    remote_id: &str,
) -> Result<Option<Folder>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM folders WHERE account_id = ? AND remote_id = ?",
        FOLDER_COLUMNS
    ))
    .bind(account_id)
    .bind(remote_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(row_to_folder))
}

pub async fn get_special_folder(
    conn: &mut SqliteConnection,
    account_id: &str,
    special: SpecialFolder,
) -> Result<Option<Folder>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM folders WHERE account_id = ? AND special = ? ORDER BY id LIMIT 1",
        FOLDER_COLUMNS
    ))
    .bind(account_id)
    .bind(special.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(row_to_folder))
}

pub async fn folder_id_for_remote(
    conn: &mut SqliteConnection,
    account_id: &str,
    remote_id: &str,
) -> Result<Option<FolderId>> {
    let id = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM folders WHERE account_id = ? AND remote_id = ?",
    )
    .bind(account_id)
    .bind(remote_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(id)
}

/// Apply a computed diff. Deleted folders take their assignments with them
/// and mail left without any assignment is removed.
pub async fn apply_diff(conn: &mut SqliteConnection, account_id: &str, diff: &FolderDiff) -> Result<()> {
    for folder in &diff.inserted {
        sqlx::query(
            r#"
            INSERT INTO folders (account_id, remote_id, parent_remote_id, name, special, sync_enabled)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id, remote_id) DO UPDATE SET
                parent_remote_id = excluded.parent_remote_id,
                name = excluded.name,
                special = excluded.special
            "#,
        )
        .bind(account_id)
        .bind(&folder.remote_id)
        .bind(&folder.parent_remote_id)
        .bind(&folder.name)
        .bind(folder.special.as_str())
        .bind(folder.sync_enabled)
        .execute(&mut *conn)
        .await?;
    }

    for (id, folder) in &diff.updated {
        sqlx::query("UPDATE folders SET parent_remote_id = ?, name = ?, special = ? WHERE id = ?")
            .bind(&folder.parent_remote_id)
            .bind(&folder.name)
            .bind(folder.special.as_str())
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }

    if !diff.deleted.is_empty() {
        for folder in &diff.deleted {
            sqlx::query("DELETE FROM folders WHERE id = ?")
                .bind(folder.id)
                .execute(&mut *conn)
                .await?;
        }
        let orphans = super::mail::delete_orphaned_mail(conn, account_id).await?;
        if orphans > 0 {
            tracing::debug!(
                "Removed {} orphaned mail items after deleting {} folders",
                orphans,
                diff.deleted.len()
            );
        }
    }

    Ok(())
}

pub async fn rename_folder(conn: &mut SqliteConnection, folder_id: FolderId, name: &str) -> Result<()> {
    sqlx::query("UPDATE folders SET name = ? WHERE id = ?")
        .bind(name)
        .bind(folder_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn update_cursor(conn: &mut SqliteConnection, folder_id: FolderId, cursor: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE folders SET cursor = ? WHERE id = ?")
        .bind(cursor)
        .bind(folder_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_initial_sync_completed(
    conn: &mut SqliteConnection,
    folder_id: FolderId,
    completed: bool,
) -> Result<()> {
    sqlx::query("UPDATE folders SET initial_sync_completed = ? WHERE id = ?")
        .bind(completed)
        .bind(folder_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn update_protocol_state(
    conn: &mut SqliteConnection,
    folder_id: FolderId,
    uid_validity: u32,
    highest_mod_seq: Option<u64>,
) -> Result<()> {
    sqlx::query("UPDATE folders SET uid_validity = ?, highest_mod_seq = ? WHERE id = ?")
        .bind(uid_validity as i64)
        .bind(highest_mod_seq.map(|v| v as i64))
        .bind(folder_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Clear folder cursors, protocol state and initial-sync flags.
pub async fn reset_cursors(conn: &mut SqliteConnection, account_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE folders
        SET cursor = NULL, uid_validity = NULL, highest_mod_seq = NULL, initial_sync_completed = 0
        WHERE account_id = ?
        "#,
    )
    .bind(account_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
