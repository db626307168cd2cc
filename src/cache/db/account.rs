//! Account rows.

use anyhow::Result;
use sqlx::{Row, SqliteConnection};

use crate::model::{Account, AccountProfile, ProviderKind};

pub async fn ensure_account(conn: &mut SqliteConnection, account: &Account) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO accounts (id, address, display_name, provider, history_cursor) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&account.id)
    .bind(&account.address)
    .bind(&account.display_name)
    .bind(account.provider.as_str())
    .bind(&account.history_cursor)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get_account(conn: &mut SqliteConnection, account_id: &str) -> Result<Option<Account>> {
    let row = sqlx::query("SELECT id, address, display_name, provider, history_cursor FROM accounts WHERE id = ?")
        .bind(account_id)
        .fetch_optional(&mut *conn)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let provider: String = row.get("provider");
    let Some(provider) = ProviderKind::parse(&provider) else {
        anyhow::bail!("account {} has unknown provider '{}'", account_id, provider);
    };

    Ok(Some(Account {
        id: row.get("id"),
        address: row.get("address"),
        display_name: row.get("display_name"),
        provider,
        history_cursor: row.get("history_cursor"),
    }))
}

pub async fn update_profile(conn: &mut SqliteConnection, account_id: &str, profile: &AccountProfile) -> Result<()> {
    sqlx::query("UPDATE accounts SET address = ?, display_name = ? WHERE id = ?")
        .bind(&profile.address)
        .bind(&profile.display_name)
        .bind(account_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn update_cursor(conn: &mut SqliteConnection, account_id: &str, cursor: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE accounts SET history_cursor = ? WHERE id = ?")
        .bind(cursor)
        .bind(account_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Cascades to folders, mail, calendars and retry entries.
pub async fn delete_account(conn: &mut SqliteConnection, account_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM accounts WHERE id = ?")
        .bind(account_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
