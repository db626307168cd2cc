//! Calendar containers, events and attendees.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::model::{
    Attendee, Calendar, CalendarId, CalendarItem, CalendarItemKind, RemoteCalendar, ResponseStatus,
};

fn row_to_calendar(row: &SqliteRow) -> Calendar {
    Calendar {
        id: row.get("id"),
        account_id: row.get("account_id"),
        remote_id: row.get("remote_id"),
        name: row.get("name"),
        is_primary: row.get("is_primary"),
        cursor: row.get("cursor"),
    }
}

fn row_to_item(row: &SqliteRow) -> CalendarItem {
    CalendarItem {
        id: row.get("id"),
        calendar_remote_id: row.get("calendar_remote_id"),
        title: row.get("title"),
        start: row.get("start_ts"),
        end: row.get("end_ts"),
        all_day: row.get("all_day"),
        location: row.get("location"),
        recurrence_rule: row.get("recurrence_rule"),
        organizer: row.get("organizer"),
        recurring_parent_id: row.get("recurring_parent_id"),
        kind: CalendarItemKind::parse(&row.get::<String, _>("kind")),
        response: ResponseStatus::parse(&row.get::<String, _>("response")),
        attendees: Vec::new(),
    }
}

pub async fn upsert_calendars(
    conn: &mut SqliteConnection,
    account_id: &str,
    calendars: &[RemoteCalendar],
) -> Result<()> {
    for calendar in calendars {
        sqlx::query(
            r#"
            INSERT INTO calendars (account_id, remote_id, name, is_primary) VALUES (?, ?, ?, ?)
            ON CONFLICT(account_id, remote_id) DO UPDATE SET name = excluded.name, is_primary = excluded.is_primary
            "#,
        )
        .bind(account_id)
        .bind(&calendar.remote_id)
        .bind(&calendar.name)
        .bind(calendar.is_primary)
        .execute(&mut *conn)
        .await?;
    }

    // Calendars gone from the listing take their events with them
    let existing = get_calendars(conn, account_id).await?;
    for stale in existing
        .iter()
        .filter(|c| !calendars.iter().any(|r| r.remote_id == c.remote_id))
    {
        sqlx::query("DELETE FROM calendar_items WHERE account_id = ? AND calendar_remote_id = ?")
            .bind(account_id)
            .bind(&stale.remote_id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM calendars WHERE id = ?")
            .bind(stale.id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

pub async fn get_calendars(conn: &mut SqliteConnection, account_id: &str) -> Result<Vec<Calendar>> {
    let rows = sqlx::query("SELECT * FROM calendars WHERE account_id = ? ORDER BY id")
        .bind(account_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.iter().map(row_to_calendar).collect())
}

pub async fn update_cursor(conn: &mut SqliteConnection, calendar_id: CalendarId, cursor: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE calendars SET cursor = ? WHERE id = ?")
        .bind(cursor)
        .bind(calendar_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn reset_cursors(conn: &mut SqliteConnection, account_id: &str) -> Result<()> {
    sqlx::query("UPDATE calendars SET cursor = NULL WHERE account_id = ?")
        .bind(account_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn upsert_item(conn: &mut SqliteConnection, account_id: &str, item: &CalendarItem) -> Result<bool> {
    let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM calendar_items WHERE account_id = ? AND id = ?")
        .bind(account_id)
        .bind(&item.id)
        .fetch_one(&mut *conn)
        .await?
        > 0;

    sqlx::query(
        r#"
        INSERT INTO calendar_items
        (account_id, id, calendar_remote_id, title, start_ts, end_ts, all_day, location,
         recurrence_rule, organizer, recurring_parent_id, kind, response)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(account_id, id) DO UPDATE SET
            calendar_remote_id = excluded.calendar_remote_id,
            title = excluded.title,
            start_ts = excluded.start_ts,
            end_ts = excluded.end_ts,
            all_day = excluded.all_day,
            location = excluded.location,
            recurrence_rule = excluded.recurrence_rule,
            organizer = excluded.organizer,
            recurring_parent_id = excluded.recurring_parent_id,
            kind = excluded.kind,
            response = excluded.response
        "#,
    )
    .bind(account_id)
    .bind(&item.id)
    .bind(&item.calendar_remote_id)
    .bind(&item.title)
    .bind(item.start)
    .bind(item.end)
    .bind(item.all_day)
    .bind(&item.location)
    .bind(&item.recurrence_rule)
    .bind(&item.organizer)
    .bind(&item.recurring_parent_id)
    .bind(item.kind.as_str())
    .bind(item.response.as_str())
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM calendar_attendees WHERE account_id = ? AND item_id = ?")
        .bind(account_id)
        .bind(&item.id)
        .execute(&mut *conn)
        .await?;
    for attendee in &item.attendees {
        sqlx::query(
            "INSERT OR REPLACE INTO calendar_attendees (account_id, item_id, address, name, response) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(account_id)
        .bind(&item.id)
        .bind(&attendee.address)
        .bind(&attendee.name)
        .bind(attendee.response.as_str())
        .execute(&mut *conn)
        .await?;
    }

    Ok(!exists)
}

pub async fn delete_item(conn: &mut SqliteConnection, account_id: &str, item_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM calendar_items WHERE account_id = ? AND (id = ? OR recurring_parent_id = ?)")
        .bind(account_id)
        .bind(item_id)
        .bind(item_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn get_item(conn: &mut SqliteConnection, account_id: &str, item_id: &str) -> Result<Option<CalendarItem>> {
    let Some(row) = sqlx::query("SELECT * FROM calendar_items WHERE account_id = ? AND id = ?")
        .bind(account_id)
        .bind(item_id)
        .fetch_optional(&mut *conn)
        .await?
    else {
        return Ok(None);
    };

    let mut item = row_to_item(&row);
    let attendees = sqlx::query(
        "SELECT address, name, response FROM calendar_attendees WHERE account_id = ? AND item_id = ? ORDER BY address",
    )
    .bind(account_id)
    .bind(item_id)
    .fetch_all(&mut *conn)
    .await?;
    item.attendees = attendees
        .iter()
        .map(|row| Attendee {
            address: row.get("address"),
            name: row.get("name"),
            response: ResponseStatus::parse(&row.get::<String, _>("response")),
        })
        .collect();
    Ok(Some(item))
}

pub async fn set_response(
    conn: &mut SqliteConnection,
    account_id: &str,
    item_id: &str,
    response: ResponseStatus,
) -> Result<()> {
    sqlx::query("UPDATE calendar_items SET response = ? WHERE account_id = ? AND id = ?")
        .bind(response.as_str())
        .bind(account_id)
        .bind(item_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn clear_items(conn: &mut SqliteConnection, account_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM calendar_items WHERE account_id = ?")
        .bind(account_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
