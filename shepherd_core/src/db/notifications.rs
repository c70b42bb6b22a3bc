//! notifications queries: the in-app inbox.

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgExecutor, Row};
use uuid::Uuid;

use shepherd_definitions::notification::{Notification, NotificationKind};

use crate::Result;

const COLUMNS: &str = "id, recipient, kind, title, body, metadata, read, created_at, read_at";

fn map_notification(row: &PgRow) -> Result<Notification> {
    let kind: String = row.try_get("kind")?;
    Ok(Notification {
        id: row.try_get("id")?,
        recipient: row.try_get("recipient")?,
        kind: kind.parse::<NotificationKind>()?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        metadata: row.try_get("metadata")?,
        read: row.try_get("read")?,
        created_at: row.try_get("created_at")?,
        read_at: row.try_get("read_at")?,
    })
}

pub async fn insert(conn: &mut PgConnection, n: &Notification) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO notifications
           (id, recipient, kind, title, body, metadata, read, created_at)
           VALUES ($1,$2,$3,$4,$5,$6,$7,$8)"#,
    )
    .bind(n.id)
    .bind(n.recipient)
    .bind(n.kind.as_str())
    .bind(&n.title)
    .bind(&n.body)
    .bind(&n.metadata)
    .bind(n.read)
    .bind(n.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn list_for<'e, E: PgExecutor<'e>>(
    ex: E,
    recipient: Uuid,
    unread_only: bool,
    limit: i64,
    offset: i64,
) -> Result<Vec<Notification>> {
    let rows = sqlx::query(&format!(
        r#"SELECT {} FROM notifications
           WHERE recipient = $1 AND ($2 = false OR read = false)
           ORDER BY created_at DESC LIMIT $3 OFFSET $4"#,
        COLUMNS
    ))
    .bind(recipient)
    .bind(unread_only)
    .bind(limit)
    .bind(offset)
    .fetch_all(ex)
    .await?;
    rows.iter().map(map_notification).collect()
}

pub async fn unread_count<'e, E: PgExecutor<'e>>(ex: E, recipient: Uuid) -> Result<i64> {
    let n = sqlx::query_scalar(
        "SELECT count(*) FROM notifications WHERE recipient = $1 AND read = false",
    )
    .bind(recipient)
    .fetch_one(ex)
    .await?;
    Ok(n)
}

/// Recipient-scoped: a user can only mark their own rows.
pub async fn mark_read(conn: &mut PgConnection, recipient: Uuid, id: Uuid) -> Result<bool> {
    let res = sqlx::query(
        r#"UPDATE notifications SET read = true, read_at = now()
           WHERE id = $1 AND recipient = $2 AND read = false"#,
    )
    .bind(id)
    .bind(recipient)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn mark_all_read(conn: &mut PgConnection, recipient: Uuid) -> Result<u64> {
    let res = sqlx::query(
        r#"UPDATE notifications SET read = true, read_at = now()
           WHERE recipient = $1 AND read = false"#,
    )
    .bind(recipient)
    .execute(conn)
    .await?;
    Ok(res.rows_affected())
}
