//! batch_tickets queries.
//!
//! The counter invariant `pending + success + failed = child_count` is
//! maintained by doing every counter move in one UPDATE; the derived
//! status is recomputed in the same statement.

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgExecutor, Row};
use uuid::Uuid;

use shepherd_definitions::batch::{BatchStatus, BatchTicket};

use crate::Result;

const COLUMNS: &str = "id, batch_type, requester, child_count, pending_count, success_count, \
     failed_count, status, idempotency_key, created_at, updated_at";

fn map_batch(row: &PgRow) -> Result<BatchTicket> {
    let status: String = row.try_get("status")?;
    Ok(BatchTicket {
        id: row.try_get("id")?,
        batch_type: row.try_get("batch_type")?,
        requester: row.try_get("requester")?,
        child_count: row.try_get("child_count")?,
        pending_count: row.try_get("pending_count")?,
        success_count: row.try_get("success_count")?,
        failed_count: row.try_get("failed_count")?,
        status: status.parse::<BatchStatus>()?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn insert(conn: &mut PgConnection, b: &BatchTicket) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO batch_tickets
           (id, batch_type, requester, child_count, pending_count, success_count, failed_count,
            status, idempotency_key, created_at, updated_at)
           VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)"#,
    )
    .bind(b.id)
    .bind(&b.batch_type)
    .bind(b.requester)
    .bind(b.child_count)
    .bind(b.pending_count)
    .bind(b.success_count)
    .bind(b.failed_count)
    .bind(b.status.as_str())
    .bind(&b.idempotency_key)
    .bind(b.created_at)
    .bind(b.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> Result<Option<BatchTicket>> {
    let row = sqlx::query(&format!("SELECT {} FROM batch_tickets WHERE id = $1", COLUMNS))
        .bind(id)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(map_batch).transpose()
}

pub async fn find_by_idempotency_key<'e, E: PgExecutor<'e>>(
    ex: E,
    requester: Uuid,
    key: &str,
) -> Result<Option<BatchTicket>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM batch_tickets WHERE requester = $1 AND idempotency_key = $2",
        COLUMNS
    ))
    .bind(requester)
    .bind(key)
    .fetch_optional(ex)
    .await?;
    row.as_ref().map(map_batch).transpose()
}

/// Record one child reaching a terminal state. Both counters and the
/// derived status move in a single statement so no interleaving can
/// observe the invariant broken.
pub async fn child_finished(
    conn: &mut PgConnection,
    batch_id: Uuid,
    success: bool,
) -> Result<Option<BatchTicket>> {
    let row = sqlx::query(&format!(
        r#"UPDATE batch_tickets
           SET pending_count = pending_count - 1,
               success_count = success_count + CASE WHEN $2 THEN 1 ELSE 0 END,
               failed_count  = failed_count  + CASE WHEN $2 THEN 0 ELSE 1 END,
               status = CASE
                   WHEN pending_count - 1 > 0 THEN 'IN_PROGRESS'
                   WHEN failed_count + CASE WHEN $2 THEN 0 ELSE 1 END = 0 THEN 'COMPLETED'
                   WHEN success_count + CASE WHEN $2 THEN 1 ELSE 0 END = 0 THEN 'FAILED'
                   ELSE 'PARTIAL_SUCCESS'
               END,
               updated_at = now()
           WHERE id = $1 AND pending_count > 0
           RETURNING {}"#,
        COLUMNS
    ))
    .bind(batch_id)
    .bind(success)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(map_batch).transpose()
}

/// Retry bookkeeping: replacement children re-enter the pending pool.
pub async fn reopen_children(
    conn: &mut PgConnection,
    batch_id: Uuid,
    reopened: i32,
) -> Result<()> {
    sqlx::query(
        r#"UPDATE batch_tickets
           SET pending_count = pending_count + $2,
               failed_count = failed_count - $2,
               status = 'IN_PROGRESS',
               updated_at = now()
           WHERE id = $1 AND failed_count >= $2"#,
    )
    .bind(batch_id)
    .bind(reopened)
    .execute(conn)
    .await?;
    Ok(())
}

/// Explicit whole-batch cancel marker once every child has settled.
pub async fn mark_cancelled(conn: &mut PgConnection, batch_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"UPDATE batch_tickets SET status = 'CANCELLED', updated_at = now() WHERE id = $1"#,
    )
    .bind(batch_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Parents still holding pending children, globally and per user; feeds
/// the pending-batch gauges.
pub async fn count_in_progress<'e, E: PgExecutor<'e>>(ex: E, user: Option<Uuid>) -> Result<i64> {
    let n: i64 = match user {
        Some(u) => {
            sqlx::query_scalar(
                "SELECT count(*) FROM batch_tickets WHERE status = 'IN_PROGRESS' AND requester = $1",
            )
            .bind(u)
            .fetch_one(ex)
            .await?
        }
        None => {
            sqlx::query_scalar("SELECT count(*) FROM batch_tickets WHERE status = 'IN_PROGRESS'")
                .fetch_one(ex)
                .await?
        }
    };
    Ok(n)
}
