//! domain_events queries. Payloads are written once and never updated.

use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgExecutor, Row};
use uuid::Uuid;

use shepherd_definitions::event::{DomainEvent, EventStatus};
use shepherd_definitions::ticket::OperationType;

use crate::Result;

const COLUMNS: &str =
    "id, ticket_id, kind, payload, status, attempts, last_error, archived_at, created_at, updated_at";

fn map_event(row: &PgRow) -> Result<DomainEvent> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(DomainEvent {
        id: row.try_get("id")?,
        ticket_id: row.try_get("ticket_id")?,
        kind: kind.parse::<OperationType>()?,
        payload: row.try_get("payload")?,
        status: status.parse::<EventStatus>()?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        archived_at: row.try_get("archived_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn insert(
    conn: &mut PgConnection,
    id: Uuid,
    ticket_id: Uuid,
    kind: OperationType,
    payload: &Value,
    status: EventStatus,
) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO domain_events (id, ticket_id, kind, payload, status, attempts, created_at, updated_at)
           VALUES ($1, $2, $3, $4, $5, 0, now(), now())"#,
    )
    .bind(id)
    .bind(ticket_id)
    .bind(kind.as_str())
    .bind(payload)
    .bind(status.as_str())
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> Result<Option<DomainEvent>> {
    let row = sqlx::query(&format!("SELECT {} FROM domain_events WHERE id = $1", COLUMNS))
        .bind(id)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(map_event).transpose()
}

pub async fn get_by_ticket<'e, E: PgExecutor<'e>>(
    ex: E,
    ticket_id: Uuid,
) -> Result<Vec<DomainEvent>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM domain_events WHERE ticket_id = $1 ORDER BY created_at",
        COLUMNS
    ))
    .bind(ticket_id)
    .fetch_all(ex)
    .await?;
    rows.iter().map(map_event).collect()
}

/// Worker pickup: PENDING → PROCESSING (or a redelivered PROCESSING),
/// bumping the attempt counter that the idempotency guard reads.
pub async fn mark_processing(conn: &mut PgConnection, id: Uuid) -> Result<bool> {
    let res = sqlx::query(
        r#"UPDATE domain_events
           SET status = 'PROCESSING', attempts = attempts + 1, updated_at = now()
           WHERE id = $1 AND status IN ('PENDING', 'PROCESSING')"#,
    )
    .bind(id)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn mark_terminal(
    conn: &mut PgConnection,
    id: Uuid,
    status: EventStatus,
    last_error: Option<&str>,
) -> Result<bool> {
    let res = sqlx::query(
        r#"UPDATE domain_events
           SET status = $2, last_error = $3, updated_at = now()
           WHERE id = $1 AND status IN ('PENDING', 'PROCESSING')"#,
    )
    .bind(id)
    .bind(status.as_str())
    .bind(last_error)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Record a failed attempt without leaving PROCESSING; the queue owns the
/// retry schedule, the event just remembers what went wrong.
pub async fn record_error(conn: &mut PgConnection, id: Uuid, error: &str) -> Result<()> {
    sqlx::query(
        r#"UPDATE domain_events SET last_error = $2, updated_at = now() WHERE id = $1"#,
    )
    .bind(id)
    .bind(error)
    .execute(conn)
    .await?;
    Ok(())
}

/// Cancel all open events of a ticket (reject / self-cancel paths).
pub async fn cancel_by_ticket(conn: &mut PgConnection, ticket_id: Uuid) -> Result<u64> {
    let res = sqlx::query(
        r#"UPDATE domain_events
           SET status = 'CANCELLED', updated_at = now()
           WHERE ticket_id = $1 AND status IN ('PENDING', 'PROCESSING')"#,
    )
    .bind(ticket_id)
    .execute(conn)
    .await?;
    Ok(res.rows_affected())
}

/// Archive terminal events older than the cutoff; the row stays for audit
/// correlation, archived_at just takes it out of the hot indexes.
pub async fn archive_terminal(conn: &mut PgConnection, older_than_days: i64) -> Result<u64> {
    let res = sqlx::query(
        r#"UPDATE domain_events
           SET archived_at = now()
           WHERE archived_at IS NULL
             AND status IN ('COMPLETED', 'FAILED', 'CANCELLED')
             AND updated_at < now() - make_interval(days => $1)"#,
    )
    .bind(older_than_days as i32)
    .execute(conn)
    .await?;
    Ok(res.rows_affected())
}
