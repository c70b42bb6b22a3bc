//! approval_tickets queries.
//!
//! Status transitions are conditional updates guarded on the expected
//! current status; a zero row count means the transition lost a race or
//! was illegal, and callers turn that into `Conflict`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgExecutor, Row};
use uuid::Uuid;

use shepherd_definitions::ticket::{ApprovalTicket, OperationType, TicketStatus};
use shepherd_definitions::Environment;

use crate::Result;

const COLUMNS: &str = "id, operation, requester, payload, modified_spec, modification_reason, \
     status, environment, namespace, service_id, decided_by, decision_reason, \
     selected_cluster_id, selected_storage_class, request_id, parent_batch_id, sequence_no, \
     attempts, created_at, updated_at";

pub(crate) fn map_ticket(row: &PgRow) -> Result<ApprovalTicket> {
    let operation: String = row.try_get("operation")?;
    let status: String = row.try_get("status")?;
    let environment: String = row.try_get("environment")?;
    Ok(ApprovalTicket {
        id: row.try_get("id")?,
        operation: operation.parse::<OperationType>()?,
        requester: row.try_get("requester")?,
        payload: row.try_get("payload")?,
        modified_spec: row.try_get("modified_spec")?,
        modification_reason: row.try_get("modification_reason")?,
        status: status.parse::<TicketStatus>()?,
        environment: environment.parse::<Environment>()?,
        namespace: row.try_get("namespace")?,
        service_id: row.try_get("service_id")?,
        decided_by: row.try_get("decided_by")?,
        decision_reason: row.try_get("decision_reason")?,
        selected_cluster_id: row.try_get("selected_cluster_id")?,
        selected_storage_class: row.try_get("selected_storage_class")?,
        request_id: row.try_get("request_id")?,
        parent_batch_id: row.try_get("parent_batch_id")?,
        sequence_no: row.try_get("sequence_no")?,
        attempts: row.try_get("attempts")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn insert(conn: &mut PgConnection, t: &ApprovalTicket) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO approval_tickets
           (id, operation, requester, payload, modified_spec, modification_reason, status,
            environment, namespace, service_id, decided_by, decision_reason,
            selected_cluster_id, selected_storage_class, request_id, parent_batch_id,
            sequence_no, attempts, created_at, updated_at)
           VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20)"#,
    )
    .bind(t.id)
    .bind(t.operation.as_str())
    .bind(t.requester)
    .bind(&t.payload)
    .bind(&t.modified_spec)
    .bind(&t.modification_reason)
    .bind(t.status.as_str())
    .bind(t.environment.as_str())
    .bind(&t.namespace)
    .bind(t.service_id)
    .bind(t.decided_by)
    .bind(&t.decision_reason)
    .bind(t.selected_cluster_id)
    .bind(&t.selected_storage_class)
    .bind(&t.request_id)
    .bind(t.parent_batch_id)
    .bind(t.sequence_no)
    .bind(t.attempts)
    .bind(t.created_at)
    .bind(t.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> Result<Option<ApprovalTicket>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM approval_tickets WHERE id = $1",
        COLUMNS
    ))
    .bind(id)
    .fetch_optional(ex)
    .await?;
    row.as_ref().map(map_ticket).transpose()
}

/// Idempotency lookup: same requester + request_id returns the original.
pub async fn find_by_request_id<'e, E: PgExecutor<'e>>(
    ex: E,
    requester: Uuid,
    request_id: &str,
) -> Result<Option<ApprovalTicket>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM approval_tickets WHERE requester = $1 AND request_id = $2",
        COLUMNS
    ))
    .bind(requester)
    .bind(request_id)
    .fetch_optional(ex)
    .await?;
    row.as_ref().map(map_ticket).transpose()
}

pub async fn list_by_status<'e, E: PgExecutor<'e>>(
    ex: E,
    status: TicketStatus,
    limit: i64,
    offset: i64,
) -> Result<Vec<ApprovalTicket>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM approval_tickets WHERE status = $1
         ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        COLUMNS
    ))
    .bind(status.as_str())
    .bind(limit)
    .bind(offset)
    .fetch_all(ex)
    .await?;
    rows.iter().map(map_ticket).collect()
}

/// Approve or reject. Guarded on PENDING_APPROVAL; false means the ticket
/// was already decided (or never existed) and the caller reports Conflict.
#[allow(clippy::too_many_arguments)]
pub async fn decide(
    conn: &mut PgConnection,
    id: Uuid,
    to: TicketStatus,
    decided_by: Uuid,
    reason: Option<&str>,
    modified_spec: Option<&Value>,
    modification_reason: Option<&str>,
    selected_cluster_id: Option<Uuid>,
    selected_storage_class: Option<&str>,
) -> Result<bool> {
    let res = sqlx::query(
        r#"UPDATE approval_tickets
           SET status = $2, decided_by = $3, decision_reason = $4,
               modified_spec = COALESCE($5, modified_spec),
               modification_reason = COALESCE($6, modification_reason),
               selected_cluster_id = COALESCE($7, selected_cluster_id),
               selected_storage_class = COALESCE($8, selected_storage_class),
               updated_at = now()
           WHERE id = $1 AND status = 'PENDING_APPROVAL'"#,
    )
    .bind(id)
    .bind(to.as_str())
    .bind(decided_by)
    .bind(reason)
    .bind(modified_spec)
    .bind(modification_reason)
    .bind(selected_cluster_id)
    .bind(selected_storage_class)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Requester self-cancel; only out of PENDING_APPROVAL.
pub async fn cancel(conn: &mut PgConnection, id: Uuid, requester: Uuid) -> Result<bool> {
    let res = sqlx::query(
        r#"UPDATE approval_tickets
           SET status = 'CANCELLED', updated_at = now()
           WHERE id = $1 AND requester = $2 AND status = 'PENDING_APPROVAL'"#,
    )
    .bind(id)
    .bind(requester)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Claim-time transition. Idempotent across redeliveries: an EXECUTING
/// ticket stays claimable by the same event's retry, the attempt counter
/// is the guard against divergence.
pub async fn mark_executing(conn: &mut PgConnection, id: Uuid) -> Result<bool> {
    let res = sqlx::query(
        r#"UPDATE approval_tickets
           SET status = 'EXECUTING', attempts = attempts + 1, updated_at = now()
           WHERE id = $1 AND status IN ('APPROVED', 'EXECUTING')"#,
    )
    .bind(id)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Terminal bookkeeping; only an EXECUTING ticket can land.
pub async fn mark_terminal(conn: &mut PgConnection, id: Uuid, to: TicketStatus) -> Result<bool> {
    debug_assert!(matches!(to, TicketStatus::Success | TicketStatus::Failed));
    let res = sqlx::query(
        r#"UPDATE approval_tickets
           SET status = $2, updated_at = now()
           WHERE id = $1 AND status = 'EXECUTING'"#,
    )
    .bind(id)
    .bind(to.as_str())
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn children_of_batch<'e, E: PgExecutor<'e>>(
    ex: E,
    batch_id: Uuid,
) -> Result<Vec<ApprovalTicket>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM approval_tickets WHERE parent_batch_id = $1 ORDER BY sequence_no",
        COLUMNS
    ))
    .bind(batch_id)
    .fetch_all(ex)
    .await?;
    rows.iter().map(map_ticket).collect()
}

pub async fn children_of_batch_in_status<'e, E: PgExecutor<'e>>(
    ex: E,
    batch_id: Uuid,
    status: TicketStatus,
) -> Result<Vec<ApprovalTicket>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM approval_tickets
         WHERE parent_batch_id = $1 AND status = $2 ORDER BY sequence_no",
        COLUMNS
    ))
    .bind(batch_id)
    .bind(status.as_str())
    .fetch_all(ex)
    .await?;
    rows.iter().map(map_ticket).collect()
}

/// Open (non-terminal) batch children for a user; feeds the
/// user_pending_children limit.
pub async fn count_open_children_for_user<'e, E: PgExecutor<'e>>(
    ex: E,
    user: Uuid,
) -> Result<i64> {
    let n: i64 = sqlx::query_scalar(
        r#"SELECT count(*) FROM approval_tickets
           WHERE requester = $1 AND parent_batch_id IS NOT NULL
             AND status IN ('PENDING_APPROVAL', 'APPROVED', 'EXECUTING')"#,
    )
    .bind(user)
    .fetch_one(ex)
    .await?;
    Ok(n)
}

/// Tickets updated most recently first, for the admin dashboard.
pub async fn recent<'e, E: PgExecutor<'e>>(ex: E, limit: i64) -> Result<Vec<ApprovalTicket>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM approval_tickets ORDER BY updated_at DESC LIMIT $1",
        COLUMNS
    ))
    .bind(limit)
    .fetch_all(ex)
    .await?;
    rows.iter().map(map_ticket).collect()
}

/// Timestamp guard used by dispatch when double-checking staleness.
pub async fn updated_at<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> Result<Option<DateTime<Utc>>> {
    let t = sqlx::query_scalar("SELECT updated_at FROM approval_tickets WHERE id = $1")
        .bind(id)
        .fetch_optional(ex)
        .await?;
    Ok(t)
}
