//! audit_logs queries: insert and paginated reads. The table is
//! append-only; no update or delete exists in this module.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgExecutor, Row};
use uuid::Uuid;

use shepherd_definitions::audit::{AuditAction, AuditEntry};
use shepherd_definitions::rbac::ResourceType;
use shepherd_definitions::Environment;

use crate::Result;

const COLUMNS: &str = "id, action, actor_id, resource_type, resource_id, resource_name, \
     parent_type, parent_id, environment, details, ip, user_agent, created_at";

fn map_entry(row: &PgRow) -> Result<AuditEntry> {
    let action: String = row.try_get("action")?;
    let resource_type: Option<String> = row.try_get("resource_type")?;
    let parent_type: Option<String> = row.try_get("parent_type")?;
    let environment: Option<String> = row.try_get("environment")?;
    Ok(AuditEntry {
        id: row.try_get("id")?,
        action: action.parse::<AuditAction>()?,
        actor_id: row.try_get("actor_id")?,
        resource_type: resource_type
            .map(|t| t.parse::<ResourceType>())
            .transpose()?,
        resource_id: row.try_get("resource_id")?,
        resource_name: row.try_get("resource_name")?,
        parent_type: parent_type.map(|t| t.parse::<ResourceType>()).transpose()?,
        parent_id: row.try_get("parent_id")?,
        environment: environment.map(|e| e.parse::<Environment>()).transpose()?,
        details: row.try_get("details")?,
        ip: row.try_get("ip")?,
        user_agent: row.try_get("user_agent")?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn insert(conn: &mut PgConnection, e: &AuditEntry) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO audit_logs
           (id, action, actor_id, resource_type, resource_id, resource_name, parent_type,
            parent_id, environment, details, ip, user_agent, created_at)
           VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)"#,
    )
    .bind(e.id)
    .bind(e.action.as_str())
    .bind(e.actor_id)
    .bind(e.resource_type.map(|t| t.as_str()))
    .bind(e.resource_id)
    .bind(&e.resource_name)
    .bind(e.parent_type.map(|t| t.as_str()))
    .bind(e.parent_id)
    .bind(e.environment.map(|v| v.as_str()))
    .bind(&e.details)
    .bind(&e.ip)
    .bind(&e.user_agent)
    .bind(e.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Paginated listing with the two filters the admin screens use.
pub async fn list<'e, E: PgExecutor<'e>>(
    ex: E,
    actor: Option<Uuid>,
    resource: Option<(ResourceType, Uuid)>,
    since: Option<DateTime<Utc>>,
    limit: i64,
    offset: i64,
) -> Result<Vec<AuditEntry>> {
    let rows = sqlx::query(&format!(
        r#"SELECT {} FROM audit_logs
           WHERE ($1::uuid IS NULL OR actor_id = $1)
             AND ($2::text IS NULL OR (resource_type = $2 AND resource_id = $3))
             AND ($4::timestamptz IS NULL OR created_at >= $4)
           ORDER BY created_at DESC
           LIMIT $5 OFFSET $6"#,
        COLUMNS
    ))
    .bind(actor)
    .bind(resource.map(|(t, _)| t.as_str()))
    .bind(resource.map(|(_, id)| id))
    .bind(since)
    .bind(limit)
    .bind(offset)
    .fetch_all(ex)
    .await?;
    rows.iter().map(map_entry).collect()
}

/// Actions recorded for one resource, oldest first; used by the flow tests
/// and the ticket detail view.
pub async fn actions_for_resource<'e, E: PgExecutor<'e>>(
    ex: E,
    resource_type: ResourceType,
    resource_id: Uuid,
) -> Result<Vec<AuditAction>> {
    let rows = sqlx::query(
        r#"SELECT action FROM audit_logs
           WHERE resource_type = $1 AND resource_id = $2
           ORDER BY created_at"#,
    )
    .bind(resource_type.as_str())
    .bind(resource_id)
    .fetch_all(ex)
    .await?;
    rows.iter()
        .map(|row| {
            let a: String = row.try_get("action")?;
            Ok(a.parse::<AuditAction>()?)
        })
        .collect()
}
