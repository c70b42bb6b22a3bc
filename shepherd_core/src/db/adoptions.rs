//! pending_adoptions queries.

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgExecutor, Row};
use uuid::Uuid;

use shepherd_definitions::adoption::{AdoptionStatus, PendingAdoption};

use crate::Result;

const COLUMNS: &str = "id, cluster_id, namespace, resource_name, system_label, service_label, \
     instance_label, external_uid, spec_snapshot, status, created_at, updated_at";

fn map_adoption(row: &PgRow) -> Result<PendingAdoption> {
    let status: String = row.try_get("status")?;
    Ok(PendingAdoption {
        id: row.try_get("id")?,
        cluster_id: row.try_get("cluster_id")?,
        namespace: row.try_get("namespace")?,
        resource_name: row.try_get("resource_name")?,
        system_label: row.try_get("system_label")?,
        service_label: row.try_get("service_label")?,
        instance_label: row.try_get("instance_label")?,
        external_uid: row.try_get("external_uid")?,
        spec_snapshot: row.try_get("spec_snapshot")?,
        status: status.parse::<AdoptionStatus>()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Idempotent on external uid: the sweep re-finding the same orphan does
/// not duplicate the proposal.
pub async fn propose(conn: &mut PgConnection, a: &PendingAdoption) -> Result<bool> {
    let res = sqlx::query(
        r#"INSERT INTO pending_adoptions
           (id, cluster_id, namespace, resource_name, system_label, service_label,
            instance_label, external_uid, spec_snapshot, status, created_at, updated_at)
           VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
           ON CONFLICT (external_uid) DO NOTHING"#,
    )
    .bind(a.id)
    .bind(a.cluster_id)
    .bind(&a.namespace)
    .bind(&a.resource_name)
    .bind(&a.system_label)
    .bind(&a.service_label)
    .bind(&a.instance_label)
    .bind(&a.external_uid)
    .bind(&a.spec_snapshot)
    .bind(a.status.as_str())
    .bind(a.created_at)
    .bind(a.updated_at)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn get<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> Result<Option<PendingAdoption>> {
    let row = sqlx::query(&format!("SELECT {} FROM pending_adoptions WHERE id = $1", COLUMNS))
        .bind(id)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(map_adoption).transpose()
}

pub async fn list_pending<'e, E: PgExecutor<'e>>(ex: E) -> Result<Vec<PendingAdoption>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM pending_adoptions WHERE status = 'PENDING' ORDER BY created_at",
        COLUMNS
    ))
    .fetch_all(ex)
    .await?;
    rows.iter().map(map_adoption).collect()
}

/// Admin resolution; only PENDING rows move.
pub async fn resolve(conn: &mut PgConnection, id: Uuid, status: AdoptionStatus) -> Result<bool> {
    let res = sqlx::query(
        r#"UPDATE pending_adoptions SET status = $2, updated_at = now()
           WHERE id = $1 AND status = 'PENDING'"#,
    )
    .bind(id)
    .bind(status.as_str())
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}
