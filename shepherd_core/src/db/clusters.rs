//! clusters queries.

use std::collections::BTreeSet;

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgExecutor, Row};
use uuid::Uuid;

use shepherd_definitions::cluster::{Cluster, ClusterHealth};
use shepherd_definitions::Environment;

use crate::Result;

const COLUMNS: &str = "id, name, api_url, credentials, environment, health, kubevirt_version, \
     enabled_features, storage_classes, default_storage_class, last_probed_at, last_detected_at, \
     created_at, updated_at";

fn map_cluster(row: &PgRow) -> Result<Cluster> {
    let environment: String = row.try_get("environment")?;
    let health: String = row.try_get("health")?;
    let features: Vec<String> = row.try_get("enabled_features")?;
    Ok(Cluster {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        api_url: row.try_get("api_url")?,
        credentials: row.try_get("credentials")?,
        environment: environment.parse::<Environment>()?,
        health: health.parse::<ClusterHealth>()?,
        kubevirt_version: row.try_get("kubevirt_version")?,
        enabled_features: features.into_iter().collect::<BTreeSet<_>>(),
        storage_classes: row.try_get("storage_classes")?,
        default_storage_class: row.try_get("default_storage_class")?,
        last_probed_at: row.try_get("last_probed_at")?,
        last_detected_at: row.try_get("last_detected_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn insert(conn: &mut PgConnection, c: &Cluster) -> Result<()> {
    let features: Vec<String> = c.enabled_features.iter().cloned().collect();
    sqlx::query(
        r#"INSERT INTO clusters
           (id, name, api_url, credentials, environment, health, kubevirt_version,
            enabled_features, storage_classes, default_storage_class, created_at, updated_at)
           VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)"#,
    )
    .bind(c.id)
    .bind(&c.name)
    .bind(&c.api_url)
    .bind(&c.credentials)
    .bind(c.environment.as_str())
    .bind(c.health.as_str())
    .bind(&c.kubevirt_version)
    .bind(&features)
    .bind(&c.storage_classes)
    .bind(&c.default_storage_class)
    .bind(c.created_at)
    .bind(c.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> Result<Option<Cluster>> {
    let row = sqlx::query(&format!("SELECT {} FROM clusters WHERE id = $1", COLUMNS))
        .bind(id)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(map_cluster).transpose()
}

pub async fn list<'e, E: PgExecutor<'e>>(ex: E) -> Result<Vec<Cluster>> {
    let rows = sqlx::query(&format!("SELECT {} FROM clusters ORDER BY name", COLUMNS))
        .fetch_all(ex)
        .await?;
    rows.iter().map(map_cluster).collect()
}

pub async fn list_by_environment<'e, E: PgExecutor<'e>>(
    ex: E,
    env: Environment,
) -> Result<Vec<Cluster>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM clusters WHERE environment = $1 ORDER BY name",
        COLUMNS
    ))
    .bind(env.as_str())
    .fetch_all(ex)
    .await?;
    rows.iter().map(map_cluster).collect()
}

pub async fn update_connection(
    conn: &mut PgConnection,
    id: Uuid,
    api_url: &str,
    credentials: &[u8],
) -> Result<bool> {
    let res = sqlx::query(
        r#"UPDATE clusters SET api_url = $2, credentials = $3, health = 'UNKNOWN',
           updated_at = now() WHERE id = $1"#,
    )
    .bind(id)
    .bind(api_url)
    .bind(credentials)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Detector write-back after a probe sweep.
pub async fn record_probe(
    conn: &mut PgConnection,
    id: Uuid,
    health: ClusterHealth,
    version: Option<&str>,
    features: &[String],
    storage_classes: &[String],
    default_storage_class: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"UPDATE clusters
           SET health = $2,
               kubevirt_version = COALESCE($3, kubevirt_version),
               enabled_features = $4,
               storage_classes = $5,
               default_storage_class = COALESCE($6, default_storage_class),
               last_probed_at = now(),
               last_detected_at = CASE WHEN $3 IS NOT NULL THEN now() ELSE last_detected_at END,
               updated_at = now()
           WHERE id = $1"#,
    )
    .bind(id)
    .bind(health.as_str())
    .bind(version)
    .bind(features)
    .bind(storage_classes)
    .bind(default_storage_class)
    .execute(conn)
    .await?;
    Ok(())
}

/// Health-only transition for failed probes; keeps capability data intact.
pub async fn record_health(conn: &mut PgConnection, id: Uuid, health: ClusterHealth) -> Result<()> {
    sqlx::query(
        r#"UPDATE clusters SET health = $2, last_probed_at = now(), updated_at = now()
           WHERE id = $1"#,
    )
    .bind(id)
    .bind(health.as_str())
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn delete(conn: &mut PgConnection, id: Uuid) -> Result<bool> {
    let res = sqlx::query("DELETE FROM clusters WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(res.rows_affected() == 1)
}
