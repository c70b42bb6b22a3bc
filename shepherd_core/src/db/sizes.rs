//! instance_sizes queries.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgExecutor, Row};
use uuid::Uuid;

use shepherd_definitions::instance_size::{Capability, InstanceSize};

use crate::Result;

const COLUMNS: &str = "id, name, cpu, memory_mi, disk_gi, required_capabilities, spec_overrides, \
     created_at, updated_at";

fn map_size(row: &PgRow) -> Result<InstanceSize> {
    let caps: Vec<String> = row.try_get("required_capabilities")?;
    let overrides: Value = row.try_get("spec_overrides")?;
    let spec_overrides: BTreeMap<String, Value> = overrides
        .as_object()
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    let required_capabilities: BTreeSet<Capability> = caps
        .iter()
        .filter_map(|c| c.parse::<Capability>().ok())
        .collect();
    Ok(InstanceSize {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        cpu: row.try_get("cpu")?,
        memory_mi: row.try_get("memory_mi")?,
        disk_gi: row.try_get("disk_gi")?,
        required_capabilities,
        spec_overrides,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn insert(conn: &mut PgConnection, s: &InstanceSize) -> Result<()> {
    let caps: Vec<String> = s
        .required_capabilities
        .iter()
        .map(|c| c.as_str().to_string())
        .collect();
    let overrides = Value::Object(
        s.spec_overrides
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    sqlx::query(
        r#"INSERT INTO instance_sizes
           (id, name, cpu, memory_mi, disk_gi, required_capabilities, spec_overrides,
            created_at, updated_at)
           VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)"#,
    )
    .bind(s.id)
    .bind(&s.name)
    .bind(s.cpu)
    .bind(s.memory_mi)
    .bind(s.disk_gi)
    .bind(&caps)
    .bind(&overrides)
    .bind(s.created_at)
    .bind(s.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> Result<Option<InstanceSize>> {
    let row = sqlx::query(&format!("SELECT {} FROM instance_sizes WHERE id = $1", COLUMNS))
        .bind(id)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(map_size).transpose()
}

pub async fn list<'e, E: PgExecutor<'e>>(ex: E) -> Result<Vec<InstanceSize>> {
    let rows = sqlx::query(&format!("SELECT {} FROM instance_sizes ORDER BY cpu, memory_mi", COLUMNS))
        .fetch_all(ex)
        .await?;
    rows.iter().map(map_size).collect()
}

pub async fn update(conn: &mut PgConnection, s: &InstanceSize) -> Result<bool> {
    let caps: Vec<String> = s
        .required_capabilities
        .iter()
        .map(|c| c.as_str().to_string())
        .collect();
    let overrides = Value::Object(
        s.spec_overrides
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    let res = sqlx::query(
        r#"UPDATE instance_sizes
           SET name = $2, cpu = $3, memory_mi = $4, disk_gi = $5,
               required_capabilities = $6, spec_overrides = $7, updated_at = now()
           WHERE id = $1"#,
    )
    .bind(s.id)
    .bind(&s.name)
    .bind(s.cpu)
    .bind(s.memory_mi)
    .bind(s.disk_gi)
    .bind(&caps)
    .bind(&overrides)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn delete(conn: &mut PgConnection, id: Uuid) -> Result<bool> {
    let res = sqlx::query("DELETE FROM instance_sizes WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(res.rows_affected() == 1)
}
