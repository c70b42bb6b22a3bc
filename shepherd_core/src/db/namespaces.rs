//! namespace_registry queries.

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgExecutor, Row};
use uuid::Uuid;

use shepherd_definitions::{Environment, NamespaceRecord};

use crate::Result;

const COLUMNS: &str = "id, name, environment, description, created_at";

fn map_namespace(row: &PgRow) -> Result<NamespaceRecord> {
    let environment: String = row.try_get("environment")?;
    Ok(NamespaceRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        environment: environment.parse::<Environment>()?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn insert(conn: &mut PgConnection, ns: &NamespaceRecord) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO namespace_registry (id, name, environment, description, created_at)
           VALUES ($1, $2, $3, $4, $5)"#,
    )
    .bind(ns.id)
    .bind(&ns.name)
    .bind(ns.environment.as_str())
    .bind(&ns.description)
    .bind(ns.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_by_name<'e, E: PgExecutor<'e>>(ex: E, name: &str) -> Result<Option<NamespaceRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM namespace_registry WHERE name = $1",
        COLUMNS
    ))
    .bind(name)
    .fetch_optional(ex)
    .await?;
    row.as_ref().map(map_namespace).transpose()
}

pub async fn list<'e, E: PgExecutor<'e>>(ex: E) -> Result<Vec<NamespaceRecord>> {
    let rows = sqlx::query(&format!("SELECT {} FROM namespace_registry ORDER BY name", COLUMNS))
        .fetch_all(ex)
        .await?;
    rows.iter().map(map_namespace).collect()
}

pub async fn delete(conn: &mut PgConnection, id: Uuid) -> Result<bool> {
    let res = sqlx::query("DELETE FROM namespace_registry WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(res.rows_affected() == 1)
}
