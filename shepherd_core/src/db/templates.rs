//! templates queries.
//!
//! The at-most-one-active-per-name invariant is enforced here: publishing
//! deprecates the previous active row inside the same transaction, backed
//! by a partial unique index on (name) WHERE status = 'active'.

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgExecutor, Row};
use uuid::Uuid;

use shepherd_definitions::template::{Template, TemplateStatus};

use crate::Result;

const COLUMNS: &str =
    "id, name, version, status, content, os_image, cloud_init, created_at, updated_at";

fn map_template(row: &PgRow) -> Result<Template> {
    let status: String = row.try_get("status")?;
    Ok(Template {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        status: status.parse::<TemplateStatus>()?,
        content: row.try_get("content")?,
        os_image: row.try_get("os_image")?,
        cloud_init: row.try_get("cloud_init")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn insert(conn: &mut PgConnection, t: &Template) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO templates
           (id, name, version, status, content, os_image, cloud_init, created_at, updated_at)
           VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)"#,
    )
    .bind(t.id)
    .bind(&t.name)
    .bind(&t.version)
    .bind(t.status.as_str())
    .bind(&t.content)
    .bind(&t.os_image)
    .bind(&t.cloud_init)
    .bind(t.created_at)
    .bind(t.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> Result<Option<Template>> {
    let row = sqlx::query(&format!("SELECT {} FROM templates WHERE id = $1", COLUMNS))
        .bind(id)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(map_template).transpose()
}

pub async fn get_active<'e, E: PgExecutor<'e>>(ex: E, name: &str) -> Result<Option<Template>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM templates WHERE name = $1 AND status = 'active'",
        COLUMNS
    ))
    .bind(name)
    .fetch_optional(ex)
    .await?;
    row.as_ref().map(map_template).transpose()
}

pub async fn list<'e, E: PgExecutor<'e>>(ex: E) -> Result<Vec<Template>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM templates ORDER BY name, created_at DESC",
        COLUMNS
    ))
    .fetch_all(ex)
    .await?;
    rows.iter().map(map_template).collect()
}

/// Activate a draft. The previous active version of the same name is
/// auto-deprecated first so the partial unique index never trips.
pub async fn publish(conn: &mut PgConnection, id: Uuid) -> Result<bool> {
    sqlx::query(
        r#"UPDATE templates SET status = 'deprecated', updated_at = now()
           WHERE status = 'active'
             AND name = (SELECT name FROM templates WHERE id = $1)"#,
    )
    .bind(id)
    .execute(&mut *conn)
    .await?;
    let res = sqlx::query(
        r#"UPDATE templates SET status = 'active', updated_at = now()
           WHERE id = $1 AND status = 'draft'"#,
    )
    .bind(id)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn archive(conn: &mut PgConnection, id: Uuid) -> Result<bool> {
    let res = sqlx::query(
        r#"UPDATE templates SET status = 'archived', updated_at = now()
           WHERE id = $1 AND status != 'archived'"#,
    )
    .bind(id)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}
