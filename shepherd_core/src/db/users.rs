//! users queries. Users are disabled, never deleted.

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgExecutor, Row};
use uuid::Uuid;

use shepherd_definitions::User;

use crate::Result;

const COLUMNS: &str =
    "id, username, password_hash, force_password_change, disabled, created_at, updated_at";

fn map_user(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        force_password_change: row.try_get("force_password_change")?,
        disabled: row.try_get("disabled")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn insert(conn: &mut PgConnection, user: &User) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO users
           (id, username, password_hash, force_password_change, disabled, created_at, updated_at)
           VALUES ($1,$2,$3,$4,$5,$6,$7)"#,
    )
    .bind(user.id)
    .bind(&user.username)
    .bind(&user.password_hash)
    .bind(user.force_password_change)
    .bind(user.disabled)
    .bind(user.created_at)
    .bind(user.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> Result<Option<User>> {
    let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = $1", COLUMNS))
        .bind(id)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(map_user).transpose()
}

pub async fn get_by_username<'e, E: PgExecutor<'e>>(ex: E, username: &str) -> Result<Option<User>> {
    let row = sqlx::query(&format!("SELECT {} FROM users WHERE username = $1", COLUMNS))
        .bind(username)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(map_user).transpose()
}

pub async fn list<'e, E: PgExecutor<'e>>(ex: E) -> Result<Vec<User>> {
    let rows = sqlx::query(&format!("SELECT {} FROM users ORDER BY username", COLUMNS))
        .fetch_all(ex)
        .await?;
    rows.iter().map(map_user).collect()
}

pub async fn set_password(
    conn: &mut PgConnection,
    id: Uuid,
    password_hash: &str,
    force_change: bool,
) -> Result<bool> {
    let res = sqlx::query(
        r#"UPDATE users SET password_hash = $2, force_password_change = $3, updated_at = now()
           WHERE id = $1"#,
    )
    .bind(id)
    .bind(password_hash)
    .bind(force_change)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn set_disabled(conn: &mut PgConnection, id: Uuid, disabled: bool) -> Result<bool> {
    let res = sqlx::query("UPDATE users SET disabled = $2, updated_at = now() WHERE id = $1")
        .bind(id)
        .bind(disabled)
        .execute(conn)
        .await?;
    Ok(res.rows_affected() == 1)
}
