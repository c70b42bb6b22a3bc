//! rate_limit_counter / rate_limit_exemption queries.
//!
//! Counter rows live under the deterministic unique key
//! (scope, subject, limit_type, window_start); the upsert increments and
//! returns the new value in one statement, and a limit breach rolls the
//! whole submission transaction back, leaving the counter untouched.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgExecutor, Row};
use uuid::Uuid;

use shepherd_definitions::ratelimit::LimitType;

use crate::Result;

/// Increment-and-read for one window. Returns the counter value after the
/// increment.
pub async fn bump_counter(
    conn: &mut PgConnection,
    limit: LimitType,
    subject: &str,
    window_start: DateTime<Utc>,
    by: i64,
) -> Result<i64> {
    let value: i64 = sqlx::query_scalar(
        r#"INSERT INTO rate_limit_counter (scope, subject, limit_type, window_start, current_value)
           VALUES ($1, $2, $3, $4, $5)
           ON CONFLICT (scope, subject, limit_type, window_start)
           DO UPDATE SET current_value = rate_limit_counter.current_value + $5
           RETURNING current_value"#,
    )
    .bind(limit.scope())
    .bind(subject)
    .bind(limit.as_str())
    .bind(window_start)
    .bind(by)
    .fetch_one(conn)
    .await?;
    Ok(value)
}

/// Most recent window start recorded for a subject and limit type; drives
/// the cooldown check.
pub async fn last_window<'e, E: PgExecutor<'e>>(
    ex: E,
    limit: LimitType,
    subject: &str,
) -> Result<Option<DateTime<Utc>>> {
    let t = sqlx::query_scalar(
        r#"SELECT max(window_start) FROM rate_limit_counter
           WHERE scope = $1 AND subject = $2 AND limit_type = $3"#,
    )
    .bind(limit.scope())
    .bind(subject)
    .bind(limit.as_str())
    .fetch_one(ex)
    .await?;
    Ok(t)
}

/// Expired windows are deleted by the hygiene loop.
pub async fn cleanup_windows(conn: &mut PgConnection, older_than_hours: i64) -> Result<u64> {
    let res = sqlx::query(
        r#"DELETE FROM rate_limit_counter
           WHERE window_start > to_timestamp(0)
             AND window_start < now() - make_interval(hours => $1)"#,
    )
    .bind(older_than_hours as i32)
    .execute(conn)
    .await?;
    Ok(res.rows_affected())
}

/// Whether the user holds a live exemption.
pub async fn is_exempt<'e, E: PgExecutor<'e>>(ex: E, user_id: Uuid) -> Result<bool> {
    let found: Option<i32> = sqlx::query_scalar(
        r#"SELECT 1 FROM rate_limit_exemption
           WHERE user_id = $1 AND (expires_at IS NULL OR expires_at > now())
           LIMIT 1"#,
    )
    .bind(user_id)
    .fetch_optional(ex)
    .await?;
    Ok(found.is_some())
}

pub async fn grant_exemption(
    conn: &mut PgConnection,
    user_id: Uuid,
    expires_at: Option<DateTime<Utc>>,
    reason: &str,
) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO rate_limit_exemption (user_id, expires_at, reason, created_at)
           VALUES ($1, $2, $3, now())
           ON CONFLICT (user_id) DO UPDATE SET expires_at = $2, reason = $3"#,
    )
    .bind(user_id)
    .bind(expires_at)
    .bind(reason)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn revoke_exemption(conn: &mut PgConnection, user_id: Uuid) -> Result<bool> {
    let res = sqlx::query("DELETE FROM rate_limit_exemption WHERE user_id = $1")
        .bind(user_id)
        .execute(conn)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Exemption rows for the admin screen.
pub async fn list_exemptions<'e, E: PgExecutor<'e>>(
    ex: E,
) -> Result<Vec<(Uuid, Option<DateTime<Utc>>, String)>> {
    let rows = sqlx::query(
        "SELECT user_id, expires_at, reason FROM rate_limit_exemption ORDER BY created_at",
    )
    .fetch_all(ex)
    .await?;
    rows.iter()
        .map(|row| {
            Ok((
                row.try_get("user_id")?,
                row.try_get("expires_at")?,
                row.try_get("reason")?,
            ))
        })
        .collect()
}
