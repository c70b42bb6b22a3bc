//! Durable job queue over the persistence substrate.
//!
//! Job rows are claim checks: the argument is an event id, never business
//! payload. Claims use `FOR UPDATE SKIP LOCKED` so many workers drain
//! without lock contention, and the enqueue function takes the caller's
//! connection so the insert co-commits with the governance rows.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use shepherd_definitions::Error as DomainError;

use crate::{Error, Result};

/// Default attempt ceiling before a job dead-letters
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Backoff parameters: exponential from 1s, capped at 15 minutes
const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 900;

/// Work kinds the queue carries.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Execute a domain event against a cluster
    ExecuteEvent,
    /// Refresh a cluster's schema/capability cache after a version change
    RefreshCapabilities,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ExecuteEvent => "execute_event",
            JobKind::RefreshCapabilities => "refresh_capabilities",
        }
    }
}

impl FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "execute_event" => Ok(JobKind::ExecuteEvent),
            "refresh_capabilities" => Ok(JobKind::RefreshCapabilities),
            other => Err(Error::Domain(DomainError::Internal(format!(
                "unknown job kind '{}'",
                other
            )))),
        }
    }
}

/// Queue row states.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Available,
    Scheduled,
    Running,
    Completed,
    Retryable,
    Discarded,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Available => "available",
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Retryable => "retryable",
            JobState::Discarded => "discarded",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(JobState::Available),
            "scheduled" => Ok(JobState::Scheduled),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "retryable" => Ok(JobState::Retryable),
            "discarded" => Ok(JobState::Discarded),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(Error::Domain(DomainError::Internal(format!(
                "unknown job state '{}'",
                other
            )))),
        }
    }
}

/// One queue row.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Job {
    pub id: i64,
    pub kind: JobKind,
    /// Claim check: the event id, never the payload
    pub event_id: Uuid,
    pub state: JobState,
    pub attempts: i32,
    pub max_attempts: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retention_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn map_job(row: &PgRow) -> Result<Job> {
    let kind: String = row.try_get("kind")?;
    let state: String = row.try_get("state")?;
    Ok(Job {
        id: row.try_get("id")?,
        kind: kind.parse()?,
        event_id: row.try_get("event_id")?,
        state: state.parse()?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        scheduled_at: row.try_get("scheduled_at")?,
        retention_until: row.try_get("retention_until")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Exponential backoff with full jitter for attempt n (1-based).
pub fn backoff(attempt: i32) -> Duration {
    let exp = (attempt.max(1) - 1).min(16) as u32;
    let ceiling = (BACKOFF_BASE_SECS << exp).min(BACKOFF_CAP_SECS);
    // at least one second so a retried attempt never lands in the same tick
    let secs = rand::thread_rng().gen_range(1..=ceiling.max(1));
    Duration::from_secs(secs)
}

/// Insert a job on the caller's transaction.
///
/// This is the only enqueue there is; a non-transactional variant would
/// break the co-commit contract, so none exists.
pub async fn enqueue(
    conn: &mut PgConnection,
    kind: JobKind,
    event_id: Uuid,
    max_attempts: i32,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"INSERT INTO queue_jobs (kind, event_id, state, attempts, max_attempts, created_at)
           VALUES ($1, $2, 'available', 0, $3, now())
           RETURNING id"#,
    )
    .bind(kind.as_str())
    .bind(event_id)
    .bind(max_attempts)
    .fetch_one(conn)
    .await?;
    debug!("enqueued {} job {} for event {}", kind.as_str(), id, event_id);
    Ok(id)
}

/// Claim the next runnable job: oldest `available` row, or a
/// `scheduled`/`retryable` row whose time has come. The subselect locks
/// with SKIP LOCKED so concurrent claimers never contend.
pub async fn claim_one(pool: &PgPool) -> Result<Option<Job>> {
    let row = sqlx::query(
        r#"UPDATE queue_jobs
           SET state = 'running', attempts = attempts + 1, started_at = now()
           WHERE id = (
               SELECT id FROM queue_jobs
               WHERE state = 'available'
                  OR (state IN ('scheduled', 'retryable') AND scheduled_at <= now())
               ORDER BY created_at
               FOR UPDATE SKIP LOCKED
               LIMIT 1
           )
           RETURNING id, kind, event_id, state, attempts, max_attempts,
                     scheduled_at, retention_until, created_at"#,
    )
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(map_job).transpose()
}

/// Mark a running job done; co-commits with the caller's terminal writes.
pub async fn complete(conn: &mut PgConnection, id: i64, retention_secs: i64) -> Result<()> {
    sqlx::query(
        r#"UPDATE queue_jobs
           SET state = 'completed', finished_at = now(),
               retention_until = now() + make_interval(secs => $2)
           WHERE id = $1 AND state = 'running'"#,
    )
    .bind(id)
    .bind(retention_secs as f64)
    .execute(conn)
    .await?;
    Ok(())
}

/// Schedule the next attempt, or dead-letter when attempts are exhausted.
/// Returns the resulting state.
pub async fn retry(
    conn: &mut PgConnection,
    job: &Job,
    error: &str,
    discard_retention_secs: i64,
) -> Result<JobState> {
    if job.attempts >= job.max_attempts {
        sqlx::query(
            r#"UPDATE queue_jobs
               SET state = 'discarded', last_error = $2, finished_at = now(),
                   retention_until = now() + make_interval(secs => $3)
               WHERE id = $1 AND state = 'running'"#,
        )
        .bind(job.id)
        .bind(error)
        .bind(discard_retention_secs as f64)
        .execute(conn)
        .await?;
        return Ok(JobState::Discarded);
    }
    let delay = backoff(job.attempts);
    sqlx::query(
        r#"UPDATE queue_jobs
           SET state = 'retryable', last_error = $2,
               scheduled_at = now() + make_interval(secs => $3)
           WHERE id = $1 AND state = 'running'"#,
    )
    .bind(job.id)
    .bind(error)
    .bind(delay.as_secs() as f64)
    .execute(conn)
    .await?;
    Ok(JobState::Retryable)
}

/// Cancel from the worker's perspective: the event vanished or the failure
/// is permanent, so no further attempts make sense.
pub async fn cancel(conn: &mut PgConnection, id: i64, reason: &str) -> Result<()> {
    sqlx::query(
        r#"UPDATE queue_jobs
           SET state = 'cancelled', last_error = $2, finished_at = now(),
               retention_until = now() + interval '24 hours'
           WHERE id = $1 AND state IN ('running', 'available', 'scheduled', 'retryable')"#,
    )
    .bind(id)
    .bind(reason)
    .execute(conn)
    .await?;
    Ok(())
}

/// External cancel by event: flips waiting rows immediately; running rows
/// are signalled through the worker context instead of preempted.
pub async fn cancel_by_event(conn: &mut PgConnection, event_id: Uuid) -> Result<u64> {
    let res = sqlx::query(
        r#"UPDATE queue_jobs
           SET state = 'cancelled', finished_at = now(),
               retention_until = now() + interval '24 hours'
           WHERE event_id = $1 AND state IN ('available', 'scheduled', 'retryable')"#,
    )
    .bind(event_id)
    .execute(conn)
    .await?;
    Ok(res.rows_affected())
}

/// Dead-letter triage: put a discarded job back on the queue with a fresh
/// attempt budget. PlatformAdmin only; enforced by the caller.
pub async fn requeue_discarded(conn: &mut PgConnection, id: i64) -> Result<()> {
    let res = sqlx::query(
        r#"UPDATE queue_jobs
           SET state = 'available', attempts = 0, last_error = NULL,
               scheduled_at = NULL, finished_at = NULL, retention_until = NULL
           WHERE id = $1 AND state = 'discarded'"#,
    )
    .bind(id)
    .execute(conn)
    .await?;
    if res.rows_affected() == 0 {
        return Err(Error::Domain(DomainError::Conflict(
            "job is not in discarded state".into(),
        )));
    }
    Ok(())
}

pub async fn get(pool: &PgPool, id: i64) -> Result<Option<Job>> {
    let row = sqlx::query(
        r#"SELECT id, kind, event_id, state, attempts, max_attempts,
                  scheduled_at, retention_until, created_at
           FROM queue_jobs WHERE id = $1"#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(map_job).transpose()
}

/// Jobs still standing for an event; used by the co-commit invariant
/// checks and the admin views.
pub async fn live_jobs_for_event(pool: &PgPool, event_id: Uuid) -> Result<Vec<Job>> {
    let rows = sqlx::query(
        r#"SELECT id, kind, event_id, state, attempts, max_attempts,
                  scheduled_at, retention_until, created_at
           FROM queue_jobs
           WHERE event_id = $1 AND state IN ('available', 'scheduled', 'retryable', 'running')"#,
    )
    .bind(event_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(map_job).collect()
}

/// Rescue jobs whose worker died mid-flight (crash, panic, kill): rows
/// running for longer than the task timeout go back to retryable, or to
/// discarded when the attempt budget is spent. The attempt the dead
/// worker consumed stays counted, so a panicking job retries once and
/// then dead-letters rather than looping.
pub async fn rescue_stuck(pool: &PgPool, older_than_secs: i64) -> Result<u64> {
    let res = sqlx::query(
        r#"UPDATE queue_jobs
           SET state = CASE WHEN attempts >= max_attempts THEN 'discarded' ELSE 'retryable' END,
               last_error = 'worker lost',
               scheduled_at = now(),
               retention_until = CASE WHEN attempts >= max_attempts
                                      THEN now() + interval '7 days' ELSE retention_until END
           WHERE state = 'running'
             AND started_at < now() - make_interval(secs => $1)"#,
    )
    .bind(older_than_secs as f64)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Delete terminal rows past their retention timestamps. Runs from the
/// hygiene loop, never from request paths.
pub async fn cleanup(pool: &PgPool) -> Result<u64> {
    let res = sqlx::query(
        r#"DELETE FROM queue_jobs
           WHERE state IN ('completed', 'cancelled', 'discarded')
             AND retention_until IS NOT NULL
             AND retention_until <= now()"#,
    )
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        // attempt 1 is always exactly the base
        assert_eq!(backoff(1), Duration::from_secs(1));
        for attempt in 2..=20 {
            let d = backoff(attempt);
            assert!(d >= Duration::from_secs(1), "attempt {} too small", attempt);
            assert!(
                d <= Duration::from_secs(BACKOFF_CAP_SECS),
                "attempt {} exceeds cap",
                attempt
            );
        }
    }

    #[test]
    fn job_states_round_trip() {
        for s in [
            JobState::Available,
            JobState::Scheduled,
            JobState::Running,
            JobState::Completed,
            JobState::Retryable,
            JobState::Discarded,
            JobState::Cancelled,
        ] {
            assert_eq!(s.as_str().parse::<JobState>().unwrap(), s);
        }
    }
}
