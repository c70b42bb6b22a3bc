//! Rate limiting for the admission paths.
//!
//! Every change intent passes the platform-wide submit ceiling; batch
//! submissions additionally pass the two-layer batch quota. All checks
//! and counter bumps run inside the submission transaction: a breach
//! returns the typed 429 error and the rollback leaves every counter
//! untouched, which is exactly the "rejected requests do not consume
//! quota" post-condition the API promises.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use shepherd_definitions::ratelimit::{retry_after, window_start, LimitType, RateLimits};
use shepherd_definitions::Error as DomainError;

use crate::{db, Result};

fn breach(limit: LimitType, current: i64, max: i64, retry_after_seconds: u64) -> crate::Error {
    DomainError::RateLimited {
        limit_type: limit.as_str().into(),
        current,
        max,
        retry_after_seconds: retry_after_seconds.max(1),
    }
    .into()
}

/// Bump the platform-wide submit counter for this minute and compare.
/// Shared by single and batch admission; the counter counts change
/// intents of every shape.
async fn check_global_submit_rate(
    conn: &mut PgConnection,
    limits: &RateLimits,
    now: DateTime<Utc>,
) -> Result<()> {
    let submit_window = window_start(LimitType::GlobalSubmitRate, now);
    let submits =
        db::ratelimits::bump_counter(conn, LimitType::GlobalSubmitRate, "global", submit_window, 1)
            .await?;
    if submits > limits.global_submit_per_minute {
        return Err(breach(
            LimitType::GlobalSubmitRate,
            submits,
            limits.global_submit_per_minute,
            retry_after(LimitType::GlobalSubmitRate, limits, now),
        ));
    }
    Ok(())
}

/// Admission check for one non-batch change intent, run on the
/// submission transaction before the ticket insert.
pub async fn check_submit(
    conn: &mut PgConnection,
    limits: &RateLimits,
    now: DateTime<Utc>,
) -> Result<()> {
    check_global_submit_rate(conn, limits, now).await
}

/// Enforce every layer for one batch submission of `child_count` children.
///
/// Exemptions lift the per-user layer only; the global ceilings protect
/// the platform and apply to everyone.
pub async fn check_batch_submit(
    conn: &mut PgConnection,
    user_id: Uuid,
    child_count: i64,
    limits: &RateLimits,
    now: DateTime<Utc>,
) -> Result<()> {
    let exempt = db::ratelimits::is_exempt(&mut *conn, user_id).await?;

    // global gauges first: cheapest rejection for a saturated platform
    let global_pending = db::batches::count_in_progress(&mut *conn, None).await?;
    if global_pending >= limits.global_pending_batches {
        return Err(breach(
            LimitType::GlobalPendingBatches,
            global_pending,
            limits.global_pending_batches,
            retry_after(LimitType::GlobalPendingBatches, limits, now),
        ));
    }

    check_global_submit_rate(&mut *conn, limits, now).await?;

    if exempt {
        return Ok(());
    }
    let subject = user_id.to_string();

    let user_pending = db::batches::count_in_progress(&mut *conn, Some(user_id)).await?;
    if user_pending >= limits.user_pending_batches {
        return Err(breach(
            LimitType::UserPendingBatches,
            user_pending,
            limits.user_pending_batches,
            retry_after(LimitType::UserPendingBatches, limits, now),
        ));
    }

    // cooldown: the previous submission's window must be old enough
    if let Some(last) = db::ratelimits::last_window(&mut *conn, LimitType::UserBatchCooldown, &subject).await? {
        let elapsed = now - last;
        if elapsed < Duration::seconds(limits.user_batch_cooldown_secs) {
            let wait = limits.user_batch_cooldown_secs - elapsed.num_seconds();
            return Err(breach(LimitType::UserBatchCooldown, 1, 1, wait.max(1) as u64));
        }
    }

    let open_children = db::tickets::count_open_children_for_user(&mut *conn, user_id).await?;
    if open_children + child_count > limits.user_pending_children {
        return Err(breach(
            LimitType::UserPendingChildren,
            open_children + child_count,
            limits.user_pending_children,
            retry_after(LimitType::UserPendingChildren, limits, now),
        ));
    }

    // all layers passed: record this submission's cooldown window
    let cooldown_window = window_start(LimitType::UserBatchCooldown, now);
    db::ratelimits::bump_counter(conn, LimitType::UserBatchCooldown, &subject, cooldown_window, 1)
        .await?;
    Ok(())
}
