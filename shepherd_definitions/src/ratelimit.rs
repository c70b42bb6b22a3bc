use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The five limit types checked on the batch submit path.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    GlobalPendingBatches,
    GlobalSubmitRate,
    UserPendingBatches,
    UserBatchCooldown,
    UserPendingChildren,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::GlobalPendingBatches => "global_pending_batches",
            LimitType::GlobalSubmitRate => "global_submit_rate",
            LimitType::UserPendingBatches => "user_pending_batches",
            LimitType::UserBatchCooldown => "user_batch_cooldown",
            LimitType::UserPendingChildren => "user_pending_children",
        }
    }

    /// Scope half of the deterministic counter key
    pub fn scope(&self) -> &'static str {
        match self {
            LimitType::GlobalPendingBatches | LimitType::GlobalSubmitRate => "global",
            _ => "user",
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimitType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "global_pending_batches" => Ok(LimitType::GlobalPendingBatches),
            "global_submit_rate" => Ok(LimitType::GlobalSubmitRate),
            "user_pending_batches" => Ok(LimitType::UserPendingBatches),
            "user_batch_cooldown" => Ok(LimitType::UserBatchCooldown),
            "user_pending_children" => Ok(LimitType::UserPendingChildren),
            other => Err(Error::Internal(format!("unknown limit type '{}'", other))),
        }
    }
}

/// Configured ceilings, spec defaults.
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub struct RateLimits {
    pub global_pending_batches: i64,
    pub global_submit_per_minute: i64,
    pub user_pending_batches: i64,
    pub user_batch_cooldown_secs: i64,
    pub user_pending_children: i64,
}

impl Default for RateLimits {
    fn default() -> Self {
        RateLimits {
            global_pending_batches: 100,
            global_submit_per_minute: 1000,
            user_pending_batches: 3,
            user_batch_cooldown_secs: 120,
            user_pending_children: 30,
        }
    }
}

/// Deterministic window start for a counter row.
///
/// Gauges (pending counts) live in a single epoch window; rate windows
/// truncate to the minute; the cooldown rows are bucketed per minute and
/// aged against `user_batch_cooldown_secs` at check time.
pub fn window_start(limit: LimitType, now: DateTime<Utc>) -> DateTime<Utc> {
    match limit {
        LimitType::GlobalPendingBatches
        | LimitType::UserPendingBatches
        | LimitType::UserPendingChildren => Utc.timestamp_opt(0, 0).unwrap(),
        LimitType::GlobalSubmitRate | LimitType::UserBatchCooldown => {
            truncate_to_minute(now)
        }
    }
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    let secs = t.timestamp();
    Utc.timestamp_opt(secs - secs.rem_euclid(60), 0).unwrap()
}

/// Seconds the caller should wait before retrying a rate-windowed limit.
pub fn retry_after(limit: LimitType, limits: &RateLimits, now: DateTime<Utc>) -> u64 {
    match limit {
        LimitType::GlobalSubmitRate => {
            let next = truncate_to_minute(now) + Duration::seconds(60);
            (next - now).num_seconds().max(1) as u64
        }
        LimitType::UserBatchCooldown => limits.user_batch_cooldown_secs.max(1) as u64,
        // gauges clear when work drains; suggest a polite poll interval
        _ => 30,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_are_deterministic() {
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 11).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 59).unwrap();
        let t3 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 31, 0).unwrap();
        assert_eq!(
            window_start(LimitType::GlobalSubmitRate, t1),
            window_start(LimitType::GlobalSubmitRate, t2)
        );
        assert_ne!(
            window_start(LimitType::GlobalSubmitRate, t2),
            window_start(LimitType::GlobalSubmitRate, t3)
        );
        // gauges share one fixed window
        assert_eq!(
            window_start(LimitType::UserPendingBatches, t1),
            window_start(LimitType::UserPendingBatches, t3)
        );
    }

    #[test]
    fn retry_after_is_at_least_one_second() {
        let limits = RateLimits::default();
        let end_of_window = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 59).unwrap();
        assert!(retry_after(LimitType::GlobalSubmitRate, &limits, end_of_window) >= 1);
        assert_eq!(retry_after(LimitType::UserBatchCooldown, &limits, end_of_window), 120);
    }
}
