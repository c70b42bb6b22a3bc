use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Largest number of children a single batch may carry
pub const MAX_BATCH_SIZE: usize = 50;

/// Aggregate status of a batch parent, derived from its counters.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    InProgress,
    Completed,
    PartialSuccess,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::InProgress => "IN_PROGRESS",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::PartialSuccess => "PARTIAL_SUCCESS",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Cancelled => "CANCELLED",
        }
    }

    /// Derive the parent status from its counters.
    ///
    /// Cancelled children count into `failed` for aggregation purposes, so
    /// this covers the cancel endpoint too.
    pub fn derive(pending: i32, success: i32, failed: i32) -> BatchStatus {
        if pending > 0 {
            BatchStatus::InProgress
        } else if failed == 0 {
            BatchStatus::Completed
        } else if success == 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::PartialSuccess
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "IN_PROGRESS" => Ok(BatchStatus::InProgress),
            "COMPLETED" => Ok(BatchStatus::Completed),
            "PARTIAL_SUCCESS" => Ok(BatchStatus::PartialSuccess),
            "FAILED" => Ok(BatchStatus::Failed),
            "CANCELLED" => Ok(BatchStatus::Cancelled),
            other => Err(Error::Internal(format!("unknown batch status '{}'", other))),
        }
    }
}

/// A batch parent row.
///
/// Invariant kept by the child terminal-transition statement:
/// `pending_count + success_count + failed_count == child_count`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BatchTicket {
    pub id: Uuid,
    pub batch_type: String,
    pub requester: Uuid,
    pub child_count: i32,
    pub pending_count: i32,
    pub success_count: i32,
    pub failed_count: i32,
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchTicket {
    /// Check the counter invariant; repositories assert this after updates.
    pub fn counters_consistent(&self) -> bool {
        self.pending_count + self.success_count + self.failed_count == self.child_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_derivation_table() {
        assert_eq!(BatchStatus::derive(2, 1, 1), BatchStatus::InProgress);
        assert_eq!(BatchStatus::derive(0, 4, 0), BatchStatus::Completed);
        assert_eq!(BatchStatus::derive(0, 0, 4), BatchStatus::Failed);
        assert_eq!(BatchStatus::derive(0, 3, 1), BatchStatus::PartialSuccess);
        // empty batches are rejected upstream, but derive stays total
        assert_eq!(BatchStatus::derive(0, 0, 0), BatchStatus::Completed);
    }

    #[test]
    fn counter_invariant_detects_drift() {
        let mut b = BatchTicket {
            id: Uuid::new_v4(),
            batch_type: "vm_create".into(),
            requester: Uuid::new_v4(),
            child_count: 4,
            pending_count: 1,
            success_count: 2,
            failed_count: 1,
            status: BatchStatus::InProgress,
            idempotency_key: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(b.counters_consistent());
        b.pending_count = 0;
        assert!(!b.counters_consistent());
    }
}
