use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Result};

/// Notification categories for the in-app inbox.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ApprovalRequested,
    ApprovalDecided,
    ExecutionFinished,
    BatchFinished,
    AdoptionProposed,
    System,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ApprovalRequested => "approval_requested",
            NotificationKind::ApprovalDecided => "approval_decided",
            NotificationKind::ExecutionFinished => "execution_finished",
            NotificationKind::BatchFinished => "batch_finished",
            NotificationKind::AdoptionProposed => "adoption_proposed",
            NotificationKind::System => "system",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "approval_requested" => Ok(NotificationKind::ApprovalRequested),
            "approval_decided" => Ok(NotificationKind::ApprovalDecided),
            "execution_finished" => Ok(NotificationKind::ExecutionFinished),
            "batch_finished" => Ok(NotificationKind::BatchFinished),
            "adoption_proposed" => Ok(NotificationKind::AdoptionProposed),
            "system" => Ok(NotificationKind::System),
            other => Err(Error::Internal(format!("unknown notification kind '{}'", other))),
        }
    }
}

/// One inbox row. Written in the same transaction as the change that
/// caused it; any realtime channel is only ever a hint to re-fetch.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Notification {
    pub id: Uuid,
    pub recipient: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub metadata: Value,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}
