use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ticket::OperationType;
use crate::{Error, Result};

/// Event lifecycle states.
///
/// PENDING events belong to tickets awaiting approval; PROCESSING means a
/// worker owns it. The payload is immutable for the lifetime of the row.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Processing => "PROCESSING",
            EventStatus::Completed => "COMPLETED",
            EventStatus::Failed => "FAILED",
            EventStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventStatus::Completed | EventStatus::Failed | EventStatus::Cancelled
        )
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(EventStatus::Pending),
            "PROCESSING" => Ok(EventStatus::Processing),
            "COMPLETED" => Ok(EventStatus::Completed),
            "FAILED" => Ok(EventStatus::Failed),
            "CANCELLED" => Ok(EventStatus::Cancelled),
            other => Err(Error::Internal(format!("unknown event status '{}'", other))),
        }
    }
}

/// The durable record of work to perform once a ticket is approved.
///
/// Queue rows reference events by id only (claim check); the business
/// payload lives here and nowhere else.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DomainEvent {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub kind: OperationType,
    /// Immutable copy of the ticket payload at enqueue time
    pub payload: Value,
    pub status: EventStatus,
    pub attempts: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DomainEvent {
    /// The spec actually sent to the provider.
    ///
    /// An approver's `modified_spec` replaces the payload wholesale; there
    /// is deliberately no merge step.
    pub fn effective_spec(&self, modified_spec: Option<&Value>) -> Value {
        match modified_spec {
            Some(m) => m.clone(),
            None => self.payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_with(payload: Value) -> DomainEvent {
        DomainEvent {
            id: Uuid::new_v4(),
            ticket_id: Uuid::new_v4(),
            kind: OperationType::CreateVm,
            payload,
            status: EventStatus::Pending,
            attempts: 0,
            last_error: None,
            archived_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn modified_spec_replaces_instead_of_merging() {
        let ev = event_with(json!({"cpu": 4, "memory": "8Gi", "disk": "50Gi"}));
        let modified = json!({"cpu": 2, "memory": "4Gi", "disk": "50Gi"});
        let effective = ev.effective_spec(Some(&modified));
        assert_eq!(effective, modified);
        // the original value must not leak through
        assert_eq!(effective["cpu"], 2);
        assert_eq!(effective["memory"], "4Gi");
    }

    #[test]
    fn absent_modification_uses_payload() {
        let ev = event_with(json!({"cpu": 4}));
        assert_eq!(ev.effective_spec(None), json!({"cpu": 4}));
    }
}
