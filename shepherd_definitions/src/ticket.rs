use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Environment, Error, Result};

/// Operations that can be requested through the control plane.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    CreateVm,
    ModifyVm,
    DeleteVm,
    StartVm,
    StopVm,
    RestartVm,
    VncAccess,
    CreateSystem,
    CreateService,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::CreateVm => "CREATE_VM",
            OperationType::ModifyVm => "MODIFY_VM",
            OperationType::DeleteVm => "DELETE_VM",
            OperationType::StartVm => "START_VM",
            OperationType::StopVm => "STOP_VM",
            OperationType::RestartVm => "RESTART_VM",
            OperationType::VncAccess => "VNC_ACCESS",
            OperationType::CreateSystem => "CREATE_SYSTEM",
            OperationType::CreateService => "CREATE_SERVICE",
        }
    }

    /// The environment-aware approval policy matrix.
    ///
    /// CREATE/MODIFY/DELETE always gate on an approver; power and console
    /// operations only gate in prod; hierarchy creation never gates.
    pub fn requires_approval(&self, env: Environment) -> bool {
        match self {
            OperationType::CreateVm | OperationType::ModifyVm | OperationType::DeleteVm => true,
            OperationType::StartVm
            | OperationType::StopVm
            | OperationType::RestartVm
            | OperationType::VncAccess => env.is_prod(),
            OperationType::CreateSystem | OperationType::CreateService => false,
        }
    }

    /// Operations that end up touching a cluster once approved
    pub fn is_executable(&self) -> bool {
        !matches!(self, OperationType::CreateSystem | OperationType::CreateService)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATE_VM" => Ok(OperationType::CreateVm),
            "MODIFY_VM" => Ok(OperationType::ModifyVm),
            "DELETE_VM" => Ok(OperationType::DeleteVm),
            "START_VM" => Ok(OperationType::StartVm),
            "STOP_VM" => Ok(OperationType::StopVm),
            "RESTART_VM" => Ok(OperationType::RestartVm),
            "VNC_ACCESS" => Ok(OperationType::VncAccess),
            "CREATE_SYSTEM" => Ok(OperationType::CreateSystem),
            "CREATE_SERVICE" => Ok(OperationType::CreateService),
            other => Err(Error::Validation(format!("unknown operation '{}'", other))),
        }
    }
}

/// Ticket lifecycle states.
///
/// ```text
/// PENDING_APPROVAL --approve--> APPROVED --claim--> EXECUTING --ok--> SUCCESS
///               \--reject--> REJECTED          |                 \--err--> FAILED
///                \--cancel--> CANCELLED        \--cancel--> CANCELLED
/// ```
///
/// Terminal states never transition; that is enforced both here and by the
/// conditional UPDATE guards in the repository layer.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    PendingApproval,
    Approved,
    Rejected,
    Cancelled,
    Executing,
    Success,
    Failed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::PendingApproval => "PENDING_APPROVAL",
            TicketStatus::Approved => "APPROVED",
            TicketStatus::Rejected => "REJECTED",
            TicketStatus::Cancelled => "CANCELLED",
            TicketStatus::Executing => "EXECUTING",
            TicketStatus::Success => "SUCCESS",
            TicketStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TicketStatus::Rejected
                | TicketStatus::Cancelled
                | TicketStatus::Success
                | TicketStatus::Failed
        )
    }

    /// Whether a transition to `next` is legal.
    pub fn can_transition(&self, next: TicketStatus) -> bool {
        use TicketStatus::*;
        match (self, next) {
            (PendingApproval, Approved) => true,
            (PendingApproval, Rejected) => true,
            (PendingApproval, Cancelled) => true,
            (Approved, Executing) => true,
            (Approved, Cancelled) => true,
            (Executing, Success) => true,
            (Executing, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING_APPROVAL" => Ok(TicketStatus::PendingApproval),
            "APPROVED" => Ok(TicketStatus::Approved),
            "REJECTED" => Ok(TicketStatus::Rejected),
            "CANCELLED" => Ok(TicketStatus::Cancelled),
            "EXECUTING" => Ok(TicketStatus::Executing),
            "SUCCESS" => Ok(TicketStatus::Success),
            "FAILED" => Ok(TicketStatus::Failed),
            other => Err(Error::Internal(format!("unknown ticket status '{}'", other))),
        }
    }
}

/// The durable record of a change intent under governance.
///
/// `payload` is the immutable snapshot of the original request.
/// `modified_spec`, when set by an approver, replaces the payload's spec
/// wholesale at execution time; the two are never merged.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ApprovalTicket {
    pub id: Uuid,
    pub operation: OperationType,
    pub requester: Uuid,
    /// Immutable snapshot of the original request
    pub payload: Value,
    /// Full replacement spec set by an approver, never merged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_spec: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification_reason: Option<String>,
    pub status: TicketStatus,
    pub environment: Environment,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_cluster_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_storage_class: Option<String>,
    /// Caller-provided idempotency key; a resubmit returns the original
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_batch_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_no: Option<i32>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_matrix_matches_spec() {
        use OperationType::*;
        for op in [CreateVm, ModifyVm, DeleteVm] {
            assert!(op.requires_approval(Environment::Test));
            assert!(op.requires_approval(Environment::Prod));
        }
        for op in [StartVm, StopVm, RestartVm, VncAccess] {
            assert!(!op.requires_approval(Environment::Test));
            assert!(op.requires_approval(Environment::Prod));
        }
        for op in [CreateSystem, CreateService] {
            assert!(!op.requires_approval(Environment::Test));
            assert!(!op.requires_approval(Environment::Prod));
        }
    }

    #[test]
    fn terminal_states_never_transition() {
        use TicketStatus::*;
        for terminal in [Rejected, Cancelled, Success, Failed] {
            assert!(terminal.is_terminal());
            for next in [PendingApproval, Approved, Executing, Success, Failed, Cancelled] {
                assert!(!terminal.can_transition(next));
            }
        }
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        use TicketStatus::*;
        assert!(PendingApproval.can_transition(Approved));
        assert!(Approved.can_transition(Executing));
        assert!(Executing.can_transition(Success));
        assert!(Executing.can_transition(Failed));
        // claim must come before success
        assert!(!Approved.can_transition(Success));
        // approving twice is refused
        assert!(!Approved.can_transition(Approved));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            TicketStatus::PendingApproval,
            TicketStatus::Approved,
            TicketStatus::Rejected,
            TicketStatus::Cancelled,
            TicketStatus::Executing,
            TicketStatus::Success,
            TicketStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<TicketStatus>().unwrap(), s);
        }
    }
}
