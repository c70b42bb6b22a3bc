use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::rbac::ResourceType;
use crate::{Environment, Error, Result};

/// Audit action codes. Append-only vocabulary; removing or renaming one
/// breaks historical queries.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    RequestSubmitted,
    ApprovalApproved,
    ApprovalRejected,
    ApprovalCancelled,
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    BatchSubmitted,
    BatchRetried,
    BatchCancelled,
    ConsoleRequested,
    ConsoleGranted,
    UserCreated,
    UserDisabled,
    PasswordChanged,
    RoleCreated,
    RoleBound,
    RoleUnbound,
    MemberAdded,
    MemberRemoved,
    ClusterCreated,
    ClusterUpdated,
    ClusterDeleted,
    NamespaceCreated,
    NamespaceDeleted,
    TemplatePublished,
    TemplateArchived,
    SizeCreated,
    SizeUpdated,
    ExemptionGranted,
    ExemptionRevoked,
    JobRequeued,
    AdoptionProposed,
    AdoptionResolved,
    LoginSucceeded,
    LoginFailed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::RequestSubmitted => "REQUEST_SUBMITTED",
            AuditAction::ApprovalApproved => "APPROVAL_APPROVED",
            AuditAction::ApprovalRejected => "APPROVAL_REJECTED",
            AuditAction::ApprovalCancelled => "APPROVAL_CANCELLED",
            AuditAction::ExecutionStarted => "EXECUTION_STARTED",
            AuditAction::ExecutionCompleted => "EXECUTION_COMPLETED",
            AuditAction::ExecutionFailed => "EXECUTION_FAILED",
            AuditAction::BatchSubmitted => "BATCH_SUBMITTED",
            AuditAction::BatchRetried => "BATCH_RETRIED",
            AuditAction::BatchCancelled => "BATCH_CANCELLED",
            AuditAction::ConsoleRequested => "CONSOLE_REQUESTED",
            AuditAction::ConsoleGranted => "CONSOLE_GRANTED",
            AuditAction::UserCreated => "USER_CREATED",
            AuditAction::UserDisabled => "USER_DISABLED",
            AuditAction::PasswordChanged => "PASSWORD_CHANGED",
            AuditAction::RoleCreated => "ROLE_CREATED",
            AuditAction::RoleBound => "ROLE_BOUND",
            AuditAction::RoleUnbound => "ROLE_UNBOUND",
            AuditAction::MemberAdded => "MEMBER_ADDED",
            AuditAction::MemberRemoved => "MEMBER_REMOVED",
            AuditAction::ClusterCreated => "CLUSTER_CREATED",
            AuditAction::ClusterUpdated => "CLUSTER_UPDATED",
            AuditAction::ClusterDeleted => "CLUSTER_DELETED",
            AuditAction::NamespaceCreated => "NAMESPACE_CREATED",
            AuditAction::NamespaceDeleted => "NAMESPACE_DELETED",
            AuditAction::TemplatePublished => "TEMPLATE_PUBLISHED",
            AuditAction::TemplateArchived => "TEMPLATE_ARCHIVED",
            AuditAction::SizeCreated => "SIZE_CREATED",
            AuditAction::SizeUpdated => "SIZE_UPDATED",
            AuditAction::ExemptionGranted => "EXEMPTION_GRANTED",
            AuditAction::ExemptionRevoked => "EXEMPTION_REVOKED",
            AuditAction::JobRequeued => "JOB_REQUEUED",
            AuditAction::AdoptionProposed => "ADOPTION_PROPOSED",
            AuditAction::AdoptionResolved => "ADOPTION_RESOLVED",
            AuditAction::LoginSucceeded => "LOGIN_SUCCEEDED",
            AuditAction::LoginFailed => "LOGIN_FAILED",
        }
    }

    /// Minimum retention in days for a prod-environment row.
    ///
    /// Deletions, approval decisions and rbac changes keep three years,
    /// everything else one.
    pub fn retention_days(&self, env: Environment) -> u32 {
        if !env.is_prod() {
            return 90;
        }
        match self {
            AuditAction::ApprovalApproved
            | AuditAction::ApprovalRejected
            | AuditAction::ApprovalCancelled
            | AuditAction::ClusterDeleted
            | AuditAction::NamespaceDeleted
            | AuditAction::UserDisabled
            | AuditAction::RoleCreated
            | AuditAction::RoleBound
            | AuditAction::RoleUnbound
            | AuditAction::MemberAdded
            | AuditAction::MemberRemoved => 3 * 365,
            _ => 365,
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| Error::Internal(format!("unknown audit action '{}'", s)))
    }
}

/// One append-only audit row. The application never updates or deletes
/// these; retention enforcement is a DBA-level partition drop.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AuditEntry {
    pub id: Uuid,
    pub action: AuditAction,
    pub actor_id: Uuid,
    pub resource_type: Option<ResourceType>,
    pub resource_id: Option<Uuid>,
    pub resource_name: Option<String>,
    pub parent_type: Option<ResourceType>,
    pub parent_id: Option<Uuid>,
    pub environment: Option<Environment>,
    /// Redacted before the row is written, never after
    pub details: Value,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

const REDACTED: &str = "[REDACTED]";

/// Keys whose values are stripped from audit details.
fn key_is_sensitive(key: &str) -> bool {
    use regex::Regex;
    let re = Regex::new(r"(?i)password|secret|token|credential|kubeconfig|private_key|api_key")
        .unwrap();
    re.is_match(key)
}

/// Recursively redact sensitive values in a details blob.
///
/// Matching is on key names (case-insensitive substring), applied through
/// nested objects and arrays. Runs before the audit row is written; the
/// stored row never contains the original value.
pub fn redact(details: &Value) -> Value {
    match details {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if key_is_sensitive(k) {
                    out.insert(k.clone(), Value::String(REDACTED.into()));
                } else {
                    out.insert(k.clone(), redact(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_sensitive_keys_recursively() {
        let details = json!({
            "username": "alice",
            "password": "hunter2",
            "connection": {
                "kubeconfig": "apiVersion: v1\nclusters: ...",
                "api_url": "https://10.0.0.1:6443",
                "nested": { "API_KEY": "abc123" }
            },
            "attempts": [ { "bearer_token": "xyz" }, { "note": "fine" } ]
        });
        let clean = redact(&details);
        assert_eq!(clean["username"], "alice");
        assert_eq!(clean["password"], REDACTED);
        assert_eq!(clean["connection"]["kubeconfig"], REDACTED);
        assert_eq!(clean["connection"]["api_url"], "https://10.0.0.1:6443");
        assert_eq!(clean["connection"]["nested"]["API_KEY"], REDACTED);
        assert_eq!(clean["attempts"][0]["bearer_token"], REDACTED);
        assert_eq!(clean["attempts"][1]["note"], "fine");
    }

    #[test]
    fn redacted_output_carries_no_original_secret() {
        let details = json!({"client_secret": "s3cr3t-value", "note": "fine"});
        let clean = serde_json::to_string(&redact(&details)).unwrap();
        assert!(!clean.contains("s3cr3t-value"));
        assert!(clean.contains("fine"));
    }

    #[test]
    fn prod_retention_floors() {
        assert_eq!(
            AuditAction::ApprovalApproved.retention_days(Environment::Prod),
            3 * 365
        );
        assert_eq!(
            AuditAction::RequestSubmitted.retention_days(Environment::Prod),
            365
        );
        assert!(AuditAction::ClusterDeleted.retention_days(Environment::Prod) >= 3 * 365);
    }
}
