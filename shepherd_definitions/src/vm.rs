use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ticket::OperationType;
use crate::{Error, Result};

/// Power actions exposed on a VM.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
            PowerAction::Restart => "restart",
        }
    }

    pub fn operation(&self) -> OperationType {
        match self {
            PowerAction::Start => OperationType::StartVm,
            PowerAction::Stop => OperationType::StopVm,
            PowerAction::Restart => OperationType::RestartVm,
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PowerAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(PowerAction::Start),
            "stop" => Ok(PowerAction::Stop),
            "restart" => Ok(PowerAction::Restart),
            other => Err(Error::Validation(format!("unknown power action '{}'", other))),
        }
    }
}

/// A VM create intent as submitted by a user.
///
/// This is what gets snapshotted into the ticket payload verbatim; the
/// governance core never edits it afterwards.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct VmRequest {
    pub name: String,
    pub service_id: Uuid,
    pub template_id: Uuid,
    pub instance_size_id: Uuid,
    pub namespace: String,
    #[serde(default)]
    pub reason: String,
    /// Idempotency key; resubmits with the same id return the original ticket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Direct spec knobs the template does not pin (cpu/memory/disk etc.)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
}

impl VmRequest {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > 63 {
            return Err(Error::Validation("vm name must be 1..=63 characters".into()));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            || self.name.starts_with('-')
            || self.name.ends_with('-')
        {
            return Err(Error::Validation(format!(
                "vm name '{}' is not a valid dns-1123 label",
                self.name
            )));
        }
        if self.namespace.is_empty() {
            return Err(Error::Validation("namespace is required".into()));
        }
        if self.reason.len() > 1024 {
            return Err(Error::Validation("reason exceeds 1024 characters".into()));
        }
        Ok(())
    }
}

/// Top of the logical hierarchy. Governance-level only.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct System {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// A service within a system; owns VMs.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Service {
    pub id: Uuid,
    pub system_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Governance-side record of a materialized VM.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct VmRecord {
    pub id: Uuid,
    pub service_id: Uuid,
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<Uuid>,
    pub template_id: Uuid,
    pub instance_size_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_uid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ownership labels stamped onto every resource the platform applies.
///
/// The reconciler keys off these to find externally created resources that
/// claim to be ours.
pub mod labels {
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const MANAGED_BY_VALUE: &str = "shepherd";
    pub const TICKET_ID: &str = "shepherd.io/ticket-id";
    pub const SYSTEM: &str = "shepherd.io/system";
    pub const SERVICE: &str = "shepherd.io/service";
    pub const INSTANCE: &str = "shepherd.io/instance";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str) -> VmRequest {
        VmRequest {
            name: name.into(),
            service_id: Uuid::new_v4(),
            template_id: Uuid::new_v4(),
            instance_size_id: Uuid::new_v4(),
            namespace: "prod-shop".into(),
            reason: "deploy".into(),
            request_id: None,
            spec: None,
        }
    }

    #[test]
    fn vm_names_follow_dns_rules() {
        assert!(request("shop-api-01").validate().is_ok());
        assert!(request("Shop").validate().is_err());
        assert!(request("").validate().is_err());
        assert!(request("-x").validate().is_err());
    }
}
