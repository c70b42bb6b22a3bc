use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ticket::OperationType;
use crate::{Environment, Error, Result};

/// Explicit permission bits. No wildcards anywhere: `platform:admin` is one
/// bit checked by name, not a pattern that expands.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    #[serde(rename = "platform:admin")]
    PlatformAdmin,
    #[serde(rename = "vm:create")]
    VmCreate,
    #[serde(rename = "vm:modify")]
    VmModify,
    #[serde(rename = "vm:delete")]
    VmDelete,
    #[serde(rename = "vm:power")]
    VmPower,
    #[serde(rename = "vm:console")]
    VmConsole,
    #[serde(rename = "vm:read")]
    VmRead,
    #[serde(rename = "system:create")]
    SystemCreate,
    #[serde(rename = "service:create")]
    ServiceCreate,
    #[serde(rename = "approval:decide")]
    ApprovalDecide,
    #[serde(rename = "batch:submit")]
    BatchSubmit,
    #[serde(rename = "audit:read")]
    AuditRead,
    #[serde(rename = "cluster:manage")]
    ClusterManage,
    #[serde(rename = "namespace:manage")]
    NamespaceManage,
    #[serde(rename = "template:manage")]
    TemplateManage,
    #[serde(rename = "size:manage")]
    SizeManage,
    #[serde(rename = "user:manage")]
    UserManage,
    #[serde(rename = "role:manage")]
    RoleManage,
    #[serde(rename = "exemption:manage")]
    ExemptionManage,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::PlatformAdmin => "platform:admin",
            Permission::VmCreate => "vm:create",
            Permission::VmModify => "vm:modify",
            Permission::VmDelete => "vm:delete",
            Permission::VmPower => "vm:power",
            Permission::VmConsole => "vm:console",
            Permission::VmRead => "vm:read",
            Permission::SystemCreate => "system:create",
            Permission::ServiceCreate => "service:create",
            Permission::ApprovalDecide => "approval:decide",
            Permission::BatchSubmit => "batch:submit",
            Permission::AuditRead => "audit:read",
            Permission::ClusterManage => "cluster:manage",
            Permission::NamespaceManage => "namespace:manage",
            Permission::TemplateManage => "template:manage",
            Permission::SizeManage => "size:manage",
            Permission::UserManage => "user:manage",
            Permission::RoleManage => "role:manage",
            Permission::ExemptionManage => "exemption:manage",
        }
    }

    /// The global permission an operation requires at admission.
    pub fn for_operation(op: OperationType) -> Permission {
        match op {
            OperationType::CreateVm => Permission::VmCreate,
            OperationType::ModifyVm => Permission::VmModify,
            OperationType::DeleteVm => Permission::VmDelete,
            OperationType::StartVm | OperationType::StopVm | OperationType::RestartVm => {
                Permission::VmPower
            }
            OperationType::VncAccess => Permission::VmConsole,
            OperationType::CreateSystem => Permission::SystemCreate,
            OperationType::CreateService => Permission::ServiceCreate,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "platform:admin" => Ok(Permission::PlatformAdmin),
            "vm:create" => Ok(Permission::VmCreate),
            "vm:modify" => Ok(Permission::VmModify),
            "vm:delete" => Ok(Permission::VmDelete),
            "vm:power" => Ok(Permission::VmPower),
            "vm:console" => Ok(Permission::VmConsole),
            "vm:read" => Ok(Permission::VmRead),
            "system:create" => Ok(Permission::SystemCreate),
            "service:create" => Ok(Permission::ServiceCreate),
            "approval:decide" => Ok(Permission::ApprovalDecide),
            "batch:submit" => Ok(Permission::BatchSubmit),
            "audit:read" => Ok(Permission::AuditRead),
            "cluster:manage" => Ok(Permission::ClusterManage),
            "namespace:manage" => Ok(Permission::NamespaceManage),
            "template:manage" => Ok(Permission::TemplateManage),
            "size:manage" => Ok(Permission::SizeManage),
            "user:manage" => Ok(Permission::UserManage),
            "role:manage" => Ok(Permission::RoleManage),
            "exemption:manage" => Ok(Permission::ExemptionManage),
            other => Err(Error::Validation(format!("unknown permission '{}'", other))),
        }
    }
}

/// A named role with its explicit permission set.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub permissions: BTreeSet<Permission>,
    pub created_at: DateTime<Utc>,
}

/// Where a global binding came from
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BindingSource {
    Local,
    IdpMapping,
}

impl BindingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingSource::Local => "local",
            BindingSource::IdpMapping => "idp_mapping",
        }
    }
}

impl FromStr for BindingSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(BindingSource::Local),
            "idp_mapping" => Ok(BindingSource::IdpMapping),
            other => Err(Error::Internal(format!("unknown binding source '{}'", other))),
        }
    }
}

/// Global user ↔ role binding, constrained to a set of environments.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RoleBinding {
    pub id: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub allowed_environments: BTreeSet<Environment>,
    pub source: BindingSource,
    pub created_at: DateTime<Utc>,
}

/// Resource kinds that carry their own membership.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    System,
    Service,
    Vm,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::System => "system",
            ResourceType::Service => "service",
            ResourceType::Vm => "vm",
        }
    }
}

impl FromStr for ResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "system" => Ok(ResourceType::System),
            "service" => Ok(ResourceType::Service),
            "vm" => Ok(ResourceType::Vm),
            other => Err(Error::Validation(format!("unknown resource type '{}'", other))),
        }
    }
}

/// Role on a single resource. Ordered so that a stronger role implies the
/// weaker ones.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ResourceRole {
    Viewer,
    Member,
    Admin,
    Owner,
}

impl ResourceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceRole::Viewer => "viewer",
            ResourceRole::Member => "member",
            ResourceRole::Admin => "admin",
            ResourceRole::Owner => "owner",
        }
    }

    /// The minimum resource role an operation demands on the target VM (or
    /// its service/system ancestors).
    pub fn required_for(op: OperationType) -> ResourceRole {
        match op {
            OperationType::DeleteVm => ResourceRole::Admin,
            OperationType::CreateVm | OperationType::ModifyVm => ResourceRole::Member,
            OperationType::StartVm
            | OperationType::StopVm
            | OperationType::RestartVm
            | OperationType::VncAccess => ResourceRole::Member,
            OperationType::CreateSystem | OperationType::CreateService => ResourceRole::Admin,
        }
    }
}

impl FromStr for ResourceRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "viewer" => Ok(ResourceRole::Viewer),
            "member" => Ok(ResourceRole::Member),
            "admin" => Ok(ResourceRole::Admin),
            "owner" => Ok(ResourceRole::Owner),
            other => Err(Error::Validation(format!("unknown resource role '{}'", other))),
        }
    }
}

/// user ↔ (resource type, resource id) ↔ role binding.
///
/// Resolution walks the hierarchy upwards: a binding on the Service covers
/// its VMs, a binding on the System covers everything below it.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ResourceRoleBinding {
    pub id: Uuid,
    pub user_id: Uuid,
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
    pub role: ResourceRole,
    pub created_at: DateTime<Utc>,
}

/// The built-in role catalogue seeded at first boot.
///
/// Every set is explicit; nothing expands a wildcard at check time.
pub fn builtin_roles() -> Vec<(&'static str, BTreeSet<Permission>)> {
    use Permission::*;
    let all: BTreeSet<Permission> = [
        PlatformAdmin,
        VmCreate,
        VmModify,
        VmDelete,
        VmPower,
        VmConsole,
        VmRead,
        SystemCreate,
        ServiceCreate,
        ApprovalDecide,
        BatchSubmit,
        AuditRead,
        ClusterManage,
        NamespaceManage,
        TemplateManage,
        SizeManage,
        UserManage,
        RoleManage,
        ExemptionManage,
    ]
    .into();
    vec![
        // bootstrap exists only to force the password change on first login
        ("Bootstrap", all.clone()),
        ("PlatformAdmin", all),
        (
            "SystemAdmin",
            [
                VmCreate, VmModify, VmDelete, VmPower, VmConsole, VmRead, SystemCreate,
                ServiceCreate, BatchSubmit, AuditRead,
            ]
            .into(),
        ),
        ("Approver", [ApprovalDecide, VmRead, AuditRead].into()),
        (
            "Operator",
            [VmCreate, VmModify, VmPower, VmConsole, VmRead, BatchSubmit].into(),
        ),
        ("Viewer", [VmRead].into()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_roles_are_ordered() {
        assert!(ResourceRole::Owner > ResourceRole::Admin);
        assert!(ResourceRole::Admin > ResourceRole::Member);
        assert!(ResourceRole::Member > ResourceRole::Viewer);
        // an owner can do anything a member can
        assert!(ResourceRole::Owner >= ResourceRole::required_for(OperationType::DeleteVm));
        assert!(ResourceRole::Viewer < ResourceRole::required_for(OperationType::StartVm));
    }

    #[test]
    fn builtin_roles_have_no_wildcards_and_cover_admin() {
        let roles = builtin_roles();
        let names: Vec<_> = roles.iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec!["Bootstrap", "PlatformAdmin", "SystemAdmin", "Approver", "Operator", "Viewer"]
        );
        let admin = &roles[1].1;
        assert!(admin.contains(&Permission::PlatformAdmin));
        let viewer = &roles[5].1;
        assert_eq!(viewer.len(), 1);
        assert!(!viewer.contains(&Permission::PlatformAdmin));
    }

    #[test]
    fn operation_permission_mapping() {
        assert_eq!(
            Permission::for_operation(OperationType::CreateVm),
            Permission::VmCreate
        );
        assert_eq!(
            Permission::for_operation(OperationType::RestartVm),
            Permission::VmPower
        );
        assert_eq!(
            Permission::for_operation(OperationType::VncAccess),
            Permission::VmConsole
        );
    }
}
