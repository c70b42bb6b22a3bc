//! Actor resolution and permission checks.
//!
//! The actor is resolved once per request from the user row and the union
//! of its role bindings. `platform:admin` is a single explicit bit that
//! short-circuits checks; nothing here expands wildcards.

use std::collections::BTreeSet;

use sqlx::PgPool;
use uuid::Uuid;

use shepherd_definitions::rbac::{Permission, ResourceRole, ResourceType};
use shepherd_definitions::ticket::OperationType;
use shepherd_definitions::{Environment, Error as DomainError};

use crate::{db, Result};

/// A resolved caller identity with its effective grants.
#[derive(Clone, Debug)]
pub struct Actor {
    pub id: Uuid,
    pub username: String,
    pub permissions: BTreeSet<Permission>,
    pub allowed_environments: BTreeSet<Environment>,
}

impl Actor {
    pub fn is_platform_admin(&self) -> bool {
        self.permissions.contains(&Permission::PlatformAdmin)
    }

    pub fn has(&self, p: Permission) -> bool {
        self.is_platform_admin() || self.permissions.contains(&p)
    }

    pub fn require(&self, p: Permission) -> Result<()> {
        if self.has(p) {
            Ok(())
        } else {
            Err(DomainError::Forbidden(format!("requires permission {}", p)).into())
        }
    }

    /// Environment gate from the global role binding.
    pub fn require_environment(&self, env: Environment) -> Result<()> {
        if self.is_platform_admin() || self.allowed_environments.contains(&env) {
            Ok(())
        } else {
            Err(DomainError::Forbidden(format!("not allowed to operate in {}", env)).into())
        }
    }

    pub fn require_operation(&self, op: OperationType, env: Environment) -> Result<()> {
        self.require(Permission::for_operation(op))?;
        self.require_environment(env)
    }

    /// Test-only constructor used across the flow tests.
    pub fn synthetic(
        username: &str,
        permissions: impl IntoIterator<Item = Permission>,
        environments: impl IntoIterator<Item = Environment>,
    ) -> Actor {
        Actor {
            id: Uuid::new_v4(),
            username: username.into(),
            permissions: permissions.into_iter().collect(),
            allowed_environments: environments.into_iter().collect(),
        }
    }
}

/// Resolve a caller. Disabled users resolve to Unauthorized so a revoked
/// account dies at the boundary even with a still-valid token.
pub async fn load_actor(pool: &PgPool, user_id: Uuid) -> Result<Actor> {
    let user = db::users::get(pool, user_id)
        .await?
        .ok_or(DomainError::Unauthorized)?;
    if user.disabled {
        return Err(DomainError::Unauthorized.into());
    }
    let (permissions, allowed_environments) = db::rbac::effective_grants(pool, user_id).await?;
    Ok(Actor {
        id: user.id,
        username: user.username,
        permissions,
        allowed_environments,
    })
}

/// Resource-scoped check: walk the hierarchy from the service upwards and
/// take the strongest role found. Platform admins bypass.
pub async fn require_resource_role(
    pool: &PgPool,
    actor: &Actor,
    service_id: Uuid,
    vm_id: Option<Uuid>,
    required: ResourceRole,
) -> Result<()> {
    if actor.is_platform_admin() {
        return Ok(());
    }
    let service = db::hierarchy::get_service(pool, service_id)
        .await?
        .ok_or_else(|| DomainError::NotFound(format!("service {}", service_id)))?;
    let mut targets = vec![
        (ResourceType::Service, service_id),
        (ResourceType::System, service.system_id),
    ];
    if let Some(vm) = vm_id {
        targets.push((ResourceType::Vm, vm));
    }
    let strongest = db::rbac::strongest_role(pool, actor.id, &targets).await?;
    match strongest {
        Some(role) if role >= required => Ok(()),
        _ => Err(DomainError::Forbidden(format!(
            "requires {} role on the target service or its system",
            required.as_str()
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_admin_short_circuits() {
        let admin = Actor::synthetic("root", [Permission::PlatformAdmin], []);
        assert!(admin.has(Permission::VmDelete));
        assert!(admin.require_environment(Environment::Prod).is_ok());
    }

    #[test]
    fn environment_gate_applies_to_mortals() {
        let op = Actor::synthetic(
            "alice",
            [Permission::VmCreate],
            [Environment::Prod],
        );
        assert!(op.require_operation(OperationType::CreateVm, Environment::Prod).is_ok());
        assert!(op.require_operation(OperationType::CreateVm, Environment::Test).is_err());
        assert!(op.require_operation(OperationType::DeleteVm, Environment::Prod).is_err());
    }
}
