//! roles / role_bindings / resource_role_bindings queries.

use std::collections::BTreeSet;

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgExecutor, Row};
use uuid::Uuid;

use shepherd_definitions::rbac::{
    BindingSource, Permission, ResourceRole, ResourceRoleBinding, ResourceType, Role, RoleBinding,
};
use shepherd_definitions::Environment;

use crate::Result;

fn map_role(row: &PgRow) -> Result<Role> {
    let perms: Vec<String> = row.try_get("permissions")?;
    Ok(Role {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        permissions: perms
            .iter()
            .filter_map(|p| p.parse::<Permission>().ok())
            .collect(),
        created_at: row.try_get("created_at")?,
    })
}

pub async fn insert_role(conn: &mut PgConnection, role: &Role) -> Result<()> {
    let perms: Vec<String> = role.permissions.iter().map(|p| p.as_str().into()).collect();
    sqlx::query("INSERT INTO roles (id, name, permissions, created_at) VALUES ($1,$2,$3,$4)")
        .bind(role.id)
        .bind(&role.name)
        .bind(&perms)
        .bind(role.created_at)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn get_role_by_name<'e, E: PgExecutor<'e>>(ex: E, name: &str) -> Result<Option<Role>> {
    let row = sqlx::query("SELECT id, name, permissions, created_at FROM roles WHERE name = $1")
        .bind(name)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(map_role).transpose()
}

pub async fn list_roles<'e, E: PgExecutor<'e>>(ex: E) -> Result<Vec<Role>> {
    let rows = sqlx::query("SELECT id, name, permissions, created_at FROM roles ORDER BY name")
        .fetch_all(ex)
        .await?;
    rows.iter().map(map_role).collect()
}

pub async fn insert_binding(conn: &mut PgConnection, b: &RoleBinding) -> Result<()> {
    let envs: Vec<String> = b
        .allowed_environments
        .iter()
        .map(|e| e.as_str().into())
        .collect();
    sqlx::query(
        r#"INSERT INTO role_bindings (id, user_id, role_id, allowed_environments, source, created_at)
           VALUES ($1,$2,$3,$4,$5,$6)"#,
    )
    .bind(b.id)
    .bind(b.user_id)
    .bind(b.role_id)
    .bind(&envs)
    .bind(b.source.as_str())
    .bind(b.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn delete_binding(conn: &mut PgConnection, id: Uuid) -> Result<bool> {
    let res = sqlx::query("DELETE FROM role_bindings WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Everything the actor resolution needs in one round trip: the union of
/// role permissions and allowed environments for a user.
pub async fn effective_grants<'e, E: PgExecutor<'e>>(
    ex: E,
    user_id: Uuid,
) -> Result<(BTreeSet<Permission>, BTreeSet<Environment>)> {
    let rows = sqlx::query(
        r#"SELECT r.permissions, b.allowed_environments
           FROM role_bindings b JOIN roles r ON r.id = b.role_id
           WHERE b.user_id = $1"#,
    )
    .bind(user_id)
    .fetch_all(ex)
    .await?;
    let mut permissions = BTreeSet::new();
    let mut environments = BTreeSet::new();
    for row in &rows {
        let perms: Vec<String> = row.try_get("permissions")?;
        let envs: Vec<String> = row.try_get("allowed_environments")?;
        permissions.extend(perms.iter().filter_map(|p| p.parse::<Permission>().ok()));
        environments.extend(envs.iter().filter_map(|e| e.parse::<Environment>().ok()));
    }
    Ok((permissions, environments))
}

pub async fn list_bindings_for_user<'e, E: PgExecutor<'e>>(
    ex: E,
    user_id: Uuid,
) -> Result<Vec<RoleBinding>> {
    let rows = sqlx::query(
        r#"SELECT id, user_id, role_id, allowed_environments, source, created_at
           FROM role_bindings WHERE user_id = $1"#,
    )
    .bind(user_id)
    .fetch_all(ex)
    .await?;
    rows.iter()
        .map(|row| {
            let envs: Vec<String> = row.try_get("allowed_environments")?;
            let source: String = row.try_get("source")?;
            Ok(RoleBinding {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                role_id: row.try_get("role_id")?,
                allowed_environments: envs
                    .iter()
                    .filter_map(|e| e.parse::<Environment>().ok())
                    .collect(),
                source: source.parse::<BindingSource>()?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

// ------------------------------------------------- resource role bindings

pub async fn insert_resource_binding(
    conn: &mut PgConnection,
    b: &ResourceRoleBinding,
) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO resource_role_bindings
           (id, user_id, resource_type, resource_id, role, created_at)
           VALUES ($1,$2,$3,$4,$5,$6)"#,
    )
    .bind(b.id)
    .bind(b.user_id)
    .bind(b.resource_type.as_str())
    .bind(b.resource_id)
    .bind(b.role.as_str())
    .bind(b.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn delete_resource_binding(conn: &mut PgConnection, id: Uuid) -> Result<bool> {
    let res = sqlx::query("DELETE FROM resource_role_bindings WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// The strongest role a user holds on any of the given (type, id) pairs.
/// The caller passes the whole ancestry (vm, its service, its system) so
/// inheritance is one query.
pub async fn strongest_role<'e, E: PgExecutor<'e>>(
    ex: E,
    user_id: Uuid,
    targets: &[(ResourceType, Uuid)],
) -> Result<Option<ResourceRole>> {
    if targets.is_empty() {
        return Ok(None);
    }
    let types: Vec<String> = targets.iter().map(|(t, _)| t.as_str().into()).collect();
    let ids: Vec<Uuid> = targets.iter().map(|(_, id)| *id).collect();
    let rows = sqlx::query(
        r#"SELECT role FROM resource_role_bindings
           WHERE user_id = $1
             AND (resource_type, resource_id) IN (
                 SELECT t, i FROM unnest($2::text[], $3::uuid[]) AS u(t, i))"#,
    )
    .bind(user_id)
    .bind(&types)
    .bind(&ids)
    .fetch_all(ex)
    .await?;
    let mut strongest: Option<ResourceRole> = None;
    for row in &rows {
        let role: String = row.try_get("role")?;
        if let Ok(r) = role.parse::<ResourceRole>() {
            strongest = Some(strongest.map_or(r, |s| s.max(r)));
        }
    }
    Ok(strongest)
}

pub async fn list_members<'e, E: PgExecutor<'e>>(
    ex: E,
    resource_type: ResourceType,
    resource_id: Uuid,
) -> Result<Vec<ResourceRoleBinding>> {
    let rows = sqlx::query(
        r#"SELECT id, user_id, resource_type, resource_id, role, created_at
           FROM resource_role_bindings
           WHERE resource_type = $1 AND resource_id = $2"#,
    )
    .bind(resource_type.as_str())
    .bind(resource_id)
    .fetch_all(ex)
    .await?;
    rows.iter()
        .map(|row| {
            let rt: String = row.try_get("resource_type")?;
            let role: String = row.try_get("role")?;
            Ok(ResourceRoleBinding {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                resource_type: rt.parse::<ResourceType>()?,
                resource_id: row.try_get("resource_id")?,
                role: role.parse::<ResourceRole>()?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

/// Users holding the approval permission; targets for approval-requested
/// notifications.
pub async fn users_with_permission<'e, E: PgExecutor<'e>>(
    ex: E,
    permission: Permission,
) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        r#"SELECT DISTINCT b.user_id
           FROM role_bindings b JOIN roles r ON r.id = b.role_id
           WHERE $1 = ANY(r.permissions)"#,
    )
    .bind(permission.as_str())
    .fetch_all(ex)
    .await?;
    rows.iter()
        .map(|row| Ok(row.try_get::<Uuid, _>("user_id")?))
        .collect()
}
