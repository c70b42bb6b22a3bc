//! Admin CRUD surfaces: clusters, namespaces, templates, sizes, users,
//! roles, members, exemptions, dead-letter triage and adoptions.
//!
//! Each write goes through a transaction with its audit row; nothing here
//! mutates without leaving a trace.

use std::str::FromStr;

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use shepherd_core::audit::{append, Audit};
use shepherd_core::{db, governance, queue, users as core_users};
use shepherd_definitions::adoption::AdoptionStatus;
use shepherd_definitions::audit::AuditAction;
use shepherd_definitions::cluster::{Cluster, ClusterHealth};
use shepherd_definitions::instance_size::{Capability, InstanceSize};
use shepherd_definitions::rbac::{
    BindingSource, Permission, ResourceRole, ResourceRoleBinding, ResourceType, RoleBinding,
};
use shepherd_definitions::template::{Template, TemplateStatus};
use shepherd_definitions::{Environment, Error as DomainError, NamespaceRecord};

use crate::auth::Authed;
use crate::errors::ApiError;
use crate::state::AppState;

// ---------------------------------------------------------------- systems

#[derive(Deserialize)]
pub struct SystemBody {
    name: String,
    #[serde(default)]
    description: String,
}

pub async fn create_system(
    state: web::Data<AppState>,
    authed: Authed,
    body: web::Json<SystemBody>,
) -> Result<HttpResponse, ApiError> {
    let system = governance::create_system(
        &state.db,
        &authed.actor,
        &authed.context,
        &body.name,
        &body.description,
    )
    .await?;
    Ok(HttpResponse::Created().json(system))
}

pub async fn list_systems(
    state: web::Data<AppState>,
    _authed: Authed,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(db::hierarchy::list_systems(state.db.pool()).await?))
}

#[derive(Deserialize)]
pub struct ServiceBody {
    system_id: Uuid,
    name: String,
    #[serde(default)]
    description: String,
}

pub async fn create_service(
    state: web::Data<AppState>,
    authed: Authed,
    body: web::Json<ServiceBody>,
) -> Result<HttpResponse, ApiError> {
    let service = governance::create_service(
        &state.db,
        &authed.actor,
        &authed.context,
        body.system_id,
        &body.name,
        &body.description,
    )
    .await?;
    Ok(HttpResponse::Created().json(service))
}

// ------------------------------------------------------------- audit logs

#[derive(Deserialize)]
pub struct AuditQuery {
    actor_id: Option<Uuid>,
    resource_type: Option<String>,
    resource_id: Option<Uuid>,
    since: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn audit_logs(
    state: web::Data<AppState>,
    authed: Authed,
    query: web::Query<AuditQuery>,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::AuditRead)?;
    let resource = match (&query.resource_type, query.resource_id) {
        (Some(t), Some(id)) => Some((ResourceType::from_str(t)?, id)),
        _ => None,
    };
    let rows = db::audit::list(
        state.db.pool(),
        query.actor_id,
        resource,
        query.since,
        query.limit.clamp(1, 500),
        query.offset.max(0),
    )
    .await?;
    Ok(HttpResponse::Ok().json(rows))
}

// ---------------------------------------------------------------- clusters

#[derive(Deserialize)]
pub struct ClusterBody {
    name: String,
    api_url: String,
    /// Raw kubeconfig; sealed before it reaches a row
    kubeconfig: String,
    environment: Environment,
}

pub async fn create_cluster(
    state: web::Data<AppState>,
    authed: Authed,
    body: web::Json<ClusterBody>,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::ClusterManage)?;
    let sealed = state.secrets.seal(body.kubeconfig.as_bytes())?;
    let now = Utc::now();
    let cluster = Cluster {
        id: Uuid::new_v4(),
        name: body.name.clone(),
        api_url: body.api_url.clone(),
        credentials: sealed,
        environment: body.environment,
        health: ClusterHealth::Unknown,
        kubevirt_version: None,
        enabled_features: Default::default(),
        storage_classes: vec![],
        default_storage_class: None,
        last_probed_at: None,
        last_detected_at: None,
        created_at: now,
        updated_at: now,
    };
    let created = cluster.clone();
    let actor = authed.actor.clone();
    let ctx = authed.context.clone();
    state
        .db
        .with_tx(move |conn| {
            let cluster = cluster.clone();
            let actor = actor.clone();
            let ctx = ctx.clone();
            Box::pin(async move {
                db::clusters::insert(conn, &cluster).await?;
                append(
                    conn,
                    Audit::new(AuditAction::ClusterCreated, actor.id)
                        .environment(cluster.environment)
                        .details(json!({
                            "cluster_id": cluster.id,
                            "name": cluster.name,
                            "api_url": cluster.api_url,
                            // named so redaction strips it even if a caller
                            // ever widens this blob
                            "kubeconfig": "present",
                        }))
                        .context(&ctx),
                )
                .await?;
                Ok(())
            })
        })
        .await?;
    Ok(HttpResponse::Created().json(created))
}

pub async fn list_clusters(
    state: web::Data<AppState>,
    authed: Authed,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::ClusterManage)?;
    Ok(HttpResponse::Ok().json(db::clusters::list(state.db.pool()).await?))
}

pub async fn delete_cluster(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::ClusterManage)?;
    let id = *path;
    let actor = authed.actor.clone();
    let ctx = authed.context.clone();
    state
        .db
        .with_tx(move |conn| {
            let actor = actor.clone();
            let ctx = ctx.clone();
            Box::pin(async move {
                if !db::clusters::delete(conn, id).await? {
                    return Err(DomainError::NotFound(format!("cluster {}", id)).into());
                }
                append(
                    conn,
                    Audit::new(AuditAction::ClusterDeleted, actor.id)
                        .details(json!({"cluster_id": id}))
                        .context(&ctx),
                )
                .await?;
                Ok(())
            })
        })
        .await?;
    state.registry.deregister(id);
    Ok(HttpResponse::NoContent().finish())
}

// -------------------------------------------------------------- namespaces

#[derive(Deserialize)]
pub struct NamespaceBody {
    name: String,
    environment: Environment,
    #[serde(default)]
    description: String,
}

pub async fn create_namespace(
    state: web::Data<AppState>,
    authed: Authed,
    body: web::Json<NamespaceBody>,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::NamespaceManage)?;
    NamespaceRecord::validate_name(&body.name)?;
    let record = NamespaceRecord {
        id: Uuid::new_v4(),
        name: body.name.clone(),
        environment: body.environment,
        description: body.description.clone(),
        created_at: Utc::now(),
    };
    let created = record.clone();
    let actor = authed.actor.clone();
    let ctx = authed.context.clone();
    state
        .db
        .with_tx(move |conn| {
            let record = record.clone();
            let actor = actor.clone();
            let ctx = ctx.clone();
            Box::pin(async move {
                db::namespaces::insert(conn, &record).await?;
                append(
                    conn,
                    Audit::new(AuditAction::NamespaceCreated, actor.id)
                        .environment(record.environment)
                        .details(json!({"name": record.name}))
                        .context(&ctx),
                )
                .await?;
                Ok(())
            })
        })
        .await?;
    Ok(HttpResponse::Created().json(created))
}

pub async fn list_namespaces(
    state: web::Data<AppState>,
    _authed: Authed,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(db::namespaces::list(state.db.pool()).await?))
}

// --------------------------------------------------------------- templates

#[derive(Deserialize)]
pub struct TemplateBody {
    name: String,
    version: String,
    content: Value,
    #[serde(default)]
    os_image: Option<String>,
    #[serde(default)]
    cloud_init: Option<String>,
}

pub async fn create_template(
    state: web::Data<AppState>,
    authed: Authed,
    body: web::Json<TemplateBody>,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::TemplateManage)?;
    let now = Utc::now();
    let template = Template {
        id: Uuid::new_v4(),
        name: body.name.clone(),
        version: body.version.clone(),
        status: TemplateStatus::Draft,
        content: body.content.clone(),
        os_image: body.os_image.clone(),
        cloud_init: body.cloud_init.clone(),
        created_at: now,
        updated_at: now,
    };
    let created = template.clone();
    state
        .db
        .with_tx(move |conn| {
            let template = template.clone();
            Box::pin(async move { db::templates::insert(conn, &template).await })
        })
        .await?;
    Ok(HttpResponse::Created().json(created))
}

pub async fn list_templates(
    state: web::Data<AppState>,
    _authed: Authed,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(db::templates::list(state.db.pool()).await?))
}

pub async fn publish_template(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::TemplateManage)?;
    let id = *path;
    let actor = authed.actor.clone();
    let ctx = authed.context.clone();
    state
        .db
        .with_tx(move |conn| {
            let actor = actor.clone();
            let ctx = ctx.clone();
            Box::pin(async move {
                if !db::templates::publish(conn, id).await? {
                    return Err(DomainError::Conflict(
                        "only draft templates can be published".into(),
                    )
                    .into());
                }
                append(
                    conn,
                    Audit::new(AuditAction::TemplatePublished, actor.id)
                        .details(json!({"template_id": id}))
                        .context(&ctx),
                )
                .await?;
                Ok(())
            })
        })
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn archive_template(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::TemplateManage)?;
    let id = *path;
    let actor = authed.actor.clone();
    let ctx = authed.context.clone();
    state
        .db
        .with_tx(move |conn| {
            let actor = actor.clone();
            let ctx = ctx.clone();
            Box::pin(async move {
                if !db::templates::archive(conn, id).await? {
                    return Err(DomainError::NotFound(format!("template {}", id)).into());
                }
                append(
                    conn,
                    Audit::new(AuditAction::TemplateArchived, actor.id)
                        .details(json!({"template_id": id}))
                        .context(&ctx),
                )
                .await?;
                Ok(())
            })
        })
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

// ------------------------------------------------------------------ sizes

#[derive(Deserialize)]
pub struct SizeBody {
    name: String,
    cpu: i32,
    memory_mi: i64,
    disk_gi: i64,
    #[serde(default)]
    required_capabilities: Vec<Capability>,
    #[serde(default)]
    spec_overrides: std::collections::BTreeMap<String, Value>,
}

pub async fn create_size(
    state: web::Data<AppState>,
    authed: Authed,
    body: web::Json<SizeBody>,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::SizeManage)?;
    let now = Utc::now();
    let size = InstanceSize {
        id: Uuid::new_v4(),
        name: body.name.clone(),
        cpu: body.cpu,
        memory_mi: body.memory_mi,
        disk_gi: body.disk_gi,
        required_capabilities: body.required_capabilities.iter().copied().collect(),
        spec_overrides: body.spec_overrides.clone(),
        created_at: now,
        updated_at: now,
    };
    size.validate_overrides()?;
    let created = size.clone();
    let actor = authed.actor.clone();
    let ctx = authed.context.clone();
    state
        .db
        .with_tx(move |conn| {
            let size = size.clone();
            let actor = actor.clone();
            let ctx = ctx.clone();
            Box::pin(async move {
                db::sizes::insert(conn, &size).await?;
                append(
                    conn,
                    Audit::new(AuditAction::SizeCreated, actor.id)
                        .details(json!({"size_id": size.id, "name": size.name}))
                        .context(&ctx),
                )
                .await?;
                Ok(())
            })
        })
        .await?;
    Ok(HttpResponse::Created().json(created))
}

pub async fn list_sizes(
    state: web::Data<AppState>,
    _authed: Authed,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(db::sizes::list(state.db.pool()).await?))
}

// ------------------------------------------------------------------ users

#[derive(Deserialize)]
pub struct UserBody {
    username: String,
    password: String,
    #[serde(default = "default_true")]
    force_password_change: bool,
}

fn default_true() -> bool {
    true
}

pub async fn create_user(
    state: web::Data<AppState>,
    authed: Authed,
    body: web::Json<UserBody>,
) -> Result<HttpResponse, ApiError> {
    let user = core_users::create_user(
        &state.db,
        &authed.actor,
        &authed.context,
        &body.username,
        &body.password,
        body.force_password_change,
    )
    .await?;
    Ok(HttpResponse::Created().json(user))
}

pub async fn list_users(
    state: web::Data<AppState>,
    authed: Authed,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::UserManage)?;
    Ok(HttpResponse::Ok().json(db::users::list(state.db.pool()).await?))
}

pub async fn disable_user(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    core_users::disable_user(&state.db, &authed.actor, &authed.context, *path).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ------------------------------------------------------------------ roles

pub async fn list_roles(
    state: web::Data<AppState>,
    authed: Authed,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::RoleManage)?;
    Ok(HttpResponse::Ok().json(db::rbac::list_roles(state.db.pool()).await?))
}

#[derive(Deserialize)]
pub struct BindRoleBody {
    user_id: Uuid,
    role_id: Uuid,
    allowed_environments: Vec<Environment>,
}

pub async fn bind_role(
    state: web::Data<AppState>,
    authed: Authed,
    body: web::Json<BindRoleBody>,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::RoleManage)?;
    let binding = RoleBinding {
        id: Uuid::new_v4(),
        user_id: body.user_id,
        role_id: body.role_id,
        allowed_environments: body.allowed_environments.iter().copied().collect(),
        source: BindingSource::Local,
        created_at: Utc::now(),
    };
    let created = binding.clone();
    let actor = authed.actor.clone();
    let ctx = authed.context.clone();
    state
        .db
        .with_tx(move |conn| {
            let binding = binding.clone();
            let actor = actor.clone();
            let ctx = ctx.clone();
            Box::pin(async move {
                db::rbac::insert_binding(conn, &binding).await?;
                append(
                    conn,
                    Audit::new(AuditAction::RoleBound, actor.id)
                        .details(json!({
                            "user_id": binding.user_id,
                            "role_id": binding.role_id,
                        }))
                        .context(&ctx),
                )
                .await?;
                Ok(())
            })
        })
        .await?;
    Ok(HttpResponse::Created().json(created))
}

// ---------------------------------------------------------------- members

#[derive(Deserialize)]
pub struct MemberBody {
    user_id: Uuid,
    resource_type: ResourceType,
    resource_id: Uuid,
    role: ResourceRole,
}

pub async fn add_member(
    state: web::Data<AppState>,
    authed: Authed,
    body: web::Json<MemberBody>,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::RoleManage)?;
    let binding = ResourceRoleBinding {
        id: Uuid::new_v4(),
        user_id: body.user_id,
        resource_type: body.resource_type,
        resource_id: body.resource_id,
        role: body.role,
        created_at: Utc::now(),
    };
    let created = binding.clone();
    let actor = authed.actor.clone();
    let ctx = authed.context.clone();
    state
        .db
        .with_tx(move |conn| {
            let binding = binding.clone();
            let actor = actor.clone();
            let ctx = ctx.clone();
            Box::pin(async move {
                db::rbac::insert_resource_binding(conn, &binding).await?;
                append(
                    conn,
                    Audit::new(AuditAction::MemberAdded, actor.id)
                        .resource(binding.resource_type, binding.resource_id, "")
                        .details(json!({
                            "user_id": binding.user_id,
                            "role": binding.role,
                        }))
                        .context(&ctx),
                )
                .await?;
                Ok(())
            })
        })
        .await?;
    Ok(HttpResponse::Created().json(created))
}

// -------------------------------------------------------------- exemptions

#[derive(Deserialize)]
pub struct ExemptionBody {
    user_id: Uuid,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    reason: String,
}

pub async fn grant_exemption(
    state: web::Data<AppState>,
    authed: Authed,
    body: web::Json<ExemptionBody>,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::ExemptionManage)?;
    let body = body.into_inner();
    let actor = authed.actor.clone();
    let ctx = authed.context.clone();
    state
        .db
        .with_tx(move |conn| {
            let reason = body.reason.clone();
            let actor = actor.clone();
            let ctx = ctx.clone();
            Box::pin(async move {
                db::ratelimits::grant_exemption(conn, body.user_id, body.expires_at, &reason)
                    .await?;
                append(
                    conn,
                    Audit::new(AuditAction::ExemptionGranted, actor.id)
                        .details(json!({
                            "user_id": body.user_id,
                            "expires_at": body.expires_at,
                            "reason": reason,
                        }))
                        .context(&ctx),
                )
                .await?;
                Ok(())
            })
        })
        .await?;
    Ok(HttpResponse::Created().finish())
}

pub async fn list_exemptions(
    state: web::Data<AppState>,
    authed: Authed,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::ExemptionManage)?;
    let rows = db::ratelimits::list_exemptions(state.db.pool()).await?;
    let body: Vec<Value> = rows
        .into_iter()
        .map(|(user_id, expires_at, reason)| {
            json!({"user_id": user_id, "expires_at": expires_at, "reason": reason})
        })
        .collect();
    Ok(HttpResponse::Ok().json(body))
}

pub async fn revoke_exemption(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::ExemptionManage)?;
    let user_id = *path;
    let actor = authed.actor.clone();
    let ctx = authed.context.clone();
    state
        .db
        .with_tx(move |conn| {
            let actor = actor.clone();
            let ctx = ctx.clone();
            Box::pin(async move {
                if !db::ratelimits::revoke_exemption(conn, user_id).await? {
                    return Err(DomainError::NotFound(format!("exemption for {}", user_id)).into());
                }
                append(
                    conn,
                    Audit::new(AuditAction::ExemptionRevoked, actor.id)
                        .details(json!({"user_id": user_id}))
                        .context(&ctx),
                )
                .await?;
                Ok(())
            })
        })
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

// ------------------------------------------------------------- dead letter

/// Dead-letter triage is PlatformAdmin only, by policy.
pub async fn requeue_job(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    if !authed.actor.is_platform_admin() {
        return Err(DomainError::Forbidden("dead-letter requeue is platform:admin only".into()).into());
    }
    let id = *path;
    let actor = authed.actor.clone();
    let ctx = authed.context.clone();
    state
        .db
        .with_tx(move |conn| {
            let actor = actor.clone();
            let ctx = ctx.clone();
            Box::pin(async move {
                queue::requeue_discarded(conn, id).await?;
                append(
                    conn,
                    Audit::new(AuditAction::JobRequeued, actor.id)
                        .details(json!({"job_id": id}))
                        .context(&ctx),
                )
                .await?;
                Ok(())
            })
        })
        .await?;
    Ok(HttpResponse::Accepted().finish())
}

// --------------------------------------------------------------- adoptions

pub async fn list_adoptions(
    state: web::Data<AppState>,
    authed: Authed,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::ClusterManage)?;
    Ok(HttpResponse::Ok().json(db::adoptions::list_pending(state.db.pool()).await?))
}

#[derive(Deserialize)]
pub struct ResolveBody {
    /// "adopt" or "ignore"
    resolution: String,
}

pub async fn resolve_adoption(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
    body: web::Json<ResolveBody>,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::ClusterManage)?;
    let status = match body.resolution.as_str() {
        "adopt" => AdoptionStatus::Adopted,
        "ignore" => AdoptionStatus::Ignored,
        other => {
            return Err(DomainError::Validation(format!(
                "resolution must be adopt or ignore, got '{}'",
                other
            ))
            .into())
        }
    };
    let id = *path;
    let actor = authed.actor.clone();
    let ctx = authed.context.clone();
    state
        .db
        .with_tx(move |conn| {
            let actor = actor.clone();
            let ctx = ctx.clone();
            Box::pin(async move {
                if !db::adoptions::resolve(conn, id, status).await? {
                    return Err(DomainError::Conflict("adoption already resolved".into()).into());
                }
                append(
                    conn,
                    Audit::new(AuditAction::AdoptionResolved, actor.id)
                        .details(json!({"adoption_id": id, "resolution": status}))
                        .context(&ctx),
                )
                .await?;
                Ok(())
            })
        })
        .await?;
    Ok(HttpResponse::NoContent().finish())
}
