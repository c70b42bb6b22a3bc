//! VM read and change endpoints.
//!
//! Reads come from the watcher cache and are tagged with its freshness;
//! changes go through the governance core and answer 202.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use shepherd_core::{db, governance};
use shepherd_definitions::ticket::{OperationType, TicketStatus};
use shepherd_definitions::vm::{PowerAction, VmRecord, VmRequest};
use shepherd_definitions::{Environment, Error as DomainError};

use crate::auth::Authed;
use crate::errors::ApiError;
use crate::handlers::accepted;
use crate::state::AppState;

pub async fn request_create(
    state: web::Data<AppState>,
    authed: Authed,
    body: web::Json<VmRequest>,
) -> Result<HttpResponse, ApiError> {
    let ticket = governance::submit_vm_create(
        &state.db,
        &authed.actor,
        &authed.context,
        body.into_inner(),
    )
    .await?;
    Ok(accepted(&ticket))
}

#[derive(Deserialize)]
pub struct ListQuery {
    namespace: Option<String>,
    service_id: Option<Uuid>,
}

/// Cached list across clusters, joined with the governance records.
pub async fn list(
    state: web::Data<AppState>,
    _authed: Authed,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse, ApiError> {
    let records = db::hierarchy::list_vms(state.db.pool(), query.service_id).await?;
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        if let Some(ns) = &query.namespace {
            if &record.namespace != ns {
                continue;
            }
        }
        out.push(vm_view(&state, &record));
    }
    Ok(HttpResponse::Ok().json(out))
}

pub async fn get(
    state: web::Data<AppState>,
    _authed: Authed,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let record = load_vm(&state, *path).await?;
    Ok(HttpResponse::Ok().json(vm_view(&state, &record)))
}

fn vm_view(state: &AppState, record: &VmRecord) -> Value {
    let cached = record
        .cluster_id
        .and_then(|cid| state.registry.cache(cid))
        .and_then(|cache| cache.get(&record.namespace, &record.name));
    let cache_status = record.cluster_id.and_then(|cid| state.cache_status(cid));
    json!({
        "id": record.id,
        "name": record.name,
        "namespace": record.namespace,
        "service_id": record.service_id,
        "cluster_id": record.cluster_id,
        "power_state": cached.as_ref().and_then(|vm| vm.power_state.clone()),
        "ready": cached.as_ref().map(|vm| vm.ready).unwrap_or(false),
        "cache_status": cache_status,
    })
}

async fn load_vm(state: &AppState, id: Uuid) -> Result<VmRecord, ApiError> {
    db::hierarchy::get_vm(state.db.pool(), id)
        .await?
        .ok_or_else(|| DomainError::NotFound(format!("vm {}", id)).into())
}

async fn submit_power(
    state: web::Data<AppState>,
    authed: Authed,
    id: Uuid,
    action: PowerAction,
) -> Result<HttpResponse, ApiError> {
    let vm = load_vm(&state, id).await?;
    let ticket = governance::submit_vm_operation(
        &state.db,
        &authed.actor,
        &authed.context,
        action.operation(),
        &vm,
        json!({"action": action.as_str()}),
    )
    .await?;
    Ok(accepted(&ticket))
}

pub async fn start(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    submit_power(state, authed, *path, PowerAction::Start).await
}

pub async fn stop(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    submit_power(state, authed, *path, PowerAction::Stop).await
}

pub async fn restart(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    submit_power(state, authed, *path, PowerAction::Restart).await
}

#[derive(Deserialize, Default)]
pub struct DeleteQuery {
    #[serde(default)]
    confirm: bool,
}

#[derive(Deserialize, Default)]
pub struct DeleteBody {
    confirm_name: Option<String>,
}

/// Tiered delete confirmation: test wants `?confirm=true`, prod wants the
/// exact VM name typed back in the body.
pub async fn request_delete(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
    query: web::Query<DeleteQuery>,
    body: Option<web::Json<DeleteBody>>,
) -> Result<HttpResponse, ApiError> {
    let vm = load_vm(&state, *path).await?;
    let namespace = db::namespaces::get_by_name(state.db.pool(), &vm.namespace)
        .await?
        .ok_or_else(|| DomainError::NotFound(format!("namespace '{}'", vm.namespace)))?;

    match namespace.environment {
        Environment::Test => {
            if !query.confirm {
                return Err(DomainError::PreconditionFailed(
                    "deletion requires ?confirm=true".into(),
                )
                .into());
            }
        }
        Environment::Prod => {
            let confirmed = body
                .as_ref()
                .and_then(|b| b.confirm_name.as_deref())
                .map(|name| name == vm.name)
                .unwrap_or(false);
            if !confirmed {
                return Err(DomainError::PreconditionFailed(
                    "deletion requires confirm_name matching the vm name exactly".into(),
                )
                .into());
            }
        }
    }

    let ticket = governance::submit_vm_operation(
        &state.db,
        &authed.actor,
        &authed.context,
        OperationType::DeleteVm,
        &vm,
        json!({}),
    )
    .await?;
    Ok(accepted(&ticket))
}

/// The cluster a pre-approval dry run would target: any healthy
/// test-environment cluster, or 204 when none qualifies.
pub async fn preview_cluster(
    state: web::Data<AppState>,
    _authed: Authed,
) -> Result<HttpResponse, ApiError> {
    match governance::preview_cluster(&state.db).await? {
        Some(cluster) => Ok(HttpResponse::Ok().json(json!({
            "cluster_id": cluster.id,
            "name": cluster.name,
            "environment": cluster.environment,
        }))),
        None => Ok(HttpResponse::NoContent().finish()),
    }
}

pub async fn request_console(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let vm = load_vm(&state, *path).await?;
    let ticket = governance::submit_vm_operation(
        &state.db,
        &authed.actor,
        &authed.context,
        OperationType::VncAccess,
        &vm,
        json!({}),
    )
    .await?;
    Ok(accepted(&ticket))
}

/// Exchange an approved console ticket for a short-lived stream token.
///
/// The path is re-derived from the live provider, which doubles as a
/// check that the instance is still running.
pub async fn console_token(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let ticket = db::tickets::get(state.db.pool(), *path)
        .await?
        .ok_or_else(|| DomainError::NotFound(format!("ticket {}", path)))?;
    if ticket.requester != authed.actor.id && !authed.actor.is_platform_admin() {
        return Err(DomainError::Forbidden("not your console ticket".into()).into());
    }
    if ticket.operation != OperationType::VncAccess {
        return Err(DomainError::Validation("not a console ticket".into()).into());
    }
    if ticket.status != TicketStatus::Success {
        return Err(DomainError::Conflict(format!(
            "console ticket is {}, not SUCCESS",
            ticket.status
        ))
        .into());
    }

    let cluster_id = ticket
        .selected_cluster_id
        .or_else(|| {
            ticket
                .payload
                .get("cluster_id")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
        })
        .ok_or_else(|| DomainError::Internal("console ticket lacks a cluster".into()))?;
    let provider = state
        .registry
        .provider(cluster_id)
        .ok_or_else(|| DomainError::ServiceUnavailable("cluster not connected".into()))?;
    let console = provider
        .console()
        .ok_or_else(|| DomainError::ServiceUnavailable("no console capability".into()))?;
    let vm_name = ticket
        .payload
        .get("vm_name")
        .and_then(Value::as_str)
        .ok_or_else(|| DomainError::Internal("console ticket lacks vm_name".into()))?;
    let console_path = console.vnc_path(&ticket.namespace, vm_name).await?;
    let token = state.jwt.issue_console(authed.actor.id, &console_path)?;
    Ok(HttpResponse::Ok().json(json!({
        "token": token,
        "expires_in": crate::auth::CONSOLE_TOKEN_TTL_SECS,
    })))
}
