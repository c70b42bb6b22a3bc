//! Approval queue endpoints.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use shepherd_core::governance::{self, ApproveOptions};
use shepherd_core::db;
use shepherd_definitions::rbac::Permission;
use shepherd_definitions::ticket::TicketStatus;
use shepherd_definitions::Error as DomainError;

use crate::auth::Authed;
use crate::errors::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list_pending(
    state: web::Data<AppState>,
    authed: Authed,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, ApiError> {
    authed.actor.require(Permission::ApprovalDecide)?;
    let tickets = db::tickets::list_by_status(
        state.db.pool(),
        TicketStatus::PendingApproval,
        query.limit.clamp(1, 200),
        query.offset.max(0),
    )
    .await?;
    Ok(HttpResponse::Ok().json(tickets))
}

pub async fn get(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let ticket = db::tickets::get(state.db.pool(), *path)
        .await?
        .ok_or_else(|| DomainError::NotFound(format!("ticket {}", path)))?;
    let allowed = ticket.requester == authed.actor.id
        || authed.actor.has(Permission::ApprovalDecide)
        || authed.actor.has(Permission::AuditRead);
    if !allowed {
        return Err(DomainError::Forbidden("not your ticket".into()).into());
    }
    Ok(HttpResponse::Ok().json(ticket))
}

#[derive(Deserialize, Default)]
pub struct ApproveBody {
    #[serde(default)]
    modified_spec: Option<Value>,
    #[serde(default)]
    modification_reason: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    selected_cluster_id: Option<Uuid>,
    #[serde(default)]
    selected_storage_class: Option<String>,
}

pub async fn approve(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
    body: Option<web::Json<ApproveBody>>,
) -> Result<HttpResponse, ApiError> {
    let body = body.map(|b| b.into_inner()).unwrap_or_default();
    let ticket = governance::approve(
        &state.db,
        &authed.actor,
        &authed.context,
        *path,
        ApproveOptions {
            modified_spec: body.modified_spec,
            modification_reason: body.modification_reason,
            decision_reason: body.reason,
            selected_cluster_id: body.selected_cluster_id,
            selected_storage_class: body.selected_storage_class,
        },
    )
    .await?;
    Ok(HttpResponse::Ok().json(ticket))
}

#[derive(Deserialize)]
pub struct RejectBody {
    reason: String,
}

pub async fn reject(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
    body: web::Json<RejectBody>,
) -> Result<HttpResponse, ApiError> {
    let ticket =
        governance::reject(&state.db, &authed.actor, &authed.context, *path, &body.reason).await?;
    Ok(HttpResponse::Ok().json(ticket))
}

pub async fn cancel(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let ticket = governance::cancel(&state.db, &authed.actor, &authed.context, *path).await?;
    Ok(HttpResponse::Ok().json(ticket))
}
