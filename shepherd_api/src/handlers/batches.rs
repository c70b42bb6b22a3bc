//! Batch endpoints.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use shepherd_core::batch::{self, BatchRequest};
use shepherd_core::db;
use shepherd_definitions::batch::BatchTicket;
use shepherd_definitions::vm::VmRequest;

use crate::auth::Authed;
use crate::errors::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct BatchBody {
    items: Vec<VmRequest>,
    #[serde(default)]
    idempotency_key: Option<String>,
}

fn batch_envelope(b: &BatchTicket) -> serde_json::Value {
    json!({
        "batch_id": b.id,
        "status": b.status,
        "child_count": b.child_count,
        "pending_count": b.pending_count,
        "success_count": b.success_count,
        "failed_count": b.failed_count,
        "links": {
            "self": format!("/v1/vms/batch/{}", b.id),
            "retry": format!("/v1/vms/batch/{}/retry", b.id),
            "cancel": format!("/v1/vms/batch/{}/cancel", b.id),
        }
    })
}

pub async fn submit(
    state: web::Data<AppState>,
    authed: Authed,
    body: web::Json<BatchBody>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();
    let parent = batch::submit_batch(
        &state.db,
        &authed.actor,
        &authed.context,
        BatchRequest {
            items: body.items,
            idempotency_key: body.idempotency_key,
        },
    )
    .await?;
    Ok(HttpResponse::Accepted().json(batch_envelope(&parent)))
}

pub async fn get(
    state: web::Data<AppState>,
    _authed: Authed,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let parent = batch::get_batch(&state.db, *path).await?;
    let children = db::tickets::children_of_batch(state.db.pool(), *path).await?;
    let mut body = batch_envelope(&parent);
    body["children"] = json!(children
        .iter()
        .map(|c| json!({
            "ticket_id": c.id,
            "sequence_no": c.sequence_no,
            "status": c.status,
            "namespace": c.namespace,
        }))
        .collect::<Vec<_>>());
    Ok(HttpResponse::Ok().json(body))
}

pub async fn retry(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let parent = batch::retry_batch(&state.db, &authed.actor, &authed.context, *path).await?;
    Ok(HttpResponse::Accepted().json(batch_envelope(&parent)))
}

pub async fn cancel(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let parent = batch::cancel_batch(&state.db, &authed.actor, &authed.context, *path).await?;
    Ok(HttpResponse::Ok().json(batch_envelope(&parent)))
}
