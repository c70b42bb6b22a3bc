//! Inbox endpoints. Everything is recipient-scoped to the caller.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use shepherd_core::db;
use shepherd_definitions::Error as DomainError;

use crate::auth::Authed;
use crate::errors::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct InboxQuery {
    #[serde(default)]
    unread_only: bool,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list(
    state: web::Data<AppState>,
    authed: Authed,
    query: web::Query<InboxQuery>,
) -> Result<HttpResponse, ApiError> {
    let rows = db::notifications::list_for(
        state.db.pool(),
        authed.actor.id,
        query.unread_only,
        query.limit.clamp(1, 200),
        query.offset.max(0),
    )
    .await?;
    Ok(HttpResponse::Ok().json(rows))
}

pub async fn unread_count(
    state: web::Data<AppState>,
    authed: Authed,
) -> Result<HttpResponse, ApiError> {
    let count = db::notifications::unread_count(state.db.pool(), authed.actor.id).await?;
    Ok(HttpResponse::Ok().json(json!({"unread": count})))
}

pub async fn mark_read(
    state: web::Data<AppState>,
    authed: Authed,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let id = *path;
    let actor_id = authed.actor.id;
    let marked = state
        .db
        .with_tx(move |conn| {
            Box::pin(async move { db::notifications::mark_read(conn, actor_id, id).await })
        })
        .await?;
    if !marked {
        return Err(DomainError::NotFound(format!("notification {}", id)).into());
    }
    Ok(HttpResponse::NoContent().finish())
}

pub async fn mark_all_read(
    state: web::Data<AppState>,
    authed: Authed,
) -> Result<HttpResponse, ApiError> {
    let actor_id = authed.actor.id;
    let marked = state
        .db
        .with_tx(move |conn| {
            Box::pin(async move { db::notifications::mark_all_read(conn, actor_id).await })
        })
        .await?;
    Ok(HttpResponse::Ok().json(json!({"marked": marked})))
}
