//! Route handlers, grouped by surface.

pub mod admin;
pub mod approvals;
pub mod auth;
pub mod batches;
pub mod notifications;
pub mod vms;

use actix_web::HttpResponse;
use serde_json::json;

use shepherd_definitions::ticket::ApprovalTicket;

/// Liveness; excluded from request logging.
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json("healthy")
}

/// The 202 envelope every change endpoint answers with.
pub(crate) fn accepted(ticket: &ApprovalTicket) -> HttpResponse {
    HttpResponse::Accepted().json(json!({
        "ticket_id": ticket.id,
        "status": ticket.status,
        "links": {
            "self": format!("/v1/approvals/{}", ticket.id),
            "cancel": format!("/v1/approvals/{}/cancel", ticket.id),
        }
    }))
}
