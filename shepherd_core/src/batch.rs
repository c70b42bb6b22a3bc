//! Batch coordinator: parent/child submission, aggregation, retry and
//! cancel.
//!
//! Children are ordinary tickets; nothing rolls back a sibling when one
//! fails. The parent is pure bookkeeping, updated inside each child's
//! terminal transaction so the counters always sum to child_count.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use shepherd_definitions::audit::AuditAction;
use shepherd_definitions::batch::{BatchStatus, BatchTicket, MAX_BATCH_SIZE};
use shepherd_definitions::event::EventStatus;
use shepherd_definitions::rbac::{Permission, ResourceRole, ResourceType};
use shepherd_definitions::ticket::{OperationType, TicketStatus};
use shepherd_definitions::vm::VmRequest;
use shepherd_definitions::{Environment, Error as DomainError};

use crate::audit::{append, Audit, RequestContext};
use crate::governance::insert_ticket_tx;
use crate::rbac::{require_resource_role, Actor};
use crate::{db, queue, Db, Result};

/// A batch of VM create intents.
#[derive(Clone, Debug)]
pub struct BatchRequest {
    pub items: Vec<VmRequest>,
    pub idempotency_key: Option<String>,
}

/// Validate shape and environment homogeneity, returning the common
/// environment.
async fn validate_batch(db: &Db, actor: &Actor, req: &BatchRequest) -> Result<Environment> {
    if req.items.is_empty() {
        return Err(DomainError::Validation("batch must contain at least one item".into()).into());
    }
    if req.items.len() > MAX_BATCH_SIZE {
        return Err(DomainError::Validation(format!(
            "batch size {} exceeds the maximum of {}",
            req.items.len(),
            MAX_BATCH_SIZE
        ))
        .into());
    }
    let mut env: Option<Environment> = None;
    for (i, item) in req.items.iter().enumerate() {
        item.validate()
            .map_err(|e| DomainError::Validation(format!("item {}: {}", i, e)))?;
        let ns = db::namespaces::get_by_name(db.pool(), &item.namespace)
            .await?
            .ok_or_else(|| {
                DomainError::Validation(format!("item {}: unknown namespace '{}'", i, item.namespace))
            })?;
        match env {
            None => env = Some(ns.environment),
            Some(e) if e != ns.environment => {
                return Err(DomainError::Validation(
                    "batch mixes environments; split test and prod submissions".into(),
                )
                .into());
            }
            _ => {}
        }
        if db::templates::get(db.pool(), item.template_id).await?.is_none() {
            return Err(
                DomainError::Validation(format!("item {}: unknown template", i)).into(),
            );
        }
        if db::sizes::get(db.pool(), item.instance_size_id).await?.is_none() {
            return Err(
                DomainError::Validation(format!("item {}: unknown instance size", i)).into(),
            );
        }
        require_resource_role(db.pool(), actor, item.service_id, None, ResourceRole::Member)
            .await?;
    }
    Ok(env.expect("non-empty batch has an environment"))
}

/// Submit a batch: one transaction inserts the parent, every child ticket
/// and event, the rate-limit counters and the audit row. Any validation
/// failure aborts the whole submission.
pub async fn submit_batch(
    db: &Db,
    actor: &Actor,
    ctx: &RequestContext,
    req: BatchRequest,
) -> Result<BatchTicket> {
    actor.require(Permission::BatchSubmit)?;
    let env = validate_batch(db, actor, &req).await?;
    actor.require_operation(OperationType::CreateVm, env)?;

    if let Some(key) = &req.idempotency_key {
        if let Some(existing) =
            db::batches::find_by_idempotency_key(db.pool(), actor.id, key).await?
        {
            return Ok(existing);
        }
    }

    let limits = shepherd_definitions::RateLimits::default();
    let child_count = req.items.len() as i32;
    db.with_tx(move |conn| {
        let req = req.clone();
        let actor = actor.clone();
        let ctx = ctx.clone();
        let limits = limits;
        Box::pin(async move {
            if let Some(key) = &req.idempotency_key {
                if let Some(existing) =
                    db::batches::find_by_idempotency_key(&mut *conn, actor.id, key).await?
                {
                    return Ok(existing);
                }
            }

            let now = Utc::now();
            crate::ratelimit::check_batch_submit(conn, actor.id, child_count as i64, &limits, now)
                .await?;

            let parent = BatchTicket {
                id: Uuid::new_v4(),
                batch_type: "vm_create".into(),
                requester: actor.id,
                child_count,
                pending_count: child_count,
                success_count: 0,
                failed_count: 0,
                status: BatchStatus::InProgress,
                idempotency_key: req.idempotency_key.clone(),
                created_at: now,
                updated_at: now,
            };
            db::batches::insert(conn, &parent).await?;

            for (i, item) in req.items.iter().enumerate() {
                let payload = serde_json::to_value(item)
                    .map_err(|e| DomainError::Internal(format!("payload serialization: {}", e)))?;
                insert_ticket_tx(
                    conn,
                    &actor,
                    &ctx,
                    OperationType::CreateVm,
                    env,
                    &item.namespace,
                    Some(item.service_id),
                    payload,
                    None,
                    None,
                    Some((parent.id, i as i32)),
                )
                .await?;
            }

            append(
                conn,
                Audit::new(AuditAction::BatchSubmitted, actor.id)
                    .resource(ResourceType::Vm, parent.id, "batch")
                    .environment(env)
                    .details(json!({
                        "batch_id": parent.id,
                        "child_count": child_count,
                    }))
                    .context(&ctx),
            )
            .await?;
            Ok(parent)
        })
    })
    .await
}

pub async fn get_batch(db: &Db, batch_id: Uuid) -> Result<BatchTicket> {
    db::batches::get(db.pool(), batch_id)
        .await?
        .ok_or_else(|| DomainError::NotFound(format!("batch {}", batch_id)).into())
}

/// Retry only the FAILED children.
///
/// Terminal tickets never transition, so a retry inserts a replacement
/// child per failed one: same payload, already approved (the original
/// approval still stands), fresh event and job. The original stays FAILED
/// for the audit trail; the parent counters move failed → pending.
pub async fn retry_batch(
    db: &Db,
    actor: &Actor,
    ctx: &RequestContext,
    batch_id: Uuid,
) -> Result<BatchTicket> {
    let parent = get_batch(db, batch_id).await?;
    if parent.requester != actor.id && !actor.is_platform_admin() {
        return Err(DomainError::Forbidden("only the requester may retry".into()).into());
    }
    let failed =
        db::tickets::children_of_batch_in_status(db.pool(), batch_id, TicketStatus::Failed).await?;
    if failed.is_empty() {
        return Err(DomainError::Conflict("batch has no failed children".into()).into());
    }

    db.with_tx(move |conn| {
        let failed = failed.clone();
        let actor = actor.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            let mut reopened = 0;
            let now = Utc::now();
            for old in &failed {
                if old.attempts >= queue::DEFAULT_MAX_ATTEMPTS {
                    continue;
                }
                let replacement = shepherd_definitions::ApprovalTicket {
                    id: Uuid::new_v4(),
                    operation: old.operation,
                    requester: old.requester,
                    payload: old.payload.clone(),
                    modified_spec: old.modified_spec.clone(),
                    modification_reason: old.modification_reason.clone(),
                    status: TicketStatus::Approved,
                    environment: old.environment,
                    namespace: old.namespace.clone(),
                    service_id: old.service_id,
                    decided_by: Some(actor.id),
                    decision_reason: Some("batch retry".into()),
                    selected_cluster_id: old.selected_cluster_id,
                    selected_storage_class: old.selected_storage_class.clone(),
                    request_id: None,
                    parent_batch_id: old.parent_batch_id,
                    sequence_no: old.sequence_no,
                    attempts: old.attempts,
                    created_at: now,
                    updated_at: now,
                };
                db::tickets::insert(conn, &replacement).await?;
                let event_id = Uuid::new_v4();
                db::events::insert(
                    conn,
                    event_id,
                    replacement.id,
                    replacement.operation,
                    &replacement.payload,
                    EventStatus::Pending,
                )
                .await?;
                queue::enqueue(
                    conn,
                    queue::JobKind::ExecuteEvent,
                    event_id,
                    queue::DEFAULT_MAX_ATTEMPTS,
                )
                .await?;
                reopened += 1;
            }
            if reopened == 0 {
                return Err(DomainError::Conflict(
                    "all failed children exhausted their attempt budget".into(),
                )
                .into());
            }
            db::batches::reopen_children(conn, batch_id, reopened).await?;
            append(
                conn,
                Audit::new(AuditAction::BatchRetried, actor.id)
                    .resource(ResourceType::Vm, batch_id, "batch")
                    .details(json!({"batch_id": batch_id, "retried": reopened}))
                    .context(&ctx),
            )
            .await?;
            db::batches::get(&mut *conn, batch_id)
                .await?
                .ok_or_else(|| DomainError::Internal("batch vanished mid-commit".into()).into())
        })
    })
    .await
}

/// Cancel only the PENDING_APPROVAL children; running and finished
/// children are left alone.
pub async fn cancel_batch(
    db: &Db,
    actor: &Actor,
    ctx: &RequestContext,
    batch_id: Uuid,
) -> Result<BatchTicket> {
    let parent = get_batch(db, batch_id).await?;
    if parent.requester != actor.id && !actor.is_platform_admin() {
        return Err(DomainError::Forbidden("only the requester may cancel".into()).into());
    }
    let pending = db::tickets::children_of_batch_in_status(
        db.pool(),
        batch_id,
        TicketStatus::PendingApproval,
    )
    .await?;

    db.with_tx(move |conn| {
        let pending = pending.clone();
        let actor = actor.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            let mut cancelled = 0;
            for child in &pending {
                if db::tickets::cancel(conn, child.id, child.requester).await? {
                    db::events::cancel_by_ticket(conn, child.id).await?;
                    db::batches::child_finished(conn, batch_id, false).await?;
                    cancelled += 1;
                }
            }
            let batch = db::batches::get(&mut *conn, batch_id)
                .await?
                .ok_or_else(|| DomainError::NotFound(format!("batch {}", batch_id)))?;
            // a batch whose every child ended cancelled is CANCELLED, not
            // FAILED
            if cancelled > 0
                && batch.pending_count == 0
                && batch.success_count == 0
                && cancelled == batch.failed_count
            {
                db::batches::mark_cancelled(conn, batch_id).await?;
            }
            append(
                conn,
                Audit::new(AuditAction::BatchCancelled, actor.id)
                    .resource(ResourceType::Vm, batch_id, "batch")
                    .details(json!({"batch_id": batch_id, "cancelled": cancelled}))
                    .context(&ctx),
            )
            .await?;
            db::batches::get(&mut *conn, batch_id)
                .await?
                .ok_or_else(|| DomainError::Internal("batch vanished mid-commit".into()).into())
        })
    })
    .await
}
