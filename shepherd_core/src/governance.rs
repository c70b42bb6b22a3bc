//! The ticket state machine and the atomic write path.
//!
//! Every accepted change intent commits its ticket, event, audit row,
//! notifications and (when executable now) queue job in ONE transaction.
//! There is no interleaved state where a ticket exists without its event
//! or an approved ticket without its job; crash recovery is simply "the
//! transaction either committed or it did not".

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::PgConnection;
use uuid::Uuid;

use shepherd_definitions::audit::AuditAction;
use shepherd_definitions::event::EventStatus;
use shepherd_definitions::modification::validate_replacement;
use shepherd_definitions::notification::NotificationKind;
use shepherd_definitions::rbac::{Permission, ResourceRole, ResourceType};
use shepherd_definitions::ticket::{ApprovalTicket, OperationType, TicketStatus};
use shepherd_definitions::vm::{VmRecord, VmRequest};
use shepherd_definitions::{Cluster, Environment, Error as DomainError, NamespaceRecord};

use crate::audit::{append, Audit, RequestContext};
use crate::rbac::{require_resource_role, Actor};
use crate::{db, notify, queue, Db, Result};

/// Admin knobs supplied at approval time.
#[derive(Clone, Debug, Default)]
pub struct ApproveOptions {
    /// Full replacement for the payload spec; never merged
    pub modified_spec: Option<Value>,
    /// Mandatory when `modified_spec` is present
    pub modification_reason: Option<String>,
    pub decision_reason: Option<String>,
    pub selected_cluster_id: Option<Uuid>,
    pub selected_storage_class: Option<String>,
}

/// Resolve the namespace row or reject the request.
async fn namespace_of(db: &Db, name: &str) -> Result<NamespaceRecord> {
    db::namespaces::get_by_name(db.pool(), name)
        .await?
        .ok_or_else(|| DomainError::NotFound(format!("namespace '{}'", name)).into())
}

/// Preview cluster for pre-approval dry runs: any healthy test-environment
/// cluster. Returns None when no candidate exists; submission proceeds and
/// binding happens at approval anyway.
pub async fn preview_cluster(db: &Db) -> Result<Option<Cluster>> {
    let candidates = db::clusters::list_by_environment(db.pool(), Environment::Test).await?;
    Ok(candidates.into_iter().find(|c| c.is_schedulable()))
}

/// Submit a VM create intent.
///
/// Admission: structural validation, global permission, environment gate,
/// resource role walk, referenced template/size must exist. Then the
/// atomic write. Idempotent on (requester, request_id).
pub async fn submit_vm_create(
    db: &Db,
    actor: &Actor,
    ctx: &RequestContext,
    req: VmRequest,
) -> Result<ApprovalTicket> {
    req.validate()?;
    let namespace = namespace_of(db, &req.namespace).await?;
    let env = namespace.environment;
    actor.require_operation(OperationType::CreateVm, env)?;
    require_resource_role(db.pool(), actor, req.service_id, None, ResourceRole::Member).await?;

    if db::templates::get(db.pool(), req.template_id).await?.is_none() {
        return Err(DomainError::NotFound(format!("template {}", req.template_id)).into());
    }
    if db::sizes::get(db.pool(), req.instance_size_id).await?.is_none() {
        return Err(DomainError::NotFound(format!("instance size {}", req.instance_size_id)).into());
    }

    // resubmits with the same request_id return the original ticket
    if let Some(request_id) = &req.request_id {
        if let Some(existing) =
            db::tickets::find_by_request_id(db.pool(), actor.id, request_id).await?
        {
            return Ok(existing);
        }
    }

    let payload = serde_json::to_value(&req)
        .map_err(|e| DomainError::Internal(format!("payload serialization: {}", e)))?;
    submit_ticket(
        db,
        actor,
        ctx,
        OperationType::CreateVm,
        env,
        &req.namespace,
        Some(req.service_id),
        payload,
        req.request_id.clone(),
        None,
    )
    .await
}

/// Submit an operation against an existing VM (power, delete, console).
pub async fn submit_vm_operation(
    db: &Db,
    actor: &Actor,
    ctx: &RequestContext,
    op: OperationType,
    vm: &VmRecord,
    extra: Value,
) -> Result<ApprovalTicket> {
    let namespace = namespace_of(db, &vm.namespace).await?;
    let env = namespace.environment;
    actor.require_operation(op, env)?;
    let required = ResourceRole::required_for(op);
    require_resource_role(db.pool(), actor, vm.service_id, Some(vm.id), required).await?;

    let mut payload = json!({
        "vm_id": vm.id,
        "vm_name": vm.name,
        "namespace": vm.namespace,
        "service_id": vm.service_id,
        "cluster_id": vm.cluster_id,
    });
    if let (Some(obj), Some(extra_obj)) = (payload.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            obj.insert(k.clone(), v.clone());
        }
    }
    submit_ticket(
        db,
        actor,
        ctx,
        op,
        env,
        &vm.namespace,
        Some(vm.service_id),
        payload,
        None,
        vm.cluster_id,
    )
    .await
}

/// The atomic write at the end of every admission path.
///
/// Also used by the batch coordinator, which passes `parented` to stamp
/// batch linkage onto the children.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn insert_ticket_tx(
    conn: &mut PgConnection,
    actor: &Actor,
    ctx: &RequestContext,
    op: OperationType,
    env: Environment,
    namespace: &str,
    service_id: Option<Uuid>,
    payload: Value,
    request_id: Option<String>,
    selected_cluster_id: Option<Uuid>,
    parented: Option<(Uuid, i32)>,
) -> Result<ApprovalTicket> {
    let needs_approval = op.requires_approval(env);
    let now = Utc::now();
    let ticket = ApprovalTicket {
        id: Uuid::new_v4(),
        operation: op,
        requester: actor.id,
        payload,
        modified_spec: None,
        modification_reason: None,
        status: if needs_approval {
            TicketStatus::PendingApproval
        } else {
            TicketStatus::Approved
        },
        environment: env,
        namespace: namespace.to_string(),
        service_id,
        decided_by: None,
        decision_reason: (!needs_approval).then(|| "auto-approved by policy".to_string()),
        selected_cluster_id,
        selected_storage_class: None,
        request_id,
        parent_batch_id: parented.map(|(id, _)| id),
        sequence_no: parented.map(|(_, seq)| seq),
        attempts: 0,
        created_at: now,
        updated_at: now,
    };
    db::tickets::insert(conn, &ticket).await?;

    let event_id = Uuid::new_v4();
    let event_status = if needs_approval {
        EventStatus::Pending
    } else {
        EventStatus::Processing
    };
    db::events::insert(conn, event_id, ticket.id, op, &ticket.payload, event_status).await?;

    // executable-now events get their claim-check job in the same commit
    if !needs_approval && op.is_executable() {
        queue::enqueue(conn, queue::JobKind::ExecuteEvent, event_id, queue::DEFAULT_MAX_ATTEMPTS)
            .await?;
    }

    append(
        conn,
        Audit::new(AuditAction::RequestSubmitted, actor.id)
            .resource(ResourceType::Vm, ticket.id, namespace)
            .environment(env)
            .details(json!({
                "operation": op.as_str(),
                "ticket_id": ticket.id,
                "namespace": namespace,
                "auto_approved": !needs_approval,
            }))
            .context(ctx),
    )
    .await?;

    if needs_approval {
        let approvers =
            db::rbac::users_with_permission(&mut *conn, Permission::ApprovalDecide).await?;
        notify::push_many(
            conn,
            &approvers,
            NotificationKind::ApprovalRequested,
            &format!("{} awaiting approval", op.as_str()),
            &format!("{} requested {} in {}", actor.username, op.as_str(), namespace),
            &json!({"ticket_id": ticket.id}),
        )
        .await?;
    }
    Ok(ticket)
}

#[allow(clippy::too_many_arguments)]
async fn submit_ticket(
    db: &Db,
    actor: &Actor,
    ctx: &RequestContext,
    op: OperationType,
    env: Environment,
    namespace: &str,
    service_id: Option<Uuid>,
    payload: Value,
    request_id: Option<String>,
    selected_cluster_id: Option<Uuid>,
) -> Result<ApprovalTicket> {
    let namespace = namespace.to_string();
    db.with_tx(move |conn| {
        let actor = actor.clone();
        let ctx = ctx.clone();
        let namespace = namespace.clone();
        let payload = payload.clone();
        let request_id = request_id.clone();
        Box::pin(async move {
            // double-check idempotency under the transaction to close the
            // submit race
            if let Some(rid) = &request_id {
                if let Some(existing) =
                    db::tickets::find_by_request_id(&mut *conn, actor.id, rid).await?
                {
                    return Ok(existing);
                }
            }
            // platform-wide submit ceiling; a breach rolls this transaction
            // back, so the counter never counts rejected intents
            let limits = shepherd_definitions::RateLimits::default();
            crate::ratelimit::check_submit(conn, &limits, Utc::now()).await?;
            insert_ticket_tx(
                conn,
                &actor,
                &ctx,
                op,
                env,
                &namespace,
                service_id,
                payload,
                request_id,
                selected_cluster_id,
                None,
            )
            .await
        })
    })
    .await
}

/// Validate the approval-time cluster binding: environment equality,
/// schedulability, storage class membership, and capability fit for the
/// requested size.
async fn validate_cluster_binding(
    db: &Db,
    ticket: &ApprovalTicket,
    cluster_id: Uuid,
    storage_class: Option<&str>,
) -> Result<Cluster> {
    let cluster = db::clusters::get(db.pool(), cluster_id)
        .await?
        .ok_or_else(|| DomainError::NotFound(format!("cluster {}", cluster_id)))?;
    let namespace = namespace_of(db, &ticket.namespace).await?;
    if cluster.environment != namespace.environment {
        return Err(DomainError::PreconditionFailed(format!(
            "cluster '{}' is {} but namespace '{}' is {}",
            cluster.name, cluster.environment, namespace.name, namespace.environment
        ))
        .into());
    }
    if !cluster.is_schedulable() {
        return Err(DomainError::ServiceUnavailable(format!(
            "cluster '{}' is {}",
            cluster.name, cluster.health
        ))
        .into());
    }
    if let Some(sc) = storage_class {
        if !cluster.storage_classes.iter().any(|c| c == sc) {
            return Err(DomainError::Validation(format!(
                "storage class '{}' not available on cluster '{}'",
                sc, cluster.name
            ))
            .into());
        }
    }
    if ticket.operation == OperationType::CreateVm {
        let size_id = ticket
            .payload
            .get("instance_size_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<Uuid>().ok());
        if let Some(size_id) = size_id {
            if let Some(size) = db::sizes::get(db.pool(), size_id).await? {
                let features = cluster.effective_features();
                if !size.satisfied_by(&features) {
                    let missing: Vec<String> = size
                        .missing_from(&features)
                        .iter()
                        .map(|c| c.to_string())
                        .collect();
                    return Err(DomainError::PreconditionFailed(format!(
                        "cluster '{}' lacks required capabilities: {}",
                        cluster.name,
                        missing.join(", ")
                    ))
                    .into());
                }
            }
        }
    }
    Ok(cluster)
}

/// Approve a pending ticket: PENDING_APPROVAL → APPROVED plus the job
/// insert, atomically.
pub async fn approve(
    db: &Db,
    actor: &Actor,
    ctx: &RequestContext,
    ticket_id: Uuid,
    opts: ApproveOptions,
) -> Result<ApprovalTicket> {
    let ticket = db::tickets::get(db.pool(), ticket_id)
        .await?
        .ok_or_else(|| DomainError::NotFound(format!("ticket {}", ticket_id)))?;
    if ticket.status != TicketStatus::PendingApproval {
        return Err(DomainError::Conflict(format!(
            "ticket is {} and cannot be approved",
            ticket.status
        ))
        .into());
    }
    actor.require(Permission::ApprovalDecide)?;
    actor.require_environment(ticket.environment)?;

    let dropped = match &opts.modified_spec {
        Some(modified) => {
            if opts.modification_reason.as_deref().unwrap_or("").is_empty() {
                return Err(DomainError::Validation(
                    "a modification reason is required when replacing the spec".into(),
                )
                .into());
            }
            validate_replacement(&ticket.payload, modified)?
        }
        None => vec![],
    };

    // executable operations need a concrete cluster at approval
    let cluster_id = opts.selected_cluster_id.or(ticket.selected_cluster_id);
    let cluster = match (ticket.operation.is_executable(), cluster_id) {
        (true, Some(id)) => Some(
            validate_cluster_binding(db, &ticket, id, opts.selected_storage_class.as_deref())
                .await?,
        ),
        (true, None) => {
            return Err(
                DomainError::Validation("a target cluster must be selected".into()).into(),
            )
        }
        (false, _) => None,
    };
    let storage_class = opts
        .selected_storage_class
        .clone()
        .or_else(|| cluster.as_ref().and_then(|c| c.default_storage_class.clone()));

    let ticket_env = ticket.environment;
    let ticket_ns = ticket.namespace.clone();
    let requester = ticket.requester;
    let operation = ticket.operation;
    db.with_tx(move |conn| {
        let opts = opts.clone();
        let ticket_ns = ticket_ns.clone();
        let dropped = dropped.clone();
        let storage_class = storage_class.clone();
        let actor = actor.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            let decided = db::tickets::decide(
                conn,
                ticket_id,
                TicketStatus::Approved,
                actor.id,
                opts.decision_reason.as_deref(),
                opts.modified_spec.as_ref(),
                opts.modification_reason.as_deref(),
                cluster_id,
                storage_class.as_deref(),
            )
            .await?;
            if !decided {
                // raced another decision
                return Err(DomainError::Conflict("ticket already decided".into()).into());
            }

            let events = db::events::get_by_ticket(&mut *conn, ticket_id).await?;
            let event = events
                .first()
                .ok_or_else(|| DomainError::Internal("approved ticket has no event".into()))?;
            if operation.is_executable() {
                queue::enqueue(
                    conn,
                    queue::JobKind::ExecuteEvent,
                    event.id,
                    queue::DEFAULT_MAX_ATTEMPTS,
                )
                .await?;
            }

            append(
                conn,
                Audit::new(AuditAction::ApprovalApproved, actor.id)
                    .resource(ResourceType::Vm, ticket_id, &ticket_ns)
                    .environment(ticket_env)
                    .details(json!({
                        "ticket_id": ticket_id,
                        "modified": opts.modified_spec.is_some(),
                        "dropped_fields": dropped,
                        "cluster_id": cluster_id,
                        "storage_class": storage_class,
                        "reason": opts.decision_reason,
                    }))
                    .context(&ctx),
            )
            .await?;

            notify::push(
                conn,
                requester,
                NotificationKind::ApprovalDecided,
                "Request approved",
                &format!("your {} request was approved by {}", operation, actor.username),
                json!({"ticket_id": ticket_id, "decision": "approved"}),
            )
            .await?;

            db::tickets::get(&mut *conn, ticket_id)
                .await?
                .ok_or_else(|| DomainError::Internal("ticket vanished mid-commit".into()).into())
        })
    })
    .await
}

/// Reject a pending ticket with a mandatory reason.
pub async fn reject(
    db: &Db,
    actor: &Actor,
    ctx: &RequestContext,
    ticket_id: Uuid,
    reason: &str,
) -> Result<ApprovalTicket> {
    if reason.trim().is_empty() {
        return Err(DomainError::Validation("a rejection reason is required".into()).into());
    }
    let ticket = db::tickets::get(db.pool(), ticket_id)
        .await?
        .ok_or_else(|| DomainError::NotFound(format!("ticket {}", ticket_id)))?;
    if ticket.status != TicketStatus::PendingApproval {
        return Err(DomainError::Conflict(format!(
            "ticket is {} and cannot be rejected",
            ticket.status
        ))
        .into());
    }
    actor.require(Permission::ApprovalDecide)?;
    actor.require_environment(ticket.environment)?;

    let ticket_env = ticket.environment;
    let ticket_ns = ticket.namespace.clone();
    let requester = ticket.requester;
    let operation = ticket.operation;
    let parent = ticket.parent_batch_id;
    let reason = reason.to_string();
    db.with_tx(move |conn| {
        let reason = reason.clone();
        let ticket_ns = ticket_ns.clone();
        let actor = actor.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            let decided = db::tickets::decide(
                conn,
                ticket_id,
                TicketStatus::Rejected,
                actor.id,
                Some(&reason),
                None,
                None,
                None,
                None,
            )
            .await?;
            if !decided {
                return Err(DomainError::Conflict("ticket already decided".into()).into());
            }
            db::events::cancel_by_ticket(conn, ticket_id).await?;
            // no job can exist for an undecided ticket, but cancelling by
            // event keeps the no-job invariant robust against races
            for event in db::events::get_by_ticket(&mut *conn, ticket_id).await? {
                queue::cancel_by_event(conn, event.id).await?;
            }
            if let Some(batch_id) = parent {
                db::batches::child_finished(conn, batch_id, false).await?;
            }
            append(
                conn,
                Audit::new(AuditAction::ApprovalRejected, actor.id)
                    .resource(ResourceType::Vm, ticket_id, &ticket_ns)
                    .environment(ticket_env)
                    .details(json!({"ticket_id": ticket_id, "reason": reason}))
                    .context(&ctx),
            )
            .await?;
            notify::push(
                conn,
                requester,
                NotificationKind::ApprovalDecided,
                "Request rejected",
                &format!("your {} request was rejected: {}", operation, reason),
                json!({"ticket_id": ticket_id, "decision": "rejected"}),
            )
            .await?;
            db::tickets::get(&mut *conn, ticket_id)
                .await?
                .ok_or_else(|| DomainError::Internal("ticket vanished mid-commit".into()).into())
        })
    })
    .await
}

/// Requester self-cancel, only while the ticket still awaits approval.
///
/// Cancelling an EXECUTING ticket is a Conflict: execution is past the
/// cancellation boundary.
pub async fn cancel(
    db: &Db,
    actor: &Actor,
    ctx: &RequestContext,
    ticket_id: Uuid,
) -> Result<ApprovalTicket> {
    let ticket = db::tickets::get(db.pool(), ticket_id)
        .await?
        .ok_or_else(|| DomainError::NotFound(format!("ticket {}", ticket_id)))?;
    if ticket.requester != actor.id && !actor.is_platform_admin() {
        return Err(DomainError::Forbidden("only the requester may cancel".into()).into());
    }
    if ticket.status != TicketStatus::PendingApproval {
        return Err(DomainError::Conflict(format!(
            "ticket is {} and cannot be cancelled",
            ticket.status
        ))
        .into());
    }

    let ticket_env = ticket.environment;
    let ticket_ns = ticket.namespace.clone();
    let requester = ticket.requester;
    let parent = ticket.parent_batch_id;
    db.with_tx(move |conn| {
        let ticket_ns = ticket_ns.clone();
        let actor = actor.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            let cancelled = db::tickets::cancel(conn, ticket_id, requester).await?;
            if !cancelled {
                return Err(DomainError::Conflict("ticket already decided".into()).into());
            }
            db::events::cancel_by_ticket(conn, ticket_id).await?;
            for event in db::events::get_by_ticket(&mut *conn, ticket_id).await? {
                queue::cancel_by_event(conn, event.id).await?;
            }
            if let Some(batch_id) = parent {
                db::batches::child_finished(conn, batch_id, false).await?;
            }
            append(
                conn,
                Audit::new(AuditAction::ApprovalCancelled, actor.id)
                    .resource(ResourceType::Vm, ticket_id, &ticket_ns)
                    .environment(ticket_env)
                    .details(json!({"ticket_id": ticket_id}))
                    .context(&ctx),
            )
            .await?;
            db::tickets::get(&mut *conn, ticket_id)
                .await?
                .ok_or_else(|| DomainError::Internal("ticket vanished mid-commit".into()).into())
        })
    })
    .await
}

/// Direct hierarchy creation; the policy matrix exempts these from
/// approval, so they are synchronous CRUD with an audit row.
pub async fn create_system(
    db: &Db,
    actor: &Actor,
    ctx: &RequestContext,
    name: &str,
    description: &str,
) -> Result<shepherd_definitions::System> {
    actor.require(Permission::SystemCreate)?;
    let system = shepherd_definitions::System {
        id: Uuid::new_v4(),
        name: name.to_string(),
        description: description.to_string(),
        created_at: Utc::now(),
    };
    let created = system.clone();
    db.with_tx(move |conn| {
        let system = system.clone();
        let actor = actor.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            db::hierarchy::insert_system(conn, &system).await?;
            append(
                conn,
                Audit::new(AuditAction::RequestSubmitted, actor.id)
                    .resource(ResourceType::System, system.id, &system.name)
                    .details(json!({"operation": "CREATE_SYSTEM", "name": system.name}))
                    .context(&ctx),
            )
            .await?;
            Ok(())
        })
    })
    .await?;
    Ok(created)
}

pub async fn create_service(
    db: &Db,
    actor: &Actor,
    ctx: &RequestContext,
    system_id: Uuid,
    name: &str,
    description: &str,
) -> Result<shepherd_definitions::Service> {
    actor.require(Permission::ServiceCreate)?;
    if db::hierarchy::get_system(db.pool(), system_id).await?.is_none() {
        return Err(DomainError::NotFound(format!("system {}", system_id)).into());
    }
    let service = shepherd_definitions::Service {
        id: Uuid::new_v4(),
        system_id,
        name: name.to_string(),
        description: description.to_string(),
        created_at: Utc::now(),
    };
    let created = service.clone();
    db.with_tx(move |conn| {
        let service = service.clone();
        let actor = actor.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            db::hierarchy::insert_service(conn, &service).await?;
            append(
                conn,
                Audit::new(AuditAction::RequestSubmitted, actor.id)
                    .resource(ResourceType::Service, service.id, &service.name)
                    .parent(ResourceType::System, service.system_id)
                    .details(json!({"operation": "CREATE_SERVICE", "name": service.name}))
                    .context(&ctx),
            )
            .await?;
            Ok(())
        })
    })
    .await?;
    Ok(created)
}
