//! Event dispatcher: the code a queue worker runs after claiming a job.
//!
//! The job row is a claim check; everything real is loaded from the event
//! and ticket. Failures are classified once: retryable goes back to the
//! queue with backoff, permanent marks the event and ticket FAILED and
//! cancels the job. The ticket only reaches FAILED when the queue gives
//! up or the failure is permanent.

mod manifest;
pub use manifest::build_vm_manifest;

mod registry;
pub use registry::ProviderRegistry;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use serde_json::{json, Value};
use tokio::sync::watch;
use uuid::Uuid;

use shepherd_definitions::audit::AuditAction;
use shepherd_definitions::event::{DomainEvent, EventStatus};
use shepherd_definitions::notification::NotificationKind;
use shepherd_definitions::rbac::ResourceType;
use shepherd_definitions::ticket::{ApprovalTicket, OperationType, TicketStatus};
use shepherd_definitions::vm::{labels, PowerAction, VmRecord};
use shepherd_definitions::Error as DomainError;

use crate::audit::{append, Audit};
use crate::workers::WorkerPool;
use crate::{db, queue, Db, Error, Result};

/// Retention and timeout knobs the dispatcher applies per job.
#[derive(Clone, Copy, Debug)]
pub struct DispatchConfig {
    pub completed_retention_secs: i64,
    pub discarded_retention_secs: i64,
    /// Ceiling for one provider invocation; an expired attempt counts as
    /// a transient failure and goes back to the queue
    pub worker_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            completed_retention_secs: 24 * 3600,
            discarded_retention_secs: 7 * 24 * 3600,
            worker_timeout_secs: 600,
        }
    }
}

impl DispatchConfig {
    /// Per-kind task budget. Apply and delete get the full ceiling since
    /// they may wait on storage provisioning; power and console round
    /// trips are bounded much tighter.
    fn timeout_for(&self, kind: OperationType) -> Duration {
        match kind {
            OperationType::StartVm
            | OperationType::StopVm
            | OperationType::RestartVm
            | OperationType::VncAccess => Duration::from_secs(self.worker_timeout_secs.min(60)),
            _ => Duration::from_secs(self.worker_timeout_secs),
        }
    }
}

/// Hook the composition root installs so capability-refresh jobs can
/// rebuild a cluster's provider (only the root knows how to construct
/// clients from sealed credentials).
pub trait CapabilityRefresher: Send + Sync {
    fn refresh<'a>(&'a self, cluster_id: Uuid) -> futures::future::BoxFuture<'a, Result<()>>;
}

pub struct Dispatcher {
    db: Db,
    registry: Arc<ProviderRegistry>,
    config: DispatchConfig,
    refresher: Option<Arc<dyn CapabilityRefresher>>,
}

/// What the provider call produced, for bookkeeping.
enum Outcome {
    Applied { external_uid: Option<String> },
    Deleted,
    Powered,
    ConsolePath(String),
}

impl Dispatcher {
    pub fn new(db: Db, registry: Arc<ProviderRegistry>, config: DispatchConfig) -> Self {
        Dispatcher {
            db,
            registry,
            config,
            refresher: None,
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn CapabilityRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Entry point for one claimed job. Never returns an error; every
    /// failure path ends in queue bookkeeping.
    pub async fn handle(&self, job: queue::Job) {
        if let Err(e) = self.run(&job).await {
            // bookkeeping itself failed; the job stays running and will be
            // rescued by a future claim after the row times out
            warn!("dispatch bookkeeping failed for job {}: {}", job.id, e);
        }
    }

    async fn run(&self, job: &queue::Job) -> Result<()> {
        if job.kind == queue::JobKind::RefreshCapabilities {
            return self.refresh_capabilities(job).await;
        }
        let Some(event) = db::events::get(self.db.pool(), job.event_id).await? else {
            return self.cancel_job(job, "event not found").await;
        };
        let Some(ticket) = db::tickets::get(self.db.pool(), event.ticket_id).await? else {
            return self.cancel_job(job, "ticket not found").await;
        };
        if ticket.status.is_terminal() {
            return self.cancel_job(job, "ticket already terminal").await;
        }

        // advance event and ticket in one commit; losing the guard means a
        // cancel won the race
        let advanced = self
            .db
            .with_tx(|conn| {
                let event_id = event.id;
                let ticket_id = ticket.id;
                Box::pin(async move {
                    let ev = db::events::mark_processing(conn, event_id).await?;
                    let tk = db::tickets::mark_executing(conn, ticket_id).await?;
                    Ok(ev && tk)
                })
            })
            .await?;
        if !advanced {
            return self.cancel_job(job, "ticket is not executable").await;
        }

        let effective = event.effective_spec(ticket.modified_spec.as_ref());
        let budget = self.config.timeout_for(event.kind);
        let result = match tokio::time::timeout(
            budget,
            self.perform(job, &event, &ticket, &effective),
        )
        .await
        {
            Ok(result) => result,
            // an expired budget is transient from the queue's point of
            // view: the apply is idempotent, so the next attempt converges
            Err(_) => Err(DomainError::ServiceUnavailable(format!(
                "provider call exceeded its {}s budget",
                budget.as_secs()
            ))
            .into()),
        };
        match result {
            Ok(outcome) => self.finish_success(job, &event, &ticket, outcome).await,
            Err(e) if e.is_retryable() && job.attempts < job.max_attempts => {
                info!(
                    "job {} attempt {}/{} failed transiently: {}",
                    job.id, job.attempts, job.max_attempts, e
                );
                self.schedule_retry(job, &event, &e).await
            }
            Err(e) => self.finish_failure(job, &event, &ticket, &e).await,
        }
    }

    /// Invoke the provider for the event's operation.
    async fn perform(
        &self,
        _job: &queue::Job,
        event: &DomainEvent,
        ticket: &ApprovalTicket,
        effective: &Value,
    ) -> Result<Outcome> {
        let cluster_id = self.resolve_cluster(ticket)?;
        let provider = self.registry.provider(cluster_id).ok_or_else(|| {
            Error::from(DomainError::ServiceUnavailable(format!(
                "no provider connected for cluster {}",
                cluster_id
            )))
        })?;

        // strong consistency at the write boundary: no writes while the
        // cluster view is stale or rebuilding
        if let Some(cache) = self.registry.cache(cluster_id) {
            if !cache.writable() {
                return Err(DomainError::ServiceUnavailable(format!(
                    "cluster {} cache is not consistent ({:?})",
                    cluster_id,
                    cache.status()
                ))
                .into());
            }
        }

        match event.kind {
            OperationType::CreateVm | OperationType::ModifyVm => {
                let name = effective
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| DomainError::Validation("spec lacks a vm name".into()))?
                    .to_string();

                // crash guard: a prior attempt exists (the event was loaded
                // before this attempt's increment), so if it already applied
                // this ticket, converge on its result instead of re-applying
                if event.attempts > 0 {
                    if let Some(existing) = provider.get_vm(&ticket.namespace, &name).await? {
                        if existing.ticket_label() == Some(ticket.id.to_string().as_str()) {
                            info!("job for ticket {} already applied, adopting result", ticket.id);
                            return Ok(Outcome::Applied {
                                external_uid: Some(existing.uid),
                            });
                        }
                    }
                }

                let doc = self.render_manifest(ticket, effective, &name).await?;
                let applied = provider.apply_vm(&ticket.namespace, &name, &doc).await?;
                Ok(Outcome::Applied {
                    external_uid: Some(applied.uid),
                })
            }
            OperationType::DeleteVm => {
                let name = vm_name_of(effective)?;
                provider.delete_vm(&ticket.namespace, &name).await?;
                Ok(Outcome::Deleted)
            }
            OperationType::StartVm | OperationType::StopVm | OperationType::RestartVm => {
                let name = vm_name_of(effective)?;
                let action = match event.kind {
                    OperationType::StartVm => PowerAction::Start,
                    OperationType::StopVm => PowerAction::Stop,
                    _ => PowerAction::Restart,
                };
                provider.power(&ticket.namespace, &name, action).await?;
                Ok(Outcome::Powered)
            }
            OperationType::VncAccess => {
                let name = vm_name_of(effective)?;
                let console = provider.console().ok_or_else(|| {
                    Error::from(DomainError::Validation(
                        "cluster provider has no console capability".into(),
                    ))
                })?;
                let path = console.vnc_path(&ticket.namespace, &name).await?;
                Ok(Outcome::ConsolePath(path))
            }
            OperationType::CreateSystem | OperationType::CreateService => {
                // these never reach the queue; the policy matrix keeps them
                // synchronous
                Err(DomainError::Internal("hierarchy op in execution queue".into()).into())
            }
        }
    }

    fn resolve_cluster(&self, ticket: &ApprovalTicket) -> Result<Uuid> {
        ticket
            .selected_cluster_id
            .or_else(|| {
                ticket
                    .payload
                    .get("cluster_id")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
            })
            .ok_or_else(|| DomainError::Validation("ticket has no target cluster".into()).into())
    }

    async fn render_manifest(
        &self,
        ticket: &ApprovalTicket,
        effective: &Value,
        name: &str,
    ) -> Result<Value> {
        let template_id = effective
            .get("template_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<Uuid>().ok())
            .ok_or_else(|| DomainError::Validation("spec lacks template_id".into()))?;
        let size_id = effective
            .get("instance_size_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<Uuid>().ok())
            .ok_or_else(|| DomainError::Validation("spec lacks instance_size_id".into()))?;
        let template = db::templates::get(self.db.pool(), template_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("template {}", template_id)))?;
        let size = db::sizes::get(self.db.pool(), size_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("instance size {}", size_id)))?;

        let service = match ticket.service_id {
            Some(sid) => db::hierarchy::get_service(self.db.pool(), sid).await?,
            None => None,
        };
        let system = match &service {
            Some(svc) => db::hierarchy::get_system(self.db.pool(), svc.system_id).await?,
            None => None,
        };

        let mut label_map = std::collections::BTreeMap::new();
        label_map.insert(labels::MANAGED_BY.to_string(), labels::MANAGED_BY_VALUE.to_string());
        label_map.insert(labels::TICKET_ID.to_string(), ticket.id.to_string());
        label_map.insert(labels::INSTANCE.to_string(), name.to_string());
        if let Some(svc) = &service {
            label_map.insert(labels::SERVICE.to_string(), svc.name.clone());
        }
        if let Some(sys) = &system {
            label_map.insert(labels::SYSTEM.to_string(), sys.name.clone());
        }

        Ok(build_vm_manifest(
            &template,
            &size,
            effective,
            &ticket.namespace,
            name,
            &label_map,
        ))
    }

    /// Terminal success bookkeeping, one commit: event, ticket, vm record,
    /// batch counters, audit, notification and the job row.
    async fn finish_success(
        &self,
        job: &queue::Job,
        event: &DomainEvent,
        ticket: &ApprovalTicket,
        outcome: Outcome,
    ) -> Result<()> {
        let retention = self.config.completed_retention_secs;
        let cluster_id = self.resolve_cluster(ticket).ok();
        let effective = event.effective_spec(ticket.modified_spec.as_ref());
        let job_id = job.id;
        self.db
            .with_tx(move |conn| {
                let event = event.clone();
                let ticket = ticket.clone();
                let effective = effective.clone();
                let outcome_uid = match &outcome {
                    Outcome::Applied { external_uid } => external_uid.clone(),
                    _ => None,
                };
                let console_path = match &outcome {
                    Outcome::ConsolePath(p) => Some(p.clone()),
                    _ => None,
                };
                let deleted = matches!(outcome, Outcome::Deleted);
                Box::pin(async move {
                    db::events::mark_terminal(conn, event.id, EventStatus::Completed, None).await?;
                    db::tickets::mark_terminal(conn, ticket.id, TicketStatus::Success).await?;

                    match event.kind {
                        OperationType::CreateVm | OperationType::ModifyVm => {
                            let record = vm_record_from(&ticket, &effective, cluster_id, outcome_uid)?;
                            db::hierarchy::upsert_vm(conn, &record).await?;
                        }
                        OperationType::DeleteVm if deleted => {
                            if let Some(vm_id) = payload_vm_id(&ticket.payload) {
                                db::hierarchy::delete_vm(conn, vm_id).await?;
                            }
                        }
                        _ => {}
                    }

                    if let Some(batch_id) = ticket.parent_batch_id {
                        db::batches::child_finished(conn, batch_id, true).await?;
                    }

                    append(
                        conn,
                        Audit::new(AuditAction::ExecutionCompleted, ticket.requester)
                            .resource(ResourceType::Vm, ticket.id, &ticket.namespace)
                            .environment(ticket.environment)
                            .details(json!({
                                "ticket_id": ticket.id,
                                "operation": event.kind.as_str(),
                                "attempts": event.attempts,
                            })),
                    )
                    .await?;

                    let mut meta = json!({"ticket_id": ticket.id, "status": "SUCCESS"});
                    if let Some(path) = &console_path {
                        meta["console_path"] = json!(path);
                    }
                    crate::notify::push(
                        conn,
                        ticket.requester,
                        NotificationKind::ExecutionFinished,
                        "Request completed",
                        &format!("{} finished successfully", event.kind),
                        meta,
                    )
                    .await?;

                    queue::complete(conn, job_id, retention).await?;
                    Ok(())
                })
            })
            .await?;
        info!("job {} for ticket {} succeeded", job.id, ticket.id);
        Ok(())
    }

    /// Transient failure: record the error on the event, let the queue
    /// schedule the next attempt. Ticket stays EXECUTING.
    async fn schedule_retry(&self, job: &queue::Job, event: &DomainEvent, e: &Error) -> Result<()> {
        let retention = self.config.discarded_retention_secs;
        let msg = e.to_string();
        self.db
            .with_tx(move |conn| {
                let msg = msg.clone();
                let event_id = event.id;
                let job = job.clone();
                Box::pin(async move {
                    db::events::record_error(conn, event_id, &msg).await?;
                    queue::retry(conn, &job, &msg, retention).await?;
                    Ok(())
                })
            })
            .await
    }

    /// Permanent failure (or exhausted retries): event FAILED, ticket
    /// FAILED, batch counters, audit, notification, job closed.
    async fn finish_failure(
        &self,
        job: &queue::Job,
        event: &DomainEvent,
        ticket: &ApprovalTicket,
        e: &Error,
    ) -> Result<()> {
        let retention = self.config.discarded_retention_secs;
        let msg = e.to_string();
        let exhausted = job.attempts >= job.max_attempts;
        self.db
            .with_tx(move |conn| {
                let msg = msg.clone();
                let event = event.clone();
                let ticket = ticket.clone();
                let job = job.clone();
                Box::pin(async move {
                    db::events::mark_terminal(conn, event.id, EventStatus::Failed, Some(&msg))
                        .await?;
                    db::tickets::mark_terminal(conn, ticket.id, TicketStatus::Failed).await?;
                    if let Some(batch_id) = ticket.parent_batch_id {
                        db::batches::child_finished(conn, batch_id, false).await?;
                    }
                    append(
                        conn,
                        Audit::new(AuditAction::ExecutionFailed, ticket.requester)
                            .resource(ResourceType::Vm, ticket.id, &ticket.namespace)
                            .environment(ticket.environment)
                            .details(json!({
                                "ticket_id": ticket.id,
                                "operation": event.kind.as_str(),
                                "error": msg,
                                "attempts": event.attempts,
                            })),
                    )
                    .await?;
                    crate::notify::push(
                        conn,
                        ticket.requester,
                        NotificationKind::ExecutionFinished,
                        "Request failed",
                        &format!("{} failed: {}", event.kind, msg),
                        json!({"ticket_id": ticket.id, "status": "FAILED"}),
                    )
                    .await?;
                    if exhausted {
                        queue::retry(conn, &job, &msg, retention).await?;
                    } else {
                        queue::cancel(conn, job.id, &msg).await?;
                    }
                    Ok(())
                })
            })
            .await?;
        warn!("job {} for ticket {} failed permanently: {}", job.id, ticket.id, e);
        Ok(())
    }

    /// RefreshCapabilities jobs carry the cluster id in the claim-check
    /// column.
    async fn refresh_capabilities(&self, job: &queue::Job) -> Result<()> {
        let cluster_id = job.event_id;
        let result = match &self.refresher {
            Some(r) => r.refresh(cluster_id).await,
            None => Ok(()),
        };
        let retention = self.config.completed_retention_secs;
        let discard_retention = self.config.discarded_retention_secs;
        match result {
            Ok(()) => {
                self.db
                    .with_tx(move |conn| {
                        let job_id = job.id;
                        Box::pin(async move { queue::complete(conn, job_id, retention).await })
                    })
                    .await
            }
            Err(e) => {
                warn!("capability refresh for {} failed: {}", cluster_id, e);
                self.db
                    .with_tx(move |conn| {
                        let job = job.clone();
                        let msg = e.to_string();
                        Box::pin(async move {
                            queue::retry(conn, &job, &msg, discard_retention).await?;
                            Ok(())
                        })
                    })
                    .await
            }
        }
    }

    async fn cancel_job(&self, job: &queue::Job, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        self.db
            .with_tx(move |conn| {
                let reason = reason.clone();
                let job_id = job.id;
                Box::pin(async move { queue::cancel(conn, job_id, &reason).await })
            })
            .await
    }
}

fn vm_name_of(effective: &Value) -> Result<String> {
    effective
        .get("vm_name")
        .or_else(|| effective.get("name"))
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| DomainError::Validation("spec lacks a vm name".into()).into())
}

fn payload_vm_id(payload: &Value) -> Option<Uuid> {
    payload
        .get("vm_id")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

fn vm_record_from(
    ticket: &ApprovalTicket,
    effective: &Value,
    cluster_id: Option<Uuid>,
    external_uid: Option<String>,
) -> Result<VmRecord> {
    let name = vm_name_of(effective)?;
    let template_id = effective
        .get("template_id")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(Uuid::nil);
    let instance_size_id = effective
        .get("instance_size_id")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(Uuid::nil);
    let service_id = ticket
        .service_id
        .ok_or_else(|| DomainError::Internal("create ticket lacks service_id".into()))?;
    let now = Utc::now();
    Ok(VmRecord {
        id: payload_vm_id(&ticket.payload).unwrap_or_else(Uuid::new_v4),
        service_id,
        name,
        namespace: ticket.namespace.clone(),
        cluster_id,
        template_id,
        instance_size_id,
        external_uid,
        created_at: now,
        updated_at: now,
    })
}

/// The queue drain loop: acquire a worker slot, claim a job, hand it to
/// the dispatcher. Runs until shutdown.
pub async fn run_queue_loop(
    db: Db,
    pool: WorkerPool,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("queue drain loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let permit = match pool.acquire().await {
            Ok(p) => p,
            Err(_) => break,
        };
        match queue::claim_one(db.pool()).await {
            Ok(Some(job)) => {
                let dispatcher = Arc::clone(&dispatcher);
                pool.spawn_with_permit(permit, async move {
                    dispatcher.handle(job).await;
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
                    _ = shutdown.changed() => break,
                }
            }
            Err(e) => {
                drop(permit);
                warn!("claim failed: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(2)) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
    info!("queue drain loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_ops_get_a_tighter_budget() {
        let cfg = DispatchConfig::default();
        assert_eq!(cfg.timeout_for(OperationType::CreateVm), Duration::from_secs(600));
        assert_eq!(cfg.timeout_for(OperationType::DeleteVm), Duration::from_secs(600));
        assert_eq!(cfg.timeout_for(OperationType::StopVm), Duration::from_secs(60));
        assert_eq!(cfg.timeout_for(OperationType::VncAccess), Duration::from_secs(60));
    }

    #[test]
    fn a_low_ceiling_binds_every_kind() {
        let cfg = DispatchConfig {
            worker_timeout_secs: 30,
            ..DispatchConfig::default()
        };
        assert_eq!(cfg.timeout_for(OperationType::CreateVm), Duration::from_secs(30));
        assert_eq!(cfg.timeout_for(OperationType::RestartVm), Duration::from_secs(30));
    }
}
