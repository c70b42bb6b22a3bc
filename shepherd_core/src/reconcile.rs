//! Adoption sweeper.
//!
//! Periodically lists external VMs carrying platform ownership labels and
//! proposes adoption for any without a local record, provided their
//! governance parent (the Service) exists. A safety guard halts the sweep
//! when the orphan ratio looks like a misconfiguration rather than drift.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use shepherd_definitions::adoption::{AdoptionStatus, PendingAdoption};

use crate::dispatch::ProviderRegistry;
use crate::{db, Db, Result};

/// Sweep interval; this is a low-priority background concern
const SWEEP_EVERY: Duration = Duration::from_secs(600);

/// Above this orphan ratio the sweep refuses to act: a half-orphaned
/// cluster means our labels or database are wrong, not the cluster.
const ORPHAN_RATIO_GUARD: f64 = 0.5;

pub struct Reconciler {
    db: Db,
    registry: Arc<ProviderRegistry>,
}

impl Reconciler {
    pub fn new(db: Db, registry: Arc<ProviderRegistry>) -> Self {
        Reconciler { db, registry }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("adoption sweeper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_EVERY) => {}
                _ = shutdown.changed() => break,
            }
            for cluster_id in self.registry.cluster_ids() {
                if let Err(e) = self.sweep_cluster(cluster_id).await {
                    warn!("adoption sweep for cluster {} failed: {}", cluster_id, e);
                }
            }
        }
        info!("adoption sweeper stopped");
    }

    pub async fn sweep_cluster(&self, cluster_id: Uuid) -> Result<()> {
        let Some(provider) = self.registry.provider(cluster_id) else {
            return Ok(());
        };
        let vms = provider.list_vms(None).await?;
        let managed: Vec<_> = vms.iter().filter(|vm| vm.is_platform_managed()).collect();
        if managed.is_empty() {
            return Ok(());
        }

        let mut orphans = Vec::new();
        for vm in &managed {
            if db::hierarchy::get_vm_by_name(self.db.pool(), &vm.namespace, &vm.name)
                .await?
                .is_none()
            {
                orphans.push(*vm);
            }
        }
        if orphans.is_empty() {
            return Ok(());
        }

        let ratio = orphans.len() as f64 / managed.len() as f64;
        if ratio > ORPHAN_RATIO_GUARD {
            error!(
                "adoption sweep halted for cluster {}: {}/{} managed vms have no record; \
                 this smells like a misconfiguration, refusing to mass-propose",
                cluster_id,
                orphans.len(),
                managed.len()
            );
            return Ok(());
        }

        let mut proposed = 0;
        for vm in orphans {
            // only propose when the governance parent actually exists
            let service_label = vm.labels.get(shepherd_definitions::vm::labels::SERVICE);
            let service = match service_label {
                Some(name) => db::hierarchy::get_service_by_name(self.db.pool(), name).await?,
                None => None,
            };
            if service.is_none() {
                continue;
            }

            let now = Utc::now();
            let adoption = PendingAdoption {
                id: Uuid::new_v4(),
                cluster_id,
                namespace: vm.namespace.clone(),
                resource_name: vm.name.clone(),
                system_label: vm
                    .labels
                    .get(shepherd_definitions::vm::labels::SYSTEM)
                    .cloned(),
                service_label: service_label.cloned(),
                instance_label: vm
                    .labels
                    .get(shepherd_definitions::vm::labels::INSTANCE)
                    .cloned(),
                external_uid: vm.uid.clone(),
                spec_snapshot: json!({
                    "power_state": vm.power_state,
                    "ready": vm.ready,
                    "labels": vm.labels,
                }),
                status: AdoptionStatus::Pending,
                created_at: now,
                updated_at: now,
            };
            let inserted = self
                .db
                .with_tx(move |conn| {
                    let adoption = adoption.clone();
                    Box::pin(async move { db::adoptions::propose(conn, &adoption).await })
                })
                .await?;
            if inserted {
                proposed += 1;
            }
        }
        if proposed > 0 {
            info!("proposed {} adoptions for cluster {}", proposed, cluster_id);
        }
        Ok(())
    }
}
