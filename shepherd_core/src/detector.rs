//! Capability detector and health checker.
//!
//! One sweep every 60 seconds probes each registered cluster through its
//! provider: reachability, CRD presence, KubeVirt version, feature gates
//! and storage classes, written back to the cluster row. Repeated probe
//! failures walk the health state down to UNREACHABLE; a detected
//! version change queues an asynchronous capability refresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use semver::Version;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use shepherd_definitions::cluster::{ga_features, ClusterHealth};

use crate::dispatch::ProviderRegistry;
use crate::{db, queue, Db, Result};

/// Probe interval
const SWEEP_EVERY: Duration = Duration::from_secs(60);
/// Consecutive failures before UNHEALTHY becomes UNREACHABLE
const UNREACHABLE_AFTER: u32 = 3;

pub struct Detector {
    db: Db,
    registry: Arc<ProviderRegistry>,
    failure_counts: Mutex<HashMap<Uuid, u32>>,
}

impl Detector {
    pub fn new(db: Db, registry: Arc<ProviderRegistry>) -> Self {
        Detector {
            db,
            registry,
            failure_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Run until shutdown; one sweep per interval.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("capability detector started");
        loop {
            if let Err(e) = self.sweep().await {
                warn!("detector sweep failed: {}", e);
            }
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_EVERY) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("capability detector stopped");
    }

    pub async fn sweep(&self) -> Result<()> {
        let clusters = db::clusters::list(self.db.pool()).await?;
        for cluster in clusters {
            let Some(provider) = self.registry.provider(cluster.id) else {
                continue;
            };
            match provider.probe().await {
                Ok(report) if report.reachable => {
                    self.failure_counts.lock().await.remove(&cluster.id);
                    let health = if report.crd_installed {
                        ClusterHealth::Healthy
                    } else {
                        // reachable but not a kubevirt cluster
                        ClusterHealth::Unhealthy
                    };

                    // explicit gates plus the GA set for the detected version
                    let mut features: Vec<String> = report
                        .feature_gates
                        .iter()
                        .map(|f| f.to_lowercase())
                        .collect();
                    if let Some(v) = report
                        .kubevirt_version
                        .as_deref()
                        .and_then(|v| Version::parse(v.trim_start_matches('v')).ok())
                    {
                        for ga in ga_features(&v) {
                            if !features.iter().any(|f| f == ga) {
                                features.push(ga.to_string());
                            }
                        }
                    }

                    let version_changed = report.kubevirt_version.is_some()
                        && report.kubevirt_version != cluster.kubevirt_version;

                    let version = report.kubevirt_version.clone();
                    let storage_classes = report.storage_classes.clone();
                    let default_sc = report.default_storage_class.clone();
                    let cluster_id = cluster.id;
                    self.db
                        .with_tx(move |conn| {
                            let version = version.clone();
                            let features = features.clone();
                            let storage_classes = storage_classes.clone();
                            let default_sc = default_sc.clone();
                            Box::pin(async move {
                                db::clusters::record_probe(
                                    conn,
                                    cluster_id,
                                    health,
                                    version.as_deref(),
                                    &features,
                                    &storage_classes,
                                    default_sc.as_deref(),
                                )
                                .await?;
                                if version_changed {
                                    // schema/capability refresh is async;
                                    // probes must stay cheap
                                    queue::enqueue(
                                        conn,
                                        queue::JobKind::RefreshCapabilities,
                                        cluster_id,
                                        3,
                                    )
                                    .await?;
                                }
                                Ok(())
                            })
                        })
                        .await?;
                    if version_changed {
                        info!(
                            "cluster {} kubevirt version changed to {:?}",
                            cluster.name, report.kubevirt_version
                        );
                    }
                }
                Ok(_) | Err(_) => {
                    let mut counts = self.failure_counts.lock().await;
                    let n = counts.entry(cluster.id).or_insert(0);
                    *n += 1;
                    let health = if *n >= UNREACHABLE_AFTER {
                        ClusterHealth::Unreachable
                    } else {
                        ClusterHealth::Unhealthy
                    };
                    drop(counts);
                    warn!("cluster {} probe failed, marking {}", cluster.name, health);
                    let cluster_id = cluster.id;
                    self.db
                        .with_tx(move |conn| {
                            Box::pin(async move {
                                db::clusters::record_health(conn, cluster_id, health).await
                            })
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }
}
