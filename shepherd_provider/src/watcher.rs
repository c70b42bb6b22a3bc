//! The list-watch loop that keeps a [`ClusterCache`] converged.
//!
//! One loop per cluster, spawned as a detached task at startup. The loop
//! owns the cache writer half; everything else reads snapshots.
//!
//! "resource version too old" (410) is normal protocol behaviour after a
//! quiet period or an etcd compaction: the loop clears its version,
//! re-lists, and marks the cache REBUILDING. It is deliberately not
//! counted against the circuit breaker.

use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::ResourceExt;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::sleep;

use crate::cache::ClusterCache;
use crate::mapping::map_vm;
use crate::types::VirtualMachine;
use crate::{Error, Result};

/// Initial reconnect delay after a real failure
const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
/// Reconnect delay cap
const BACKOFF_CEIL: Duration = Duration::from_secs(30);
/// Server-side watch timeout; keeps the loop responsive to shutdown
const WATCH_TIMEOUT_SECS: u32 = 290;

enum CycleEnd {
    /// Watch closed normally; reconnect from the current version
    Closed,
    /// Server signalled version-too-old; full re-list required
    Resync,
    /// Shutdown requested
    Stop,
}

/// Run the watch loop until shutdown. Never returns early on errors; real
/// failures feed the breaker and back off 1s → 30s.
pub async fn run(
    cluster: String,
    api: Api<VirtualMachine>,
    cache: ClusterCache,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("starting watch loop for cluster {}", cluster);
    let mut backoff = BACKOFF_FLOOR;
    loop {
        if *shutdown.borrow() {
            break;
        }
        match cycle(&api, &cache, &mut shutdown).await {
            Ok(CycleEnd::Stop) => break,
            Ok(CycleEnd::Closed) => {
                cache.breaker().on_success();
                backoff = BACKOFF_FLOOR;
            }
            Ok(CycleEnd::Resync) => {
                info!("cluster {}: resource version too old, relisting", cluster);
                cache.begin_rebuild();
                backoff = BACKOFF_FLOOR;
            }
            Err(e) => {
                if cache.breaker().on_failure() {
                    warn!("cluster {}: circuit opened after repeated watch failures", cluster);
                }
                warn!("cluster {}: watch cycle failed: {}, retrying in {:?}", cluster, e, backoff);
                tokio::select! {
                    _ = sleep(backoff) => {}
                    _ = shutdown.changed() => break,
                }
                backoff = (backoff * 2).min(BACKOFF_CEIL);
            }
        }
    }
    info!("watch loop for cluster {} stopped", cluster);
}

async fn cycle(
    api: &Api<VirtualMachine>,
    cache: &ClusterCache,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<CycleEnd> {
    // No version means first start or post-410: list the world and swap it
    // in atomically.
    if cache.resource_version().is_none() {
        let list = api.list(&ListParams::default()).await?;
        let version = list.metadata.resource_version.clone();
        let vms = list
            .items
            .iter()
            .filter_map(|vm| match map_vm(vm) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("skipping unmappable vm during list: {}", e);
                    None
                }
            })
            .collect();
        cache.complete_rebuild(vms, version);
        cache.breaker().on_success();
        debug!("listed {} vms", cache.len());
    }

    let version = cache.resource_version().unwrap_or_default();
    let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
    let mut stream = api.watch(&wp, &version).await?.boxed();

    loop {
        let ev = tokio::select! {
            ev = stream.try_next() => ev?,
            _ = shutdown.changed() => return Ok(CycleEnd::Stop),
        };
        let Some(ev) = ev else {
            // server closed the watch; resume from where we got to
            cache.mark_synced();
            return Ok(CycleEnd::Closed);
        };
        match ev {
            WatchEvent::Added(vm) | WatchEvent::Modified(vm) => {
                let rv = vm.resource_version();
                match map_vm(&vm) {
                    Ok(mapped) => cache.upsert(mapped),
                    Err(e) => warn!("skipping unmappable vm event: {}", e),
                }
                cache.set_resource_version(rv);
            }
            WatchEvent::Deleted(vm) => {
                let rv = vm.resource_version();
                if let (Some(ns), Some(name)) = (vm.namespace(), vm.metadata.name.clone()) {
                    cache.remove(&ns, &name);
                }
                cache.set_resource_version(rv);
            }
            WatchEvent::Bookmark(b) => {
                cache.set_resource_version(Some(b.metadata.resource_version));
            }
            WatchEvent::Error(e) if e.code == 410 => {
                return Ok(CycleEnd::Resync);
            }
            WatchEvent::Error(e) => {
                return Err(Error::Kube(kube::Error::Api(e)));
            }
        }
    }
}
