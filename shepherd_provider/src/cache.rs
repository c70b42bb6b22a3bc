//! Read-mostly per-cluster view of external VMs.
//!
//! The watcher is the only writer; everything else reads snapshots. Reads
//! never block the watcher beyond the brief map lock, and callers get the
//! cache status alongside the data so the boundary can tag stale reads.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::breaker::CircuitBreaker;
use crate::mapping::ExternalVm;

/// Freshness of the cached view.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheStatus {
    /// Watch is live and the view converged
    Healthy,
    /// A full re-list is in flight after a version-too-old signal
    Rebuilding,
    /// Circuit open; data served from the last good view
    Stale,
}

#[derive(Debug, Default)]
struct Inner {
    vms: BTreeMap<(String, String), ExternalVm>,
    rebuilding: bool,
    resource_version: Option<String>,
    last_sync: Option<DateTime<Utc>>,
}

/// Shared handle; clone freely, all clones see one view.
#[derive(Clone, Default)]
pub struct ClusterCache {
    inner: Arc<RwLock<Inner>>,
    breaker: Arc<CircuitBreaker>,
}

impl ClusterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Combined freshness for read responses.
    pub fn status(&self) -> CacheStatus {
        if self.breaker.is_open() {
            return CacheStatus::Stale;
        }
        let g = self.inner.read().unwrap();
        if g.rebuilding {
            // a rebuild serves the previous view, which is stale by definition
            CacheStatus::Rebuilding
        } else {
            CacheStatus::Healthy
        }
    }

    /// Whether writes should be refused with ServiceUnavailable.
    ///
    /// Strong consistency at the write boundary: an open breaker or an
    /// in-flight rebuild means we cannot trust our view of the cluster.
    pub fn writable(&self) -> bool {
        self.status() == CacheStatus::Healthy
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<ExternalVm> {
        let g = self.inner.read().unwrap();
        g.vms.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn snapshot(&self) -> Vec<ExternalVm> {
        let g = self.inner.read().unwrap();
        g.vms.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resource_version(&self) -> Option<String> {
        self.inner.read().unwrap().resource_version.clone()
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.inner.read().unwrap().last_sync
    }

    // ------------------------------------------------------------------
    // Writer interface; only the watcher calls these.

    pub(crate) fn upsert(&self, vm: ExternalVm) {
        let mut g = self.inner.write().unwrap();
        g.vms.insert((vm.namespace.clone(), vm.name.clone()), vm);
    }

    pub(crate) fn remove(&self, namespace: &str, name: &str) {
        let mut g = self.inner.write().unwrap();
        g.vms.remove(&(namespace.to_string(), name.to_string()));
    }

    pub(crate) fn set_resource_version(&self, version: Option<String>) {
        let mut g = self.inner.write().unwrap();
        g.resource_version = version;
    }

    /// Entering a full re-list after a 410; the old view keeps serving.
    pub(crate) fn begin_rebuild(&self) {
        let mut g = self.inner.write().unwrap();
        g.rebuilding = true;
        g.resource_version = None;
    }

    /// Swap in the freshly listed world atomically.
    pub(crate) fn complete_rebuild(&self, vms: Vec<ExternalVm>, version: Option<String>) {
        let mut g = self.inner.write().unwrap();
        g.vms = vms
            .into_iter()
            .map(|vm| ((vm.namespace.clone(), vm.name.clone()), vm))
            .collect();
        g.resource_version = version;
        g.rebuilding = false;
        g.last_sync = Some(Utc::now());
    }

    pub(crate) fn mark_synced(&self) {
        let mut g = self.inner.write().unwrap();
        g.last_sync = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(ns: &str, name: &str) -> ExternalVm {
        ExternalVm {
            name: name.into(),
            namespace: ns.into(),
            uid: format!("uid-{}", name),
            labels: Default::default(),
            power_state: Some("Running".into()),
            ready: true,
            created_at: None,
        }
    }

    #[test]
    fn rebuild_serves_old_view_then_swaps() {
        let cache = ClusterCache::new();
        cache.upsert(vm("ns1", "a"));
        cache.set_resource_version(Some("100".into()));
        assert_eq!(cache.status(), CacheStatus::Healthy);

        cache.begin_rebuild();
        assert_eq!(cache.status(), CacheStatus::Rebuilding);
        assert!(!cache.writable());
        // reads still see the stale entry during the rebuild
        assert!(cache.get("ns1", "a").is_some());
        assert!(cache.resource_version().is_none());

        cache.complete_rebuild(vec![vm("ns1", "b")], Some("200".into()));
        assert_eq!(cache.status(), CacheStatus::Healthy);
        assert!(cache.get("ns1", "a").is_none());
        assert!(cache.get("ns1", "b").is_some());
        assert_eq!(cache.resource_version().as_deref(), Some("200"));
    }

    #[test]
    fn open_breaker_taints_reads_and_blocks_writes() {
        let cache = ClusterCache::new();
        cache.upsert(vm("ns1", "a"));
        for _ in 0..5 {
            cache.breaker().on_failure();
        }
        assert_eq!(cache.status(), CacheStatus::Stale);
        assert!(!cache.writable());
        // the data itself is still available, just tagged
        assert!(cache.get("ns1", "a").is_some());
    }
}
