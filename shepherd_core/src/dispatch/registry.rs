//! Live provider/cache registry, keyed by cluster id.
//!
//! The composition root populates this at startup and the detector swaps
//! entries when a cluster's connection or capabilities change. Lookups
//! are lock-free snapshots from the dispatcher's point of view.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use shepherd_provider::{ClusterCache, Provider};

#[derive(Default)]
struct Inner {
    providers: HashMap<Uuid, Arc<dyn Provider>>,
    caches: HashMap<Uuid, ClusterCache>,
}

#[derive(Default)]
pub struct ProviderRegistry {
    inner: RwLock<Inner>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(&self, cluster_id: Uuid) -> Option<Arc<dyn Provider>> {
        self.inner.read().unwrap().providers.get(&cluster_id).cloned()
    }

    pub fn cache(&self, cluster_id: Uuid) -> Option<ClusterCache> {
        self.inner.read().unwrap().caches.get(&cluster_id).cloned()
    }

    pub fn register(&self, cluster_id: Uuid, provider: Arc<dyn Provider>, cache: ClusterCache) {
        let mut g = self.inner.write().unwrap();
        g.providers.insert(cluster_id, provider);
        g.caches.insert(cluster_id, cache);
    }

    /// Swap the provider only, keeping the cache (and its breaker state).
    pub fn replace_provider(&self, cluster_id: Uuid, provider: Arc<dyn Provider>) {
        let mut g = self.inner.write().unwrap();
        g.providers.insert(cluster_id, provider);
    }

    pub fn deregister(&self, cluster_id: Uuid) {
        let mut g = self.inner.write().unwrap();
        g.providers.remove(&cluster_id);
        g.caches.remove(&cluster_id);
    }

    pub fn cluster_ids(&self) -> Vec<Uuid> {
        self.inner.read().unwrap().providers.keys().copied().collect()
    }
}
